//! storesync Remote Store Boundary
//!
//! Types and traits the reconciliation core uses to talk to a remote
//! store, independent of any particular transport:
//!
//! - [`error`] - Error taxonomy with transient/conflict/permanent
//!   classification driving the retry and escalation policy
//! - [`record`] - Remote records, result pages, and time windows
//! - [`traits`] - The [`RemoteStore`] capability trait and the
//!   [`StoreProvider`] scoped acquisition trait
//!
//! The actual HTTP client lives behind [`RemoteStore`]; the core never
//! depends on wire details, only on structured key-value payloads and a
//! stable external identifier per record.

pub mod error;
pub mod record;
pub mod traits;

// Re-exports for convenience
pub use error::{ConnectorError, ConnectorResult};
pub use record::{Page, RemoteRecord, TimeWindow};
pub use traits::{RemoteStore, StoreProvider};
