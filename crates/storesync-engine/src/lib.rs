//! # storesync Engine
//!
//! The reconciliation core: keeps records in a local system of record and
//! their counterparts in a remote store eventually consistent without
//! duplicating or losing records.
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ Trigger surface │────►│  Job Queue   │────►│  Sync Worker  │
//! │ (CLI/scheduler) │     │  (durable)   │     │               │
//! └─────────────────┘     └──────────────┘     └───────┬───────┘
//!                                                      │
//!                         ┌────────────────────────────┼────────────────┐
//!                         │                            ▼                │
//!                    ┌──────────┐              ┌───────────────┐   ┌──────────┐
//!                    │ Binding  │◄────────────►│ Import/Export │──►│  Remote  │
//!                    │ Registry │              │    Engines    │   │  Store   │
//!                    └──────────┘              └───────┬───────┘   └──────────┘
//!                                                      │
//!                         ┌──────────────┐             │
//!                         │  Checkpoint  │◄────────────┘
//!                         │     Sink     │   (on ambiguity/exhaustion)
//!                         └──────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Uniqueness**: one live binding per (backend, kind, local record)
//!   and per (backend, kind, external id), enforced by unique indexes.
//! - **Idempotency**: jobs are delivered at least once; re-running an
//!   already-applied export detects the existing binding and updates
//!   instead of creating a duplicate.
//! - **Isolation**: per-record failures checkpoint and the batch carries
//!   on; only auth/configuration failures abort a batch.
//! - **Ordering**: job priority encodes entity dependency order
//!   (categories before products, customers before orders) as a
//!   preference; dependent handlers still tolerate missing prerequisites.

pub mod binding;
pub mod checkpoint;
pub mod db;
pub mod export;
pub mod import;
pub mod local;
pub mod queue;
pub mod worker;

// Re-exports for convenience
pub use binding::{Binding, BindingError, BindingRegistry, BindingResult, ClaimOutcome, SyncState};
pub use checkpoint::{
    Checkpoint, CheckpointEntry, CheckpointError, CheckpointReason, CheckpointResult,
    CheckpointSink,
};
pub use export::{ExportEngine, ExportError, ExportJobOutcome, ExportResult, ExportSummary};
pub use import::{
    ImportConfig, ImportEngine, ImportError, ImportResult, ImportSummary, OrderPartition,
    OrderUpdatePolicy,
};
pub use local::{LocalRecord, LocalStore, LocalStoreError, LocalStoreResult};
pub use queue::{
    ExportAction, FailOutcome, Job, JobAttempt, JobPayload, JobQueue, JobState, QueueError,
    QueueResult, QueueStats, RetryPolicy,
};
pub use worker::{DrainStats, SyncWorker, WorkerConfig};
