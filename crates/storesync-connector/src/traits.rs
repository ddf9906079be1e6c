//! Remote store traits
//!
//! Capability-based trait definitions for the remote side of the sync.

use std::sync::Arc;

use async_trait::async_trait;

use storesync_core::{BackendConnection, EntityKind};

use crate::error::ConnectorResult;
use crate::record::{Page, TimeWindow};

/// A handle to one remote store.
///
/// Implementations wrap the actual transport (REST client, test double).
/// All payloads are structured JSON values; the only identity the core
/// relies on is the stable `external_id` string assigned by the store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Display name for this store instance.
    fn display_name(&self) -> &str;

    /// Test the connection to the remote store.
    ///
    /// Auth and connectivity failures surface here synchronously, before
    /// any batch work is attempted.
    async fn ping(&self) -> ConnectorResult<()>;

    /// Fetch one page of records of a kind modified within the window.
    ///
    /// Pass `cursor: None` for the first page and the returned
    /// `next_cursor` for each following page. Page order is stable, so a
    /// window can be re-fetched from the start after an interruption.
    async fn fetch(
        &self,
        kind: EntityKind,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> ConnectorResult<Page>;

    /// Create a record in the remote store.
    ///
    /// Returns the external identifier assigned by the store. A duplicate
    /// is reported as [`ConnectorError::RecordAlreadyExists`], which the
    /// caller escalates instead of retrying.
    ///
    /// [`ConnectorError::RecordAlreadyExists`]: crate::error::ConnectorError::RecordAlreadyExists
    async fn create(
        &self,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> ConnectorResult<String>;

    /// Update an existing remote record.
    async fn update(
        &self,
        kind: EntityKind,
        external_id: &str,
        payload: &serde_json::Value,
    ) -> ConnectorResult<()>;

    /// Look up a record by its business key.
    ///
    /// Used by create retries to detect "already applied remotely" after
    /// an abandoned call, converting a would-be duplicate create into an
    /// update. Returns the external id when exactly one record matches.
    async fn find_by_key(
        &self,
        kind: EntityKind,
        business_key: &str,
    ) -> ConnectorResult<Option<String>>;
}

/// Scoped acquisition of remote store handles.
///
/// The engines open a handle per batch and the worker opens one per job
/// run; the handle is dropped when that unit of work finishes and is
/// never held across job boundaries.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Open a store handle for a backend.
    ///
    /// Validates the connection configuration; configuration errors are
    /// returned here, before any batch work starts.
    async fn open(&self, backend: &BackendConnection) -> ConnectorResult<Arc<dyn RemoteStore>>;
}
