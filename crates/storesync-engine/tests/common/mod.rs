//! Shared test fixtures: a scriptable mock remote store and helpers for
//! building an engine database, backend directory, and store provider.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use storesync_connector::{
    ConnectorError, ConnectorResult, Page, RemoteRecord, RemoteStore, StoreProvider, TimeWindow,
};
use storesync_core::{BackendConnection, BackendId, EntityKind};
use storesync_engine::db;

/// A remote store whose behavior is scripted per test: canned fetch
/// pages, queued create failures, a business-key index for idempotency
/// probes, and call counters throughout.
#[derive(Default)]
pub struct MockStore {
    pages: Mutex<HashMap<EntityKind, Vec<Vec<RemoteRecord>>>>,
    known_keys: Mutex<HashMap<(EntityKind, String), String>>,
    create_failures: Mutex<VecDeque<ConnectorError>>,
    update_failures: Mutex<VecDeque<ConnectorError>>,
    call_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,

    pub fetch_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    /// (kind, external_id, payload) for every successful create.
    pub created: Mutex<Vec<(EntityKind, String, serde_json::Value)>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve these records for a kind, split into pages.
    pub fn with_pages(self, kind: EntityKind, pages: Vec<Vec<RemoteRecord>>) -> Self {
        self.pages.lock().unwrap().insert(kind, pages);
        self
    }

    /// Serve these records for a kind as one page.
    pub fn with_records(self, kind: EntityKind, records: Vec<RemoteRecord>) -> Self {
        self.with_pages(kind, vec![records])
    }

    /// Queue errors returned by successive create calls before any
    /// succeed.
    pub fn with_create_failures(self, failures: Vec<ConnectorError>) -> Self {
        *self.create_failures.lock().unwrap() = failures.into();
        self
    }

    /// Queue errors returned by successive update calls.
    pub fn with_update_failures(self, failures: Vec<ConnectorError>) -> Self {
        *self.update_failures.lock().unwrap() = failures.into();
        self
    }

    /// Pretend the store already holds a record under this business key.
    pub fn with_known_key(self, kind: EntityKind, key: &str, external_id: &str) -> Self {
        self.known_keys
            .lock()
            .unwrap()
            .insert((kind, key.to_string()), external_id.to_string());
        self
    }

    /// Sleep this long inside every call; used to trip job timeouts.
    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock().unwrap() = Some(delay);
        self
    }

    async fn maybe_sleep(&self) {
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    fn display_name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn fetch(
        &self,
        kind: EntityKind,
        _window: &TimeWindow,
        cursor: Option<&str>,
    ) -> ConnectorResult<Page> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_sleep().await;

        let index: usize = cursor.map_or(0, |c| c.parse().unwrap_or(0));
        let pages = self.pages.lock().unwrap();
        let kind_pages = pages.get(&kind);
        let records = kind_pages
            .and_then(|p| p.get(index))
            .cloned()
            .unwrap_or_default();
        let mut page = Page::with_records(records);
        if kind_pages.is_some_and(|p| index + 1 < p.len()) {
            page = page.with_next((index + 1).to_string());
        }
        Ok(page)
    }

    async fn create(
        &self,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> ConnectorResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_sleep().await;

        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let external_id = format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        if let Some(key) = kind.business_key(payload) {
            self.known_keys
                .lock()
                .unwrap()
                .insert((kind, key), external_id.clone());
        }
        self.created
            .lock()
            .unwrap()
            .push((kind, external_id.clone(), payload.clone()));
        Ok(external_id)
    }

    async fn update(
        &self,
        _kind: EntityKind,
        _external_id: &str,
        _payload: &serde_json::Value,
    ) -> ConnectorResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_sleep().await;

        if let Some(err) = self.update_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }

    async fn find_by_key(
        &self,
        kind: EntityKind,
        business_key: &str,
    ) -> ConnectorResult<Option<String>> {
        Ok(self
            .known_keys
            .lock()
            .unwrap()
            .get(&(kind, business_key.to_string()))
            .cloned())
    }
}

/// Provider handing out the one mock store, counting opens.
pub struct MockProvider {
    pub store: Arc<MockStore>,
    pub open_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(store: Arc<MockStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            open_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StoreProvider for MockProvider {
    async fn open(&self, backend: &BackendConnection) -> ConnectorResult<Arc<dyn RemoteStore>> {
        backend
            .validate()
            .map_err(ConnectorError::invalid_configuration)?;
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

/// A fresh engine database in a temp directory.
pub async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect(&dir.path().join("engine.db")).await.unwrap();
    db::init_schema(&pool).await.unwrap();
    (dir, pool)
}

/// A valid backend connection for tests.
pub fn test_backend() -> BackendConnection {
    BackendConnection::new("test-shop", "https://shop.example.com", "ck_test", "cs_test")
}

/// Directory resolving exactly this backend.
pub fn directory_for(backend: &BackendConnection) -> Arc<HashMap<BackendId, BackendConnection>> {
    Arc::new([(backend.id, backend.clone())].into_iter().collect())
}
