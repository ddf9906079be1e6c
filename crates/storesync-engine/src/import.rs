//! Import engine
//!
//! Pulls a time-windowed batch of remote records for one entity kind and
//! reconciles each against the binding registry: a bound record updates
//! its local counterpart, an unbound record is matched by business key
//! (linking retroactively when the match is unambiguous), and anything
//! unmatched becomes a new local record created atomically with its
//! binding. Per-record failures are isolated: the failing record is
//! checkpointed and the batch carries on.
//!
//! Pages are fetched and applied sequentially per backend and kind, so
//! binding creation is deterministic and the same window can be re-run
//! safely on top of the idempotent per-record handling.

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument};

use storesync_connector::{ConnectorError, RemoteRecord, RemoteStore, TimeWindow};
use storesync_core::{BackendConnection, BackendId, EntityKind};

use crate::binding::{BindingError, BindingRegistry};
use crate::checkpoint::{CheckpointEntry, CheckpointError, CheckpointReason, CheckpointSink};
use crate::local::{LocalStore, LocalStoreError};
use crate::queue::{Job, JobPayload, JobQueue, QueueError};

/// Import errors. Anything surfacing here invalidates the whole batch;
/// per-record problems are checkpointed instead.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Backend configuration rejected before any work started.
    #[error("backend configuration invalid: {0}")]
    InvalidBackend(String),

    /// Remote store error.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Binding registry error.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// Local store error.
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),

    /// Checkpoint sink error.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ImportError {
    /// Whether a retry may help.
    pub fn is_transient(&self) -> bool {
        match self {
            ImportError::Connector(e) => e.is_transient(),
            ImportError::Binding(BindingError::Database(_))
            | ImportError::LocalStore(LocalStoreError::Database(_))
            | ImportError::Checkpoint(CheckpointError::Database(_))
            | ImportError::Queue(QueueError::Database(_)) => true,
            _ => false,
        }
    }
}

/// Result type for import operations.
pub type ImportResult<T> = Result<T, ImportError>;

/// What to do when an already-bound order shows up in a batch again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderUpdatePolicy {
    /// Leave local fields untouched, refresh the sync timestamp only.
    #[default]
    Skip,

    /// Apply the remote payload like any other kind.
    Merge,
}

/// Import engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ImportConfig {
    /// Re-import behavior for already-bound orders.
    pub order_updates: OrderUpdatePolicy,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Remote records seen.
    pub fetched: u32,

    /// New local records created (with bindings).
    pub created: u32,

    /// Bound local records updated.
    pub updated: u32,

    /// Bindings created retroactively for matched local records.
    pub linked: u32,

    /// Records deliberately left untouched (order skip policy).
    pub skipped: u32,

    /// Records that failed and were checkpointed.
    pub failed: u32,

    /// Checkpoints raised during the batch.
    pub checkpoints: u32,
}

impl ImportSummary {
    /// Whether the batch succeeded only partially.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

/// Deterministic partition of external order ids against the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPartition {
    /// Ids that already have a live binding.
    pub already_bound: Vec<String>,

    /// Ids with no local counterpart; the authoritative "to create" list.
    pub needs_create: Vec<String>,
}

enum RecordOutcome {
    Created,
    Updated,
    Linked,
    Skipped,
    Checkpointed,
}

/// Reconciles inbound batches against the local system of record.
#[derive(Clone)]
pub struct ImportEngine {
    registry: BindingRegistry,
    local: LocalStore,
    checkpoints: CheckpointSink,
    queue: JobQueue,
    config: ImportConfig,
}

impl ImportEngine {
    /// Create an import engine over the engine database.
    #[must_use]
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            registry: BindingRegistry::new(pool.clone()),
            local: LocalStore::new(pool.clone()),
            checkpoints: CheckpointSink::new(pool.clone()),
            queue: JobQueue::new(pool),
            config: ImportConfig::default(),
        }
    }

    /// Override the import configuration.
    #[must_use]
    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    /// Enqueue an import-batch job at the kind's dependency priority.
    ///
    /// This is the trigger surface: callers return as soon as the job is
    /// durable, not when remote work completes.
    #[instrument(skip(self, backend), fields(backend_id = %backend.id))]
    pub async fn schedule_import(
        &self,
        backend: &BackendConnection,
        kind: EntityKind,
        window: TimeWindow,
    ) -> ImportResult<Job> {
        backend.validate().map_err(ImportError::InvalidBackend)?;
        let job = self
            .queue
            .enqueue(backend.id, kind, JobPayload::ImportBatch { window })
            .await?;
        Ok(job)
    }

    /// Fetch and reconcile one batch.
    ///
    /// Auth, connectivity, and configuration failures abort the batch and
    /// propagate; everything attributable to a single record checkpoints
    /// and continues.
    #[instrument(skip(self, store, backend), fields(backend_id = %backend.id))]
    pub async fn import_batch(
        &self,
        store: &dyn RemoteStore,
        backend: &BackendConnection,
        kind: EntityKind,
        window: TimeWindow,
    ) -> ImportResult<ImportSummary> {
        backend.validate().map_err(ImportError::InvalidBackend)?;

        let mut summary = ImportSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = store.fetch(kind, &window, cursor.as_deref()).await?;
            for record in &page.records {
                summary.fetched += 1;
                match self.process_record(backend.id, kind, record, &mut summary).await? {
                    RecordOutcome::Created => summary.created += 1,
                    RecordOutcome::Updated => summary.updated += 1,
                    RecordOutcome::Linked => summary.linked += 1,
                    RecordOutcome::Skipped => summary.skipped += 1,
                    RecordOutcome::Checkpointed => summary.failed += 1,
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(
            kind = %kind,
            fetched = summary.fetched,
            created = summary.created,
            updated = summary.updated,
            linked = summary.linked,
            skipped = summary.skipped,
            failed = summary.failed,
            "Import batch finished"
        );
        Ok(summary)
    }

    /// Partition external order ids into already-bound and needs-create.
    ///
    /// Deterministic (input order preserved), exhaustive, and disjoint:
    /// every input id lands in exactly one of the two lists.
    #[instrument(skip(self, records))]
    pub async fn check_existing_orders(
        &self,
        backend_id: BackendId,
        records: &[RemoteRecord],
    ) -> ImportResult<OrderPartition> {
        let mut partition = OrderPartition::default();
        for record in records {
            let bound = self
                .registry
                .find_by_external(backend_id, EntityKind::Order, &record.external_id)
                .await?
                .is_some();
            if bound {
                partition.already_bound.push(record.external_id.clone());
            } else {
                partition.needs_create.push(record.external_id.clone());
            }
        }
        Ok(partition)
    }

    async fn process_record(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        record: &RemoteRecord,
        summary: &mut ImportSummary,
    ) -> ImportResult<RecordOutcome> {
        // Validation failures are per-record: checkpoint and move on.
        if let Err(field) = kind.validate(&record.payload) {
            self.checkpoints
                .raise(
                    CheckpointEntry::new(
                        backend_id,
                        CheckpointReason::ValidationFailed,
                        format!("missing required field: {field}"),
                    )
                    .kind(kind)
                    .external(&record.external_id),
                )
                .await?;
            summary.checkpoints += 1;
            return Ok(RecordOutcome::Checkpointed);
        }

        let now = record.modified_at.unwrap_or_else(chrono::Utc::now);

        // Already bound: update the local side.
        if let Some(binding) = self
            .registry
            .find_by_external(backend_id, kind, &record.external_id)
            .await?
        {
            if kind == EntityKind::Order && self.config.order_updates == OrderUpdatePolicy::Skip {
                self.registry.mark_synced(binding.id, now).await?;
                debug!(external_id = %record.external_id, "Existing order left untouched");
                return Ok(RecordOutcome::Skipped);
            }

            self.local
                .update_payload(binding.local_id, kind, &record.payload)
                .await?;
            self.registry.mark_synced(binding.id, now).await?;
            return Ok(RecordOutcome::Updated);
        }

        // Orders may arrive before the customer they reference; materialize
        // the prerequisite so the order can land.
        if kind == EntityKind::Order {
            self.ensure_customer_prerequisite(backend_id, record, summary)
                .await?;
        }

        // Unbound: match by business key before creating anything.
        if let Some(key) = kind.business_key(&record.payload) {
            if let Some(candidate) = self.local.find_by_business_key(kind, &key).await? {
                match self.registry.find(backend_id, kind, candidate.id).await? {
                    None => {
                        // Unambiguous pre-existing local record: link it.
                        match self
                            .registry
                            .create_bound(backend_id, kind, candidate.id, &record.external_id, now)
                            .await
                        {
                            Ok(_) => {
                                info!(
                                    external_id = %record.external_id,
                                    local_id = %candidate.id,
                                    "Linked existing local record"
                                );
                                return Ok(RecordOutcome::Linked);
                            }
                            Err(BindingError::Duplicate { .. }) => {
                                return self
                                    .escalate(
                                        backend_id,
                                        kind,
                                        record,
                                        summary,
                                        format!(
                                            "local record {} raced into another binding",
                                            candidate.id
                                        ),
                                    )
                                    .await;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Some(existing) => {
                        // The matched local record is already bound to a
                        // different external record.
                        return self
                            .escalate(
                                backend_id,
                                kind,
                                record,
                                summary,
                                format!(
                                    "business key {key} matches local record {} already bound to {}",
                                    existing.local_id,
                                    existing.external_id.as_deref().unwrap_or("<pending>")
                                ),
                            )
                            .await;
                    }
                }
            }
        }

        // No match anywhere: create the local record and its binding as a
        // pair.
        match self
            .registry
            .create_with_local(backend_id, kind, record.payload.clone(), &record.external_id, now)
            .await
        {
            Ok(_) => Ok(RecordOutcome::Created),
            Err(BindingError::Duplicate { .. }) => {
                self.escalate(
                    backend_id,
                    kind,
                    record,
                    summary,
                    "external id claimed concurrently".to_string(),
                )
                .await
            }
            Err(BindingError::LocalStore(LocalStoreError::Database(e)))
                if is_unique_violation(&e) =>
            {
                self.escalate(
                    backend_id,
                    kind,
                    record,
                    summary,
                    "business key claimed concurrently".to_string(),
                )
                .await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a stub customer when an order references one that does not
    /// exist locally yet; the customer import links it retroactively by
    /// business key later.
    async fn ensure_customer_prerequisite(
        &self,
        backend_id: BackendId,
        record: &RemoteRecord,
        summary: &mut ImportSummary,
    ) -> ImportResult<()> {
        let Some(email) = record
            .payload
            .get("customer_email")
            .and_then(|v| v.as_str())
            .map(str::trim)
        else {
            return Ok(());
        };

        if email.is_empty() {
            self.checkpoints
                .raise(
                    CheckpointEntry::new(
                        backend_id,
                        CheckpointReason::MissingPrerequisite,
                        "order references a customer with no usable email",
                    )
                    .kind(EntityKind::Order)
                    .external(&record.external_id),
                )
                .await?;
            summary.checkpoints += 1;
            return Ok(());
        }

        if self
            .local
            .find_by_business_key(EntityKind::Customer, email)
            .await?
            .is_some()
        {
            return Ok(());
        }

        match self
            .local
            .insert(EntityKind::Customer, json!({ "email": email }), true)
            .await
        {
            Ok(stub) => {
                info!(
                    customer = %email,
                    local_id = %stub.id,
                    order = %record.external_id,
                    "Created missing customer prerequisite"
                );
                Ok(())
            }
            // A concurrent batch materialized it first.
            Err(LocalStoreError::Database(e)) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn escalate(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        record: &RemoteRecord,
        summary: &mut ImportSummary,
        message: String,
    ) -> ImportResult<RecordOutcome> {
        self.checkpoints
            .raise(
                CheckpointEntry::new(backend_id, CheckpointReason::AmbiguousMatch, message)
                    .kind(kind)
                    .external(&record.external_id),
            )
            .await?;
        summary.checkpoints += 1;
        Ok(RecordOutcome::Checkpointed)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use storesync_connector::{ConnectorResult, Page};

    /// Serves a fixed list of records one page at a time.
    struct PagedStore {
        pages: Vec<Vec<RemoteRecord>>,
    }

    #[async_trait]
    impl RemoteStore for PagedStore {
        fn display_name(&self) -> &str {
            "paged"
        }

        async fn ping(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn fetch(
            &self,
            _kind: EntityKind,
            _window: &TimeWindow,
            cursor: Option<&str>,
        ) -> ConnectorResult<Page> {
            let index: usize = cursor.map_or(0, |c| c.parse().unwrap_or(0));
            let records = self.pages.get(index).cloned().unwrap_or_default();
            let mut page = Page::with_records(records);
            if index + 1 < self.pages.len() {
                page = page.with_next((index + 1).to_string());
            }
            Ok(page)
        }

        async fn create(
            &self,
            _kind: EntityKind,
            _payload: &serde_json::Value,
        ) -> ConnectorResult<String> {
            unimplemented!("import tests never create remotely")
        }

        async fn update(
            &self,
            _kind: EntityKind,
            _external_id: &str,
            _payload: &serde_json::Value,
        ) -> ConnectorResult<()> {
            unimplemented!("import tests never update remotely")
        }

        async fn find_by_key(
            &self,
            _kind: EntityKind,
            _business_key: &str,
        ) -> ConnectorResult<Option<String>> {
            Ok(None)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: ImportEngine,
        registry: BindingRegistry,
        local: LocalStore,
        checkpoints: CheckpointSink,
        backend: BackendConnection,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("test.db")).await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        Fixture {
            _dir: dir,
            engine: ImportEngine::new(pool.clone()),
            registry: BindingRegistry::new(pool.clone()),
            local: LocalStore::new(pool.clone()),
            checkpoints: CheckpointSink::new(pool),
            backend: BackendConnection::new("shop", "https://shop.example.com", "ck", "cs"),
        }
    }

    fn product(external_id: &str, sku: &str) -> RemoteRecord {
        RemoteRecord::new(external_id, json!({"sku": sku, "name": sku}))
    }

    #[tokio::test]
    async fn test_unmatched_records_create_local_pairs() {
        let f = fixture().await;
        let store = PagedStore {
            pages: vec![
                vec![product("ext-1", "A"), product("ext-2", "B")],
                vec![product("ext-3", "C")],
            ],
        };

        let summary = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();

        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.created, 3);
        assert!(!summary.is_partial());
        assert_eq!(f.registry.count_for_backend(f.backend.id).await.unwrap(), 3);
        assert!(f
            .local
            .find_by_business_key(EntityKind::Product, "B")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_reimport_same_window_is_idempotent() {
        let f = fixture().await;
        let store = PagedStore {
            pages: vec![vec![product("ext-1", "A"), product("ext-2", "B")]],
        };

        let first = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();
        assert_eq!(first.created, 2);

        let second = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(f.registry.count_for_backend(f.backend.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_business_key_match_links_retroactively() {
        let f = fixture().await;
        let existing = f
            .local
            .insert(EntityKind::Product, json!({"sku": "A", "name": "Local A"}), true)
            .await
            .unwrap();

        let store = PagedStore {
            pages: vec![vec![product("ext-1", "A")]],
        };
        let summary = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();

        assert_eq!(summary.linked, 1);
        assert_eq!(summary.created, 0);
        let binding = f
            .registry
            .find(f.backend.id, EntityKind::Product, existing.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_invalid_record_is_isolated() {
        let f = fixture().await;
        let store = PagedStore {
            pages: vec![vec![
                product("ext-1", "A"),
                RemoteRecord::new("ext-bad", json!({"name": "no sku"})),
                product("ext-3", "C"),
            ]],
        };

        let summary = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();

        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_partial());

        let checkpoints = f.checkpoints.recent(f.backend.id, 10).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].reason, CheckpointReason::ValidationFailed);
        assert_eq!(checkpoints[0].external_id.as_deref(), Some("ext-bad"));
    }

    #[tokio::test]
    async fn test_ambiguous_match_is_checkpointed() {
        let f = fixture().await;
        let local = f
            .local
            .insert(EntityKind::Product, json!({"sku": "A", "name": "A"}), true)
            .await
            .unwrap();
        f.registry
            .create_bound(f.backend.id, EntityKind::Product, local.id, "ext-old", chrono::Utc::now())
            .await
            .unwrap();

        // New external record claims the same sku.
        let store = PagedStore {
            pages: vec![vec![product("ext-new", "A")]],
        };
        let summary = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        let checkpoints = f.checkpoints.recent(f.backend.id, 10).await.unwrap();
        assert_eq!(checkpoints[0].reason, CheckpointReason::AmbiguousMatch);
    }

    #[tokio::test]
    async fn test_order_skip_policy_leaves_local_untouched() {
        let f = fixture().await;
        let store = PagedStore {
            pages: vec![vec![RemoteRecord::new(
                "ext-o1",
                json!({"number": "100", "total": "10.00"}),
            )]],
        };
        f.engine
            .import_batch(&store, &f.backend, EntityKind::Order, TimeWindow::all())
            .await
            .unwrap();

        // Re-import with a changed total; Skip policy keeps local fields.
        let store = PagedStore {
            pages: vec![vec![RemoteRecord::new(
                "ext-o1",
                json!({"number": "100", "total": "99.00"}),
            )]],
        };
        let summary = f
            .engine
            .import_batch(&store, &f.backend, EntityKind::Order, TimeWindow::all())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);

        let local = f
            .local
            .find_by_business_key(EntityKind::Order, "100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.payload["total"], "10.00");
    }

    #[tokio::test]
    async fn test_order_merge_policy_applies_payload() {
        let f = fixture().await;
        let engine = f.engine.clone().with_config(ImportConfig {
            order_updates: OrderUpdatePolicy::Merge,
        });

        let store = PagedStore {
            pages: vec![vec![RemoteRecord::new(
                "ext-o1",
                json!({"number": "100", "total": "10.00"}),
            )]],
        };
        engine
            .import_batch(&store, &f.backend, EntityKind::Order, TimeWindow::all())
            .await
            .unwrap();

        let store = PagedStore {
            pages: vec![vec![RemoteRecord::new(
                "ext-o1",
                json!({"number": "100", "total": "99.00"}),
            )]],
        };
        let summary = engine
            .import_batch(&store, &f.backend, EntityKind::Order, TimeWindow::all())
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let local = f
            .local
            .find_by_business_key(EntityKind::Order, "100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.payload["total"], "99.00");
    }

    #[tokio::test]
    async fn test_order_creates_missing_customer_stub() {
        let f = fixture().await;
        let store = PagedStore {
            pages: vec![vec![RemoteRecord::new(
                "ext-o1",
                json!({"number": "100", "customer_email": "new@example.com"}),
            )]],
        };

        f.engine
            .import_batch(&store, &f.backend, EntityKind::Order, TimeWindow::all())
            .await
            .unwrap();

        let stub = f
            .local
            .find_by_business_key(EntityKind::Customer, "new@example.com")
            .await
            .unwrap();
        assert!(stub.is_some(), "prerequisite customer must be materialized");
    }

    #[tokio::test]
    async fn test_order_partition_is_exhaustive_and_disjoint() {
        let f = fixture().await;
        let records: Vec<RemoteRecord> = (0..5)
            .map(|i| RemoteRecord::new(format!("ext-{i}"), json!({"number": i.to_string()})))
            .collect();

        // Bind two of the five.
        for record in records.iter().take(2) {
            f.registry
                .create_with_local(
                    f.backend.id,
                    EntityKind::Order,
                    record.payload.clone(),
                    &record.external_id,
                    chrono::Utc::now(),
                )
                .await
                .unwrap();
        }

        let partition = f
            .engine
            .check_existing_orders(f.backend.id, &records)
            .await
            .unwrap();

        assert_eq!(partition.already_bound, vec!["ext-0", "ext-1"]);
        assert_eq!(partition.needs_create, vec!["ext-2", "ext-3", "ext-4"]);
        assert_eq!(
            partition.already_bound.len() + partition.needs_create.len(),
            records.len()
        );
        assert!(partition
            .already_bound
            .iter()
            .all(|id| !partition.needs_create.contains(id)));
    }

    #[tokio::test]
    async fn test_invalid_backend_fails_synchronously() {
        let f = fixture().await;
        let mut backend = f.backend.clone();
        backend.location = "not-a-url".to_string();

        let store = PagedStore { pages: vec![] };
        let err = f
            .engine
            .import_batch(&store, &backend, EntityKind::Product, TimeWindow::all())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidBackend(_)));
    }
}
