//! Export engine
//!
//! Selects local records matching a domain filter, claims or observes a
//! binding for each, and enqueues exactly one job per record: a
//! create-class job for a fresh `PendingExport` binding, an update-class
//! job otherwise. Binding creation is exclusive, so two concurrent export
//! calls over the same unbound record produce one binding and one create
//! job; the loser enqueues an update.
//!
//! The job runner is idempotent under at-least-once delivery: a re-run
//! create detects the already-confirmed binding (or probes the remote
//! store by business key after an abandoned call) and converts itself
//! into an update instead of duplicating the record. Remote conflicts are
//! never retried; they escalate to the checkpoint sink.

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use storesync_connector::{ConnectorError, RemoteStore};
use storesync_core::{BackendConnection, DomainFilter, EntityKind, JobId};

use crate::binding::{Binding, BindingError, BindingRegistry, ClaimOutcome};
use crate::checkpoint::{CheckpointEntry, CheckpointError, CheckpointReason, CheckpointSink};
use crate::local::{LocalRecord, LocalStore, LocalStoreError};
use crate::queue::{ExportAction, Job, JobPayload, JobQueue, QueueError};

/// Export errors.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The domain filter selected nothing; user-visible, non-retryable.
    #[error("no records to export for kind {kind}")]
    NoRecords { kind: EntityKind },

    /// Backend configuration rejected before any work started.
    #[error("backend configuration invalid: {0}")]
    InvalidBackend(String),

    /// The job handed to the runner is not an export job.
    #[error("job {0} is not an export job")]
    NotAnExportJob(JobId),

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

impl ExportError {
    /// Whether a retry may help.
    pub fn is_transient(&self) -> bool {
        match self {
            ExportError::Connector(e) => e.is_transient(),
            ExportError::Binding(BindingError::Database(_))
            | ExportError::LocalStore(LocalStoreError::Database(_))
            | ExportError::Checkpoint(CheckpointError::Database(_))
            | ExportError::Queue(QueueError::Database(_)) => true,
            _ => false,
        }
    }
}

/// Result type for export operations.
pub type ExportResult<T> = Result<T, ExportError>;

/// Summary of an export trigger call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Local records the domain filter selected.
    pub selected: u32,

    /// Create-class jobs enqueued (fresh bindings).
    pub creates_enqueued: u32,

    /// Update-class jobs enqueued (existing bindings).
    pub updates_enqueued: u32,
}

/// Outcome of one export job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportJobOutcome {
    /// The remote side now reflects the local record.
    Applied { external_id: String },

    /// A transient condition; the queue should retry with backoff.
    Deferred { reason: String },

    /// A conflict was checkpointed; the job must not be retried.
    Escalated { reason: String },
}

/// Pushes local records to the remote store through the job queue.
#[derive(Clone)]
pub struct ExportEngine {
    registry: BindingRegistry,
    local: LocalStore,
    checkpoints: CheckpointSink,
    queue: JobQueue,
}

impl ExportEngine {
    /// Create an export engine over the engine database.
    #[must_use]
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            registry: BindingRegistry::new(pool.clone()),
            local: LocalStore::new(pool.clone()),
            checkpoints: CheckpointSink::new(pool.clone()),
            queue: JobQueue::new(pool),
        }
    }

    /// Select and enqueue. Returns once every job is durable; remote
    /// writes happen asynchronously in the job runner.
    #[instrument(skip(self, backend, filter), fields(backend_id = %backend.id))]
    pub async fn export(
        &self,
        backend: &BackendConnection,
        kind: EntityKind,
        filter: &DomainFilter,
    ) -> ExportResult<ExportSummary> {
        backend.validate().map_err(ExportError::InvalidBackend)?;

        let records = self.local.select(kind, filter).await?;
        if records.is_empty() {
            return Err(ExportError::NoRecords { kind });
        }

        let mut summary = ExportSummary {
            selected: records.len() as u32,
            ..ExportSummary::default()
        };

        for record in records {
            match self
                .registry
                .claim_for_export(backend.id, kind, record.id)
                .await?
            {
                ClaimOutcome::Created(binding) => {
                    self.queue
                        .enqueue(
                            backend.id,
                            kind,
                            JobPayload::ExportRecord {
                                binding_id: binding.id,
                                action: ExportAction::Create,
                            },
                        )
                        .await?;
                    summary.creates_enqueued += 1;
                }
                ClaimOutcome::Existing(binding) => {
                    self.queue
                        .enqueue(
                            backend.id,
                            kind,
                            JobPayload::ExportRecord {
                                binding_id: binding.id,
                                action: ExportAction::Update,
                            },
                        )
                        .await?;
                    summary.updates_enqueued += 1;
                }
            }
        }

        info!(
            kind = %kind,
            selected = summary.selected,
            creates = summary.creates_enqueued,
            updates = summary.updates_enqueued,
            "Export enqueued"
        );
        Ok(summary)
    }

    /// Execute one export job against the remote store.
    ///
    /// Safe to run twice with the same payload: an already-applied create
    /// resolves to an update, never a duplicate.
    #[instrument(skip(self, store, job), fields(job_id = %job.id))]
    pub async fn run_job(
        &self,
        store: &dyn RemoteStore,
        job: &Job,
    ) -> ExportResult<ExportJobOutcome> {
        let JobPayload::ExportRecord { binding_id, action } = &job.payload else {
            return Err(ExportError::NotAnExportJob(job.id));
        };

        let binding = self.registry.get(*binding_id).await?;
        let local = self.local.get(binding.local_id).await?;

        match action {
            ExportAction::Create => self.run_create(store, job, binding, &local).await,
            ExportAction::Update => self.run_update(store, job, binding, &local).await,
        }
    }

    async fn run_create(
        &self,
        store: &dyn RemoteStore,
        job: &Job,
        binding: Binding,
        local: &LocalRecord,
    ) -> ExportResult<ExportJobOutcome> {
        // An earlier attempt may already have confirmed the external id.
        if let Some(external_id) = binding.external_id.clone() {
            debug!(external_id = %external_id, "Create already confirmed, updating instead");
            return self.apply_update(store, job, &binding, local, &external_id).await;
        }

        // An abandoned call may have applied remotely without us seeing
        // the response; probe by business key before creating.
        if let Some(key) = binding.kind.business_key(&local.payload) {
            match store.find_by_key(binding.kind, &key).await {
                Ok(Some(external_id)) => {
                    info!(
                        external_id = %external_id,
                        "Create already applied remotely, converting to update"
                    );
                    match self
                        .registry
                        .confirm_external(binding.id, &external_id, Utc::now())
                        .await
                    {
                        Ok(_) => {
                            return self
                                .apply_update(store, job, &binding, local, &external_id)
                                .await;
                        }
                        Err(BindingError::Duplicate { .. }) => {
                            return self
                                .escalate(
                                    job,
                                    &binding,
                                    Some(&external_id),
                                    format!("external id {external_id} already claimed by another binding"),
                                )
                                .await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    return Ok(ExportJobOutcome::Deferred {
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.registry.mark_syncing(binding.id).await?;
        match store.create(binding.kind, &local.payload).await {
            Ok(external_id) => {
                match self
                    .registry
                    .confirm_external(binding.id, &external_id, Utc::now())
                    .await
                {
                    Ok(_) => {
                        info!(external_id = %external_id, "Created remote record");
                        Ok(ExportJobOutcome::Applied { external_id })
                    }
                    Err(BindingError::Duplicate { .. }) => {
                        self.escalate(
                            job,
                            &binding,
                            Some(&external_id),
                            format!(
                                "external id {external_id} already claimed by another binding"
                            ),
                        )
                        .await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) if e.is_conflict() => {
                self.escalate(job, &binding, None, e.to_string()).await
            }
            Err(e) if e.is_transient() => {
                self.registry
                    .mark_stale(binding.id, Some(&e.to_string()))
                    .await?;
                Ok(ExportJobOutcome::Deferred {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                self.registry
                    .mark_stale(binding.id, Some(&e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn run_update(
        &self,
        store: &dyn RemoteStore,
        job: &Job,
        binding: Binding,
        local: &LocalRecord,
    ) -> ExportResult<ExportJobOutcome> {
        let Some(external_id) = binding.external_id.clone() else {
            // The create job for this binding has not confirmed yet.
            return Ok(ExportJobOutcome::Deferred {
                reason: "binding has no external id yet".to_string(),
            });
        };
        self.apply_update(store, job, &binding, local, &external_id).await
    }

    async fn apply_update(
        &self,
        store: &dyn RemoteStore,
        job: &Job,
        binding: &Binding,
        local: &LocalRecord,
        external_id: &str,
    ) -> ExportResult<ExportJobOutcome> {
        self.registry.mark_syncing(binding.id).await?;
        match store.update(binding.kind, external_id, &local.payload).await {
            Ok(()) => {
                self.registry.mark_synced(binding.id, Utc::now()).await?;
                Ok(ExportJobOutcome::Applied {
                    external_id: external_id.to_string(),
                })
            }
            Err(e)
                if e.is_conflict() || matches!(e, ConnectorError::RecordNotFound { .. }) =>
            {
                // The remote record moved under us; a matching ambiguity,
                // not a transient fault.
                self.escalate(job, binding, Some(external_id), e.to_string())
                    .await
            }
            Err(e) if e.is_transient() => {
                self.registry
                    .mark_stale(binding.id, Some(&e.to_string()))
                    .await?;
                Ok(ExportJobOutcome::Deferred {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                self.registry
                    .mark_stale(binding.id, Some(&e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn escalate(
        &self,
        job: &Job,
        binding: &Binding,
        external_id: Option<&str>,
        reason: String,
    ) -> ExportResult<ExportJobOutcome> {
        self.registry.mark_stale(binding.id, Some(&reason)).await?;

        let mut entry = CheckpointEntry::new(
            binding.backend_id,
            CheckpointReason::ExternalConflict,
            reason.clone(),
        )
        .kind(binding.kind)
        .local(binding.local_id)
        .job(job.id);
        if let Some(id) = external_id.or(binding.external_id.as_deref()) {
            entry = entry.external(id);
        }
        self.checkpoints.raise(entry).await?;

        Ok(ExportJobOutcome::Escalated { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use storesync_connector::{ConnectorResult, Page, TimeWindow};
    use storesync_core::BackendId;

    use crate::binding::SyncState;
    use crate::queue::JobState;

    /// Mock store with scripted create behavior and call counters.
    #[derive(Default)]
    struct ScriptedStore {
        create_calls: AtomicUsize,
        update_calls: AtomicUsize,
        /// Errors returned by successive create calls before succeeding.
        create_failures: Mutex<Vec<ConnectorError>>,
        /// Business keys the store already holds, mapped to external ids.
        known_keys: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedStore {
        fn with_create_failures(failures: Vec<ConnectorError>) -> Self {
            Self {
                create_failures: Mutex::new(failures),
                ..Self::default()
            }
        }

        fn knowing(key: &str, external_id: &str) -> Self {
            Self {
                known_keys: Mutex::new(vec![(key.to_string(), external_id.to_string())]),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        fn display_name(&self) -> &str {
            "scripted"
        }

        async fn ping(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn fetch(
            &self,
            _kind: EntityKind,
            _window: &TimeWindow,
            _cursor: Option<&str>,
        ) -> ConnectorResult<Page> {
            Ok(Page::empty())
        }

        async fn create(
            &self,
            _kind: EntityKind,
            payload: &serde_json::Value,
        ) -> ConnectorResult<String> {
            let call = self.create_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.create_failures.lock().unwrap().pop() {
                return Err(err);
            }
            let sku = payload.get("sku").and_then(|v| v.as_str()).unwrap_or("x");
            Ok(format!("ext-{sku}-{call}"))
        }

        async fn update(
            &self,
            _kind: EntityKind,
            _external_id: &str,
            _payload: &serde_json::Value,
        ) -> ConnectorResult<()> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn find_by_key(
            &self,
            _kind: EntityKind,
            business_key: &str,
        ) -> ConnectorResult<Option<String>> {
            Ok(self
                .known_keys
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == business_key)
                .map(|(_, v)| v.clone()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: ExportEngine,
        registry: BindingRegistry,
        local: LocalStore,
        queue: JobQueue,
        checkpoints: CheckpointSink,
        backend: BackendConnection,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("test.db")).await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        Fixture {
            _dir: dir,
            engine: ExportEngine::new(pool.clone()),
            registry: BindingRegistry::new(pool.clone()),
            local: LocalStore::new(pool.clone()),
            queue: JobQueue::new(pool.clone()),
            checkpoints: CheckpointSink::new(pool),
            backend: BackendConnection::new("shop", "https://shop.example.com", "ck", "cs"),
        }
    }

    async fn seed_products(f: &Fixture, count: usize) {
        for i in 0..count {
            f.local
                .insert(
                    EntityKind::Product,
                    json!({"sku": format!("P-{i}"), "name": format!("P {i}"), "active": true}),
                    true,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_selection_is_user_visible_error() {
        let f = fixture().await;
        let err = f
            .engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NoRecords { .. }));
    }

    #[tokio::test]
    async fn test_export_creates_pending_bindings_and_jobs() {
        let f = fixture().await;
        seed_products(&f, 3).await;

        let summary = f
            .engine
            .export(
                &f.backend,
                EntityKind::Product,
                &DomainFilter::field("active", true),
            )
            .await
            .unwrap();

        assert_eq!(summary.selected, 3);
        assert_eq!(summary.creates_enqueued, 3);
        assert_eq!(summary.updates_enqueued, 0);

        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings.len(), 3);
        assert!(bindings.iter().all(|b| b.state == SyncState::PendingExport));

        let jobs = f.queue.jobs_for_backend(f.backend.id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs
            .iter()
            .all(|j| j.priority == EntityKind::Product.priority()));
    }

    #[tokio::test]
    async fn test_second_export_enqueues_only_updates() {
        let f = fixture().await;
        seed_products(&f, 2).await;

        let first = f
            .engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();
        assert_eq!(first.creates_enqueued, 2);

        let second = f
            .engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();
        assert_eq!(second.creates_enqueued, 0);
        assert_eq!(second.updates_enqueued, 2);

        // Still exactly one binding per record.
        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_create_job_confirms_external_id() {
        let f = fixture().await;
        seed_products(&f, 1).await;
        f.engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();

        let store = ScriptedStore::default();
        let jobs = f.queue.dequeue(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();
        let ExportJobOutcome::Applied { external_id } = outcome else {
            panic!("expected applied outcome");
        };

        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings[0].state, SyncState::Bound);
        assert_eq!(bindings[0].external_id.as_deref(), Some(external_id.as_str()));
        assert!(bindings[0].last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_rerun_create_job_updates_instead_of_duplicating() {
        let f = fixture().await;
        seed_products(&f, 1).await;
        f.engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();

        let store = ScriptedStore::default();
        let jobs = f.queue.dequeue(10).await.unwrap();
        f.engine.run_job(&store, &jobs[0]).await.unwrap();
        // At-least-once delivery: the same job runs again.
        f.engine.run_job(&store, &jobs[0]).await.unwrap();

        assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_create_detected_by_business_key() {
        let f = fixture().await;
        seed_products(&f, 1).await;
        f.engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();

        // The remote store already holds the record from a timed-out call.
        let store = ScriptedStore::knowing("P-0", "ext-prior");
        let jobs = f.queue.dequeue(10).await.unwrap();
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();

        assert_eq!(
            outcome,
            ExportJobOutcome::Applied {
                external_id: "ext-prior".to_string()
            }
        );
        assert_eq!(store.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.update_calls.load(Ordering::SeqCst), 1);

        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings[0].external_id.as_deref(), Some("ext-prior"));
    }

    #[tokio::test]
    async fn test_remote_conflict_escalates_without_retry() {
        let f = fixture().await;
        seed_products(&f, 1).await;
        f.engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();

        let store = ScriptedStore::with_create_failures(vec![ConnectorError::already_exists(
            "ext-dup",
        )]);
        let jobs = f.queue.dequeue(10).await.unwrap();
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();
        assert!(matches!(outcome, ExportJobOutcome::Escalated { .. }));

        assert_eq!(f.checkpoints.count_for_backend(f.backend.id).await.unwrap(), 1);
        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings[0].state, SyncState::Stale);
    }

    #[tokio::test]
    async fn test_transient_create_failure_defers() {
        let f = fixture().await;
        seed_products(&f, 1).await;
        f.engine
            .export(&f.backend, EntityKind::Product, &DomainFilter::All)
            .await
            .unwrap();

        let store =
            ScriptedStore::with_create_failures(vec![ConnectorError::connection_failed("reset")]);
        let jobs = f.queue.dequeue(10).await.unwrap();
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();
        assert!(matches!(outcome, ExportJobOutcome::Deferred { .. }));

        // No checkpoint for a transient fault; the binding survives as stale.
        assert_eq!(f.checkpoints.count_for_backend(f.backend.id).await.unwrap(), 0);
        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings[0].state, SyncState::Stale);
    }

    #[tokio::test]
    async fn test_update_before_create_confirms_defers() {
        let f = fixture().await;
        let record = f
            .local
            .insert(EntityKind::Product, json!({"sku": "A", "name": "A"}), true)
            .await
            .unwrap();
        let binding = f
            .registry
            .create_pending(f.backend.id, EntityKind::Product, record.id)
            .await
            .unwrap();
        let job = f
            .queue
            .enqueue(
                f.backend.id,
                EntityKind::Product,
                JobPayload::ExportRecord {
                    binding_id: binding.id,
                    action: ExportAction::Update,
                },
            )
            .await
            .unwrap();

        let store = ScriptedStore::default();
        let outcome = f.engine.run_job(&store, &job).await.unwrap();
        assert!(matches!(outcome, ExportJobOutcome::Deferred { .. }));
        assert_eq!(store.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_exports_race_to_one_binding() {
        let f = fixture().await;
        seed_products(&f, 1).await;

        let (a, b) = tokio::join!(
            f.engine
                .export(&f.backend, EntityKind::Product, &DomainFilter::All),
            f.engine
                .export(&f.backend, EntityKind::Product, &DomainFilter::All),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one create-class job between the two calls; the loser
        // resolved to an update without surfacing a duplicate error.
        assert_eq!(a.creates_enqueued + b.creates_enqueued, 1);
        assert_eq!(a.updates_enqueued + b.updates_enqueued, 1);

        let bindings = f.registry.list(f.backend.id, EntityKind::Product).await.unwrap();
        assert_eq!(bindings.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_budget_exhaustion() {
        let f = fixture().await;
        let record = f
            .local
            .insert(EntityKind::Product, json!({"sku": "A", "name": "A"}), true)
            .await
            .unwrap();
        let binding = f
            .registry
            .create_pending(f.backend.id, EntityKind::Product, record.id)
            .await
            .unwrap();

        // The retry budget is stamped onto the job at enqueue time.
        let queue = f.queue.clone().with_policy(crate::queue::RetryPolicy {
            max_retries: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        });
        queue
            .enqueue(
                f.backend.id,
                EntityKind::Product,
                JobPayload::ExportRecord {
                    binding_id: binding.id,
                    action: ExportAction::Create,
                },
            )
            .await
            .unwrap();

        let store = ScriptedStore::with_create_failures(vec![
            ConnectorError::connection_failed("reset"),
            ConnectorError::connection_failed("reset"),
        ]);

        // First run: transient failure, retried.
        let jobs = queue.dequeue(1).await.unwrap();
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();
        assert!(matches!(outcome, ExportJobOutcome::Deferred { .. }));
        queue.fail(jobs[0].id, "reset", true).await.unwrap();

        // Second run: budget exhausted, parked dead.
        let jobs = queue.dequeue(1).await.unwrap();
        let outcome = f.engine.run_job(&store, &jobs[0]).await.unwrap();
        assert!(matches!(outcome, ExportJobOutcome::Deferred { .. }));
        let fail = queue.fail(jobs[0].id, "reset", true).await.unwrap();
        assert!(matches!(fail, crate::queue::FailOutcome::Dead { .. }));
        assert_eq!(queue.get(jobs[0].id).await.unwrap().state, JobState::Dead);
    }
}
