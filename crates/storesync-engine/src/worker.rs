//! Sync worker
//!
//! Background consumer of the job queue. Polls for due jobs, resolves the
//! backend connection, opens a scoped remote store handle per job run,
//! and executes import batches and export records under a wall-clock
//! budget. Transient failures (including budget overruns) go back to the
//! queue with backoff; a job that dies raises a checkpoint referencing
//! its target entity. Handles graceful shutdown and reclaims jobs whose
//! worker disappeared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use storesync_connector::StoreProvider;
use storesync_core::BackendDirectory;

use crate::binding::BindingRegistry;
use crate::checkpoint::{CheckpointEntry, CheckpointReason, CheckpointSink};
use crate::export::{ExportEngine, ExportJobOutcome};
use crate::import::{ImportConfig, ImportEngine};
use crate::queue::{FailOutcome, Job, JobPayload, JobQueue, RetryPolicy};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed concurrently.
    pub concurrency: usize,

    /// How often to poll the queue (in milliseconds).
    pub poll_interval_ms: u64,

    /// Wall-clock budget per job run (in seconds). A run exceeding it is
    /// abandoned and counted as a transient failure.
    pub job_timeout_secs: u64,

    /// How often to reclaim stale running jobs (in seconds).
    pub stale_release_interval_secs: u64,

    /// Age after which a running job counts as stale (in seconds).
    pub stale_after_secs: u64,

    /// Maximum jobs per poll.
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1_000,
            job_timeout_secs: 60,
            stale_release_interval_secs: 300,
            stale_after_secs: 300,
            batch_size: 10,
        }
    }
}

/// Counters from a [`SyncWorker::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Job runs executed.
    pub processed: u64,

    /// Runs that completed their job.
    pub completed: u64,

    /// Runs that failed (retried or dead).
    pub failed: u64,
}

/// Everything a single job run needs; cheap to clone into a task.
#[derive(Clone)]
struct JobContext {
    queue: JobQueue,
    registry: BindingRegistry,
    import: ImportEngine,
    export: ExportEngine,
    checkpoints: CheckpointSink,
    directory: Arc<dyn BackendDirectory>,
    provider: Arc<dyn StoreProvider>,
    job_timeout: Duration,
}

/// Background worker processing the sync job queue.
pub struct SyncWorker {
    ctx: JobContext,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl SyncWorker {
    /// Create a worker over the engine database.
    pub fn new(
        pool: SqlitePool,
        directory: Arc<dyn BackendDirectory>,
        provider: Arc<dyn StoreProvider>,
    ) -> Self {
        let config = WorkerConfig::default();
        Self {
            ctx: JobContext {
                queue: JobQueue::new(pool.clone()),
                registry: BindingRegistry::new(pool.clone()),
                import: ImportEngine::new(pool.clone()),
                export: ExportEngine::new(pool.clone()),
                checkpoints: CheckpointSink::new(pool),
                directory,
                provider,
                job_timeout: Duration::from_secs(config.job_timeout_secs),
            },
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the worker configuration.
    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.ctx.job_timeout = Duration::from_secs(config.job_timeout_secs);
        self.config = config;
        self
    }

    /// Override the import engine configuration.
    #[must_use]
    pub fn with_import_config(mut self, config: ImportConfig) -> Self {
        self.ctx.import = self.ctx.import.with_config(config);
        self
    }

    /// Override the queue's retry backoff policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.ctx.queue = self.ctx.queue.with_policy(policy);
        self
    }

    /// Run the poll loop until shutdown is requested.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting sync worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut stale_interval =
            interval(Duration::from_secs(self.config.stale_release_interval_secs));

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("Worker shutdown requested, stopping poll loop");
                        break;
                    }
                    self.poll_and_process(&semaphore).await;
                }
                _ = stale_interval.tick() => {
                    self.release_stale().await;
                }
            }
        }

        // Wait for in-flight jobs to complete.
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("Worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Process due jobs sequentially until the queue has none left.
    ///
    /// Deterministic alternative to [`run`] for tests and one-shot
    /// trigger surfaces.
    ///
    /// [`run`]: SyncWorker::run
    pub async fn drain(&self) -> DrainStats {
        let mut stats = DrainStats::default();
        loop {
            let jobs = match self.ctx.queue.dequeue(self.config.batch_size).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue jobs");
                    break;
                }
            };
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                stats.processed += 1;
                if process_job(self.ctx.clone(), job).await {
                    stats.completed += 1;
                } else {
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    async fn poll_and_process(&self, semaphore: &Arc<Semaphore>) {
        let jobs = match self.ctx.queue.dequeue(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to dequeue jobs");
                return;
            }
        };

        if jobs.is_empty() {
            return;
        }
        debug!(count = jobs.len(), "Dequeued jobs for processing");

        for job in jobs {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("All worker slots busy, leaving remaining jobs claimed");
                return;
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_job(ctx, job).await;
            });
        }
    }

    async fn release_stale(&self) {
        match self
            .ctx
            .queue
            .release_stale(Duration::from_secs(self.config.stale_after_secs))
            .await
        {
            Ok(count) if count > 0 => {
                warn!(count = count, "Released stale jobs");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to release stale jobs");
            }
        }
    }
}

/// How one dispatch ended, before queue bookkeeping.
enum RunOutcome {
    /// Work applied; complete the job.
    Completed,

    /// Transient condition; retry with backoff.
    Deferred(String),

    /// Conflict already checkpointed by the engine; park without another
    /// checkpoint.
    Escalated(String),

    /// Error; retry when transient.
    Errored { message: String, transient: bool },
}

/// Process a single claimed job. Returns true when the job completed.
#[instrument(skip(ctx, job), fields(job_id = %job.id, op = job.payload.op()))]
async fn process_job(ctx: JobContext, job: Job) -> bool {
    let start = std::time::Instant::now();
    let outcome = dispatch(&ctx, &job).await;
    let duration_ms = start.elapsed().as_millis() as i64;

    match outcome {
        RunOutcome::Completed => {
            info!(duration_ms, "Job completed");
            if let Err(e) = ctx.queue.complete(job.id).await {
                error!(error = %e, "Failed to mark job complete");
                return false;
            }
            true
        }
        RunOutcome::Deferred(reason) => {
            debug!(duration_ms, reason = %reason, "Job deferred");
            fail_job(&ctx, &job, &reason, true, true).await;
            false
        }
        RunOutcome::Escalated(reason) => {
            warn!(duration_ms, reason = %reason, "Job escalated to checkpoint");
            // The engine already raised the conflict checkpoint.
            fail_job(&ctx, &job, &reason, false, false).await;
            false
        }
        RunOutcome::Errored { message, transient } => {
            warn!(duration_ms, error = %message, transient, "Job failed");
            fail_job(&ctx, &job, &message, transient, true).await;
            false
        }
    }
}

async fn dispatch(ctx: &JobContext, job: &Job) -> RunOutcome {
    // Resolve the backend; a job for an unknown backend can never run.
    let Some(backend) = ctx.directory.get(job.backend_id) else {
        return RunOutcome::Errored {
            message: format!("backend {} not found in directory", job.backend_id),
            transient: false,
        };
    };

    // Scoped store handle for this run only.
    let store = match ctx.provider.open(&backend).await {
        Ok(store) => store,
        Err(e) => {
            return RunOutcome::Errored {
                transient: e.is_transient(),
                message: e.to_string(),
            };
        }
    };

    let run = async {
        match &job.payload {
            JobPayload::ImportBatch { window } => ctx
                .import
                .import_batch(store.as_ref(), &backend, job.kind, *window)
                .await
                .map(|summary| {
                    // Partial success still completes; failures are
                    // checkpointed per record.
                    if summary.is_partial() {
                        warn!(
                            failed = summary.failed,
                            "Import batch completed partially"
                        );
                    }
                    RunOutcome::Completed
                })
                .unwrap_or_else(|e| RunOutcome::Errored {
                    transient: e.is_transient(),
                    message: e.to_string(),
                }),
            JobPayload::ExportRecord { .. } => {
                match ctx.export.run_job(store.as_ref(), job).await {
                    Ok(ExportJobOutcome::Applied { .. }) => RunOutcome::Completed,
                    Ok(ExportJobOutcome::Deferred { reason }) => RunOutcome::Deferred(reason),
                    Ok(ExportJobOutcome::Escalated { reason }) => RunOutcome::Escalated(reason),
                    Err(e) => RunOutcome::Errored {
                        transient: e.is_transient(),
                        message: e.to_string(),
                    },
                }
            }
        }
    };

    match tokio::time::timeout(ctx.job_timeout, run).await {
        Ok(outcome) => outcome,
        // The remote side may still have applied the call; the retry path
        // detects that and converts duplicates into updates.
        Err(_) => RunOutcome::Errored {
            message: format!(
                "job exceeded wall-clock budget of {}s",
                ctx.job_timeout.as_secs()
            ),
            transient: true,
        },
    }
}

/// Route a failed run through the queue; raise the exhaustion checkpoint
/// when the job dies (unless the engine already checkpointed it).
async fn fail_job(ctx: &JobContext, job: &Job, error: &str, transient: bool, checkpoint_dead: bool) {
    match ctx.queue.fail(job.id, error, transient).await {
        Ok(FailOutcome::Retrying { .. }) => {}
        Ok(FailOutcome::Dead { retry_count }) => {
            if checkpoint_dead {
                raise_dead_checkpoint(ctx, job, error, retry_count).await;
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to record job failure");
        }
    }
}

async fn raise_dead_checkpoint(ctx: &JobContext, job: &Job, error: &str, retry_count: i32) {
    let mut entry = CheckpointEntry::new(
        job.backend_id,
        CheckpointReason::RetriesExhausted,
        format!("job failed permanently after {retry_count} attempt(s): {error}"),
    )
    .kind(job.kind)
    .job(job.id);

    if let JobPayload::ExportRecord { binding_id, .. } = &job.payload {
        if let Ok(binding) = ctx.registry.get(*binding_id).await {
            entry = entry.local(binding.local_id);
            if let Some(external_id) = &binding.external_id {
                entry = entry.external(external_id);
            }
        }
    }

    if let Err(e) = ctx.checkpoints.raise(entry).await {
        error!(error = %e, "Failed to raise checkpoint for dead job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.job_timeout_secs, 60);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_drain_stats_default() {
        let stats = DrainStats::default();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 0);
    }
}
