//! Job queue
//!
//! Durable, priority-ordered dispatch of deferred sync work. Jobs survive
//! process restarts, are claimed by workers in priority order (ties broken
//! by enqueue time, FIFO), and are delivered at least once, so every
//! handler must be safe to run twice with the same payload. Transient
//! failures re-pend the job with bounded exponential backoff; exhaustion
//! or a permanent failure parks it as dead for operator review. Every
//! failure appends an audit row, so a job that succeeds after retries is
//! distinguishable from a first-try success only by its trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use storesync_connector::TimeWindow;
use storesync_core::{BackendId, BindingId, EntityKind, JobId};

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Which side of the sync an export job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportAction {
    /// Create the record remotely and confirm the external id.
    Create,

    /// Update the already-bound remote record.
    Update,
}

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JobPayload {
    /// Pull a time-windowed batch of one entity kind.
    ImportBatch { window: TimeWindow },

    /// Push one bound (or pending) local record.
    ExportRecord {
        binding_id: BindingId,
        action: ExportAction,
    },
}

impl JobPayload {
    /// Stable operation tag for the jobs table.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            JobPayload::ImportBatch { .. } => "import_batch",
            JobPayload::ExportRecord { .. } => "export_record",
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to run (includes jobs waiting out a retry backoff).
    Pending,

    /// Claimed by a worker.
    Running,

    /// Finished successfully.
    Done,

    /// Failed permanently; kept for operator review.
    Dead,
}

impl JobState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "dead" => Ok(JobState::Dead),
            _ => Err(format!("Unknown job state: {s}")),
        }
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Backend the job targets.
    pub backend_id: BackendId,

    /// Entity kind the job operates on.
    pub kind: EntityKind,

    /// Operation and its parameters.
    pub payload: JobPayload,

    /// Priority, lower runs first. Encodes entity dependency order.
    pub priority: i64,

    /// Lifecycle state.
    pub state: JobState,

    /// Number of failed attempts so far.
    pub retry_count: i32,

    /// Retry budget for transient failures.
    pub max_retries: i32,

    /// Earliest time the job may run (backoff scheduling).
    pub next_run_at: DateTime<Utc>,

    /// Last failure message.
    pub last_error: Option<String>,

    /// Enqueue timestamp (FIFO tiebreak within a priority).
    pub created_at: DateTime<Utc>,

    /// When the current/last run started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// One failed attempt, kept for the audit trail.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    /// Job this attempt belongs to.
    pub job_id: JobId,

    /// 1-based attempt number.
    pub attempt_number: i32,

    /// The failure message.
    pub error: String,

    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Outcome of failing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-pended with backoff.
    Retrying {
        retry_count: i32,
        next_run_at: DateTime<Utc>,
    },

    /// Parked permanently; the caller raises a checkpoint.
    Dead { retry_count: i32 },
}

/// Retry policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget; a job failing transiently more times than this goes
    /// dead.
    pub max_retries: i32,

    /// Base backoff delay.
    pub base_delay_ms: u64,

    /// Backoff cap.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (1-based): base doubled per
    /// retry, capped.
    #[must_use]
    pub fn delay_for(&self, retry: i32) -> std::time::Duration {
        let exp = retry.saturating_sub(1).clamp(0, 16) as u32;
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub dead: i64,
}

/// Durable job queue over the engine database.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl JobQueue {
    /// Create a queue with the default retry policy.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The queue's retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue a job at the kind's dependency priority.
    ///
    /// Non-blocking and durable: returns as soon as the row is committed.
    #[instrument(skip(self, payload), fields(op = payload.op()))]
    pub async fn enqueue(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        payload: JobPayload,
    ) -> QueueResult<Job> {
        self.enqueue_at(backend_id, kind, payload, kind.priority()).await
    }

    /// Enqueue a job at an explicit priority.
    #[instrument(skip(self, payload), fields(op = payload.op()))]
    pub async fn enqueue_at(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        payload: JobPayload,
        priority: i64,
    ) -> QueueResult<Job> {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            backend_id,
            kind,
            payload,
            priority,
            state: JobState::Pending,
            retry_count: 0,
            max_retries: self.policy.max_retries,
            next_run_at: now,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };

        let payload_text = serde_json::to_string(&job.payload)?;
        sqlx::query(
            r"
            INSERT INTO jobs (
                id, backend_id, kind, op, payload, priority, state,
                retry_count, max_retries, next_run_at, last_error,
                created_at, started_at, finished_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(job.id.as_uuid())
        .bind(job.backend_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.payload.op())
        .bind(payload_text)
        .bind(job.priority)
        .bind(job.state.as_str())
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.next_run_at)
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, priority = job.priority, "Enqueued job");
        Ok(job)
    }

    /// Claim up to `limit` due jobs, priority order, FIFO within a
    /// priority.
    ///
    /// Each claim is a single guarded update, so concurrent workers never
    /// run the same job twice at once.
    #[instrument(skip(self))]
    pub async fn dequeue(&self, limit: i64) -> QueueResult<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = Vec::new();

        while (jobs.len() as i64) < limit {
            let candidate = sqlx::query(
                r"
                SELECT id FROM jobs
                WHERE state = 'pending' AND next_run_at <= $1
                ORDER BY priority, created_at, id
                LIMIT 1
                ",
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = candidate else { break };
            let id: Uuid = row.get("id");

            let claimed = sqlx::query(
                r"
                UPDATE jobs
                SET state = 'running', started_at = $1, updated_at = $1
                WHERE id = $2 AND state = 'pending'
                ",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

            // Zero rows means another worker won the claim; the next
            // candidate query will skip it.
            if claimed.rows_affected() == 1 {
                jobs.push(self.get(JobId::from_uuid(id)).await?);
            }
        }

        Ok(jobs)
    }

    /// Mark a job done.
    #[instrument(skip(self))]
    pub async fn complete(&self, id: JobId) -> QueueResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'done', finished_at = $1, updated_at = $1
            WHERE id = $2
            ",
        )
        .bind(now)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Record a failed run.
    ///
    /// A transient failure within the retry budget re-pends the job with
    /// backoff; anything else parks it dead. Either way an audit row is
    /// appended.
    #[instrument(skip(self, error))]
    pub async fn fail(&self, id: JobId, error: &str, transient: bool) -> QueueResult<FailOutcome> {
        let job = self.get(id).await?;
        let now = Utc::now();
        let attempt_number = job.retry_count + 1;
        let can_retry = transient && job.retry_count < job.max_retries;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO job_attempts (job_id, attempt_number, error, failed_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(id.as_uuid())
        .bind(attempt_number)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let outcome = if can_retry {
            let delay = self.policy.delay_for(attempt_number);
            let next_run_at = now
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            sqlx::query(
                r"
                UPDATE jobs
                SET state = 'pending', retry_count = $1, next_run_at = $2,
                    last_error = $3, updated_at = $4
                WHERE id = $5
                ",
            )
            .bind(attempt_number)
            .bind(next_run_at)
            .bind(error)
            .bind(now)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying {
                retry_count: attempt_number,
                next_run_at,
            }
        } else {
            sqlx::query(
                r"
                UPDATE jobs
                SET state = 'dead', retry_count = $1, last_error = $2,
                    finished_at = $3, updated_at = $3
                WHERE id = $4
                ",
            )
            .bind(attempt_number)
            .bind(error)
            .bind(now)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Dead {
                retry_count: attempt_number,
            }
        };

        tx.commit().await?;

        match &outcome {
            FailOutcome::Retrying { next_run_at, .. } => {
                debug!(job_id = %id, next_run_at = %next_run_at, "Job failed, retrying");
            }
            FailOutcome::Dead { retry_count } => {
                warn!(job_id = %id, retry_count, "Job failed permanently");
            }
        }
        Ok(outcome)
    }

    /// Re-pend running jobs whose worker disappeared.
    #[instrument(skip(self))]
    pub async fn release_stale(&self, stale_after: std::time::Duration) -> QueueResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'pending', updated_at = $1
            WHERE state = 'running' AND started_at < $2
            ",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Get a job by id.
    pub async fn get(&self, id: JobId) -> QueueResult<Job> {
        let row = sqlx::query(
            r"
            SELECT id, backend_id, kind, payload, priority, state, retry_count,
                   max_retries, next_run_at, last_error, created_at, started_at,
                   finished_at, updated_at
            FROM jobs
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map_or(Err(QueueError::NotFound(id)), |r| row_to_job(&r))
    }

    /// Audit trail for a job, oldest first.
    pub async fn attempts_for(&self, id: JobId) -> QueueResult<Vec<JobAttempt>> {
        let rows = sqlx::query(
            r"
            SELECT job_id, attempt_number, error, failed_at
            FROM job_attempts
            WHERE job_id = $1
            ORDER BY attempt_number
            ",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| JobAttempt {
                job_id: JobId::from_uuid(r.get::<Uuid, _>("job_id")),
                attempt_number: r.get("attempt_number"),
                error: r.get("error"),
                failed_at: r.get("failed_at"),
            })
            .collect())
    }

    /// Per-state job counts.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let n: i64 = row.get("n");
            match row.get::<String, _>("state").as_str() {
                "pending" => stats.pending = n,
                "running" => stats.running = n,
                "done" => stats.done = n,
                "dead" => stats.dead = n,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Jobs of one op for a backend, enqueue order; test helper.
    pub async fn jobs_for_backend(&self, backend_id: BackendId) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query(
            r"
            SELECT id, backend_id, kind, payload, priority, state, retry_count,
                   max_retries, next_run_at, last_error, created_at, started_at,
                   finished_at, updated_at
            FROM jobs
            WHERE backend_id = $1
            ORDER BY created_at, id
            ",
        )
        .bind(backend_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }
}

fn row_to_job(row: &SqliteRow) -> QueueResult<Job> {
    let payload: String = row.get("payload");
    Ok(Job {
        id: JobId::from_uuid(row.get::<Uuid, _>("id")),
        backend_id: BackendId::from_uuid(row.get::<Uuid, _>("backend_id")),
        kind: row
            .get::<String, _>("kind")
            .parse()
            .unwrap_or(EntityKind::Product),
        payload: serde_json::from_str(&payload)?,
        priority: row.get("priority"),
        state: row
            .get::<String, _>("state")
            .parse()
            .unwrap_or(JobState::Pending),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        next_run_at: row.get("next_run_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        updated_at: row.get("updated_at"),
    })
}
