//! Checkpoint sink
//!
//! Operator-visible escalation records. Whenever automatic reconciliation
//! cannot proceed unambiguously (a duplicate binding, a remote conflict,
//! a malformed payload, an exhausted retry budget), the engines append a
//! checkpoint instead of failing the batch or clobbering state. The sink
//! is append-only and never deduplicates; clearing belongs to the
//! operator surface.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use storesync_core::{BackendId, CheckpointId, EntityKind, JobId, LocalRef};

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Why reconciliation stopped for this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// Binding creation hit an already-bound local record or external id.
    DuplicateBinding,

    /// The remote store reported a conflict (e.g. the record already
    /// exists under a different identity).
    ExternalConflict,

    /// Matching was ambiguous (local candidate already bound elsewhere).
    AmbiguousMatch,

    /// The remote payload failed the kind's validation policy.
    ValidationFailed,

    /// A job exhausted its retry budget.
    RetriesExhausted,

    /// A dependent record arrived before its prerequisite.
    MissingPrerequisite,
}

impl CheckpointReason {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::DuplicateBinding => "duplicate_binding",
            CheckpointReason::ExternalConflict => "external_conflict",
            CheckpointReason::AmbiguousMatch => "ambiguous_match",
            CheckpointReason::ValidationFailed => "validation_failed",
            CheckpointReason::RetriesExhausted => "retries_exhausted",
            CheckpointReason::MissingPrerequisite => "missing_prerequisite",
        }
    }
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "duplicate_binding" => Ok(CheckpointReason::DuplicateBinding),
            "external_conflict" => Ok(CheckpointReason::ExternalConflict),
            "ambiguous_match" => Ok(CheckpointReason::AmbiguousMatch),
            "validation_failed" => Ok(CheckpointReason::ValidationFailed),
            "retries_exhausted" => Ok(CheckpointReason::RetriesExhausted),
            "missing_prerequisite" => Ok(CheckpointReason::MissingPrerequisite),
            _ => Err(format!("Unknown checkpoint reason: {s}")),
        }
    }
}

/// An unresolved reconciliation anomaly.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Checkpoint ID.
    pub id: CheckpointId,

    /// Backend the anomaly occurred on.
    pub backend_id: BackendId,

    /// Entity kind, when known.
    pub kind: Option<EntityKind>,

    /// Local record reference, when known.
    pub local_id: Option<LocalRef>,

    /// External identifier, when known.
    pub external_id: Option<String>,

    /// Why reconciliation stopped.
    pub reason: CheckpointReason,

    /// The triggering error, verbatim.
    pub message: String,

    /// Originating job, when the anomaly came out of a job run.
    pub job_id: Option<JobId>,

    /// When the checkpoint was raised.
    pub created_at: DateTime<Utc>,
}

/// A checkpoint about to be raised.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub backend_id: BackendId,
    pub kind: Option<EntityKind>,
    pub local_id: Option<LocalRef>,
    pub external_id: Option<String>,
    pub reason: CheckpointReason,
    pub message: String,
    pub job_id: Option<JobId>,
}

impl CheckpointEntry {
    /// Start an entry with the minimum required context.
    pub fn new(backend_id: BackendId, reason: CheckpointReason, message: impl Into<String>) -> Self {
        Self {
            backend_id,
            kind: None,
            local_id: None,
            external_id: None,
            reason,
            message: message.into(),
            job_id: None,
        }
    }

    /// Attach the entity kind.
    #[must_use]
    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Attach the local record reference.
    #[must_use]
    pub fn local(mut self, local_id: LocalRef) -> Self {
        self.local_id = Some(local_id);
        self
    }

    /// Attach the external identifier.
    pub fn external(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Attach the originating job.
    #[must_use]
    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// Append-only sink for reconciliation anomalies.
#[derive(Clone)]
pub struct CheckpointSink {
    pool: SqlitePool,
}

impl CheckpointSink {
    /// Create a new sink over a pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a checkpoint. Never deduplicates, never drops.
    #[instrument(skip(self, entry), fields(backend_id = %entry.backend_id, reason = %entry.reason))]
    pub async fn raise(&self, entry: CheckpointEntry) -> CheckpointResult<Checkpoint> {
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            backend_id: entry.backend_id,
            kind: entry.kind,
            local_id: entry.local_id,
            external_id: entry.external_id,
            reason: entry.reason,
            message: entry.message,
            job_id: entry.job_id,
            created_at: Utc::now(),
        };

        sqlx::query(
            r"
            INSERT INTO checkpoints (
                id, backend_id, kind, local_id, external_id, reason, message, job_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(checkpoint.id.as_uuid())
        .bind(checkpoint.backend_id.as_uuid())
        .bind(checkpoint.kind.map(|k| k.as_str()))
        .bind(checkpoint.local_id.map(|l| l.as_uuid()))
        .bind(&checkpoint.external_id)
        .bind(checkpoint.reason.as_str())
        .bind(&checkpoint.message)
        .bind(checkpoint.job_id.map(|j| j.as_uuid()))
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;

        warn!(
            checkpoint_id = %checkpoint.id,
            message = %checkpoint.message,
            "Raised checkpoint"
        );
        Ok(checkpoint)
    }

    /// Count checkpoints for a backend.
    pub async fn count_for_backend(&self, backend_id: BackendId) -> CheckpointResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM checkpoints WHERE backend_id = $1")
            .bind(backend_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Most recent checkpoints for a backend, newest first.
    #[instrument(skip(self))]
    pub async fn recent(
        &self,
        backend_id: BackendId,
        limit: i64,
    ) -> CheckpointResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r"
            SELECT id, backend_id, kind, local_id, external_id, reason, message, job_id, created_at
            FROM checkpoints
            WHERE backend_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2
            ",
        )
        .bind(backend_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_checkpoint).collect())
    }
}

fn row_to_checkpoint(row: &SqliteRow) -> Checkpoint {
    Checkpoint {
        id: CheckpointId::from_uuid(row.get::<Uuid, _>("id")),
        backend_id: BackendId::from_uuid(row.get::<Uuid, _>("backend_id")),
        kind: row
            .get::<Option<String>, _>("kind")
            .and_then(|k| k.parse().ok()),
        local_id: row.get::<Option<Uuid>, _>("local_id").map(LocalRef::from_uuid),
        external_id: row.get("external_id"),
        reason: row
            .get::<String, _>("reason")
            .parse()
            .unwrap_or(CheckpointReason::AmbiguousMatch),
        message: row.get("message"),
        job_id: row.get::<Option<Uuid>, _>("job_id").map(JobId::from_uuid),
        created_at: row.get("created_at"),
    }
}
