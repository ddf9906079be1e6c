//! Binding registry
//!
//! Bindings are the persistent correspondence between one local record and
//! one external record, per backend and entity kind. The registry is the
//! single source of truth for that mapping: create/lookup races on the
//! same local record or external id are serialized by unique indexes, and
//! an attempt to bind an already-bound side is a hard error the caller
//! routes to the checkpoint sink. A binding is never silently overwritten
//! and never destroyed by a failed sync; [`BindingRegistry::unbind`] is
//! the only destroy path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use storesync_core::{BackendId, BindingId, EntityKind, LocalRef};

use crate::local::{LocalRecord, LocalStore, LocalStoreError};

/// Binding errors.
#[derive(Debug, Error)]
pub enum BindingError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// One side of the pair already has a live binding.
    #[error("duplicate binding: {side} {identifier} already bound on backend {backend_id}")]
    Duplicate {
        backend_id: BackendId,
        side: &'static str,
        identifier: String,
    },

    /// Binding not found.
    #[error("binding not found: {0}")]
    NotFound(BindingId),

    /// Local store error during a pair-create.
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),
}

/// Result type for binding operations.
pub type BindingResult<T> = Result<T, BindingError>;

/// Binding lifecycle state.
///
/// The unbound state is the absence of a row; every persisted binding is
/// in one of these states. Transitions are triggered only by the
/// import/export engines and the job completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Binding created by export, external id not yet confirmed.
    PendingExport,

    /// External id confirmed and last sync succeeded.
    Bound,

    /// Local or remote side changed since the last successful sync, or
    /// the last attempt failed.
    Stale,

    /// A job is currently applying this binding remotely.
    Syncing,
}

impl SyncState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::PendingExport => "pending_export",
            SyncState::Bound => "bound",
            SyncState::Stale => "stale",
            SyncState::Syncing => "syncing",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending_export" => Ok(SyncState::PendingExport),
            "bound" => Ok(SyncState::Bound),
            "stale" => Ok(SyncState::Stale),
            "syncing" => Ok(SyncState::Syncing),
            _ => Err(format!("Unknown sync state: {s}")),
        }
    }
}

/// A binding between a local record and an external record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Binding ID.
    pub id: BindingId,

    /// Backend this binding belongs to.
    pub backend_id: BackendId,

    /// Entity kind.
    pub kind: EntityKind,

    /// Local record reference.
    pub local_id: LocalRef,

    /// Identifier in the remote store; `None` until a create job confirms
    /// one.
    pub external_id: Option<String>,

    /// Lifecycle state.
    pub state: SyncState,

    /// Last successful sync timestamp.
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Last error message.
    pub last_error: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a race-safe export claim.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This caller created the binding and owns the create job.
    Created(Binding),

    /// Another caller got there first; enqueue an update instead.
    Existing(Binding),
}

/// Repository enforcing the binding invariants.
#[derive(Clone)]
pub struct BindingRegistry {
    pool: SqlitePool,
}

impl BindingRegistry {
    /// Create a new registry over a pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find the live binding for a local record.
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        local_id: LocalRef,
    ) -> BindingResult<Option<Binding>> {
        let row = sqlx::query(
            r"
            SELECT id, backend_id, kind, local_id, external_id, state,
                   last_synced_at, last_error, created_at, updated_at
            FROM bindings
            WHERE backend_id = $1 AND kind = $2 AND local_id = $3
            ",
        )
        .bind(backend_id.as_uuid())
        .bind(kind.as_str())
        .bind(local_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_binding(&r)))
    }

    /// Reverse lookup by external id.
    #[instrument(skip(self))]
    pub async fn find_by_external(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        external_id: &str,
    ) -> BindingResult<Option<Binding>> {
        let row = sqlx::query(
            r"
            SELECT id, backend_id, kind, local_id, external_id, state,
                   last_synced_at, last_error, created_at, updated_at
            FROM bindings
            WHERE backend_id = $1 AND kind = $2 AND external_id = $3
            ",
        )
        .bind(backend_id.as_uuid())
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_binding(&r)))
    }

    /// Get a binding by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: BindingId) -> BindingResult<Binding> {
        let row = sqlx::query(
            r"
            SELECT id, backend_id, kind, local_id, external_id, state,
                   last_synced_at, last_error, created_at, updated_at
            FROM bindings
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_binding(&r))
            .ok_or(BindingError::NotFound(id))
    }

    /// Create a `PendingExport` binding with no external id yet.
    ///
    /// Fails with [`BindingError::Duplicate`] if the local record already
    /// has a live binding for this backend and kind.
    #[instrument(skip(self))]
    pub async fn create_pending(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        local_id: LocalRef,
    ) -> BindingResult<Binding> {
        let binding = new_binding(backend_id, kind, local_id, None, SyncState::PendingExport);
        self.insert(&binding)
            .await
            .map_err(|e| map_duplicate(e, backend_id, "local record", local_id.to_string()))?;
        Ok(binding)
    }

    /// Create a `Bound` binding linking an existing local record to a
    /// confirmed external id (the import engine's retroactive link).
    #[instrument(skip(self))]
    pub async fn create_bound(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        local_id: LocalRef,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> BindingResult<Binding> {
        let mut binding = new_binding(
            backend_id,
            kind,
            local_id,
            Some(external_id.to_string()),
            SyncState::Bound,
        );
        binding.last_synced_at = Some(now);
        self.insert(&binding)
            .await
            .map_err(|e| map_duplicate(e, backend_id, "external record", external_id.to_string()))?;
        Ok(binding)
    }

    /// Atomically create a new local record together with its `Bound`
    /// binding. Both succeed or both fail; no orphan binding without its
    /// local record, no local record silently left unbound.
    #[instrument(skip(self, payload))]
    pub async fn create_with_local(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        payload: serde_json::Value,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> BindingResult<(LocalRecord, Binding)> {
        let record = LocalRecord::new(kind, payload, true);
        let mut binding = new_binding(
            backend_id,
            kind,
            record.id,
            Some(external_id.to_string()),
            SyncState::Bound,
        );
        binding.last_synced_at = Some(now);

        let mut tx = self.pool.begin().await?;
        LocalStore::insert_on(&mut *tx, &record).await?;
        insert_on(&mut *tx, &binding)
            .await
            .map_err(|e| map_duplicate(e, backend_id, "external record", external_id.to_string()))?;
        tx.commit().await?;

        debug!(
            binding_id = %binding.id,
            local_id = %record.id,
            external_id = %external_id,
            "Created local record with binding"
        );
        Ok((record, binding))
    }

    /// Race-safe claim for export: create the `PendingExport` binding, or
    /// observe the one a concurrent caller created first. Exactly one
    /// caller ever receives [`ClaimOutcome::Created`] for an unbound local
    /// record.
    #[instrument(skip(self))]
    pub async fn claim_for_export(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
        local_id: LocalRef,
    ) -> BindingResult<ClaimOutcome> {
        match self.create_pending(backend_id, kind, local_id).await {
            Ok(binding) => Ok(ClaimOutcome::Created(binding)),
            Err(BindingError::Duplicate { .. }) => {
                let existing = self
                    .find(backend_id, kind, local_id)
                    .await?
                    .ok_or(BindingError::Duplicate {
                        backend_id,
                        side: "local record",
                        identifier: local_id.to_string(),
                    })?;
                Ok(ClaimOutcome::Existing(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// Record the external id confirmed by the remote store and move the
    /// binding to `Bound`.
    ///
    /// Fails with [`BindingError::Duplicate`] when the external id is
    /// already claimed by another binding; the caller escalates that to a
    /// checkpoint instead of retrying. Re-confirming the same id is a
    /// no-op so that at-least-once job delivery stays safe.
    #[instrument(skip(self))]
    pub async fn confirm_external(
        &self,
        id: BindingId,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> BindingResult<Binding> {
        let current = self.get(id).await?;
        if let Some(existing) = &current.external_id {
            if existing != external_id {
                // A different id was already confirmed; never overwrite.
                return Err(BindingError::Duplicate {
                    backend_id: current.backend_id,
                    side: "external record",
                    identifier: external_id.to_string(),
                });
            }
        }

        sqlx::query(
            r"
            UPDATE bindings
            SET external_id = $1, state = 'bound', last_synced_at = $2,
                last_error = NULL, updated_at = $3
            WHERE id = $4 AND (external_id IS NULL OR external_id = $1)
            ",
        )
        .bind(external_id)
        .bind(now)
        .bind(now)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_duplicate(
                BindingError::Database(e),
                current.backend_id,
                "external record",
                external_id.to_string(),
            )
        })?;

        self.get(id).await
    }

    /// Mark a binding as being applied by a running job.
    #[instrument(skip(self))]
    pub async fn mark_syncing(&self, id: BindingId) -> BindingResult<()> {
        self.transition(id, SyncState::Syncing, None).await
    }

    /// Record a successful sync. The single-statement update is atomic
    /// with respect to concurrent readers.
    #[instrument(skip(self))]
    pub async fn mark_synced(&self, id: BindingId, now: DateTime<Utc>) -> BindingResult<()> {
        let result = sqlx::query(
            r"
            UPDATE bindings
            SET state = 'bound', last_synced_at = $1, last_error = NULL, updated_at = $2
            WHERE id = $3
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BindingError::NotFound(id));
        }
        Ok(())
    }

    /// Mark a binding stale, optionally recording the error that caused
    /// it. Never destroys the binding.
    #[instrument(skip(self))]
    pub async fn mark_stale(&self, id: BindingId, error: Option<&str>) -> BindingResult<()> {
        self.transition(id, SyncState::Stale, error).await
    }

    /// Explicitly destroy a binding. The only way a binding ever goes
    /// away; failed syncs leave it in place as `Stale`.
    #[instrument(skip(self))]
    pub async fn unbind(&self, id: BindingId) -> BindingResult<()> {
        let result = sqlx::query("DELETE FROM bindings WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BindingError::NotFound(id));
        }
        Ok(())
    }

    /// Count bindings for a backend; test and reporting helper.
    pub async fn count_for_backend(&self, backend_id: BackendId) -> BindingResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bindings WHERE backend_id = $1")
            .bind(backend_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// List bindings for a backend and kind, in creation order.
    pub async fn list(
        &self,
        backend_id: BackendId,
        kind: EntityKind,
    ) -> BindingResult<Vec<Binding>> {
        let rows = sqlx::query(
            r"
            SELECT id, backend_id, kind, local_id, external_id, state,
                   last_synced_at, last_error, created_at, updated_at
            FROM bindings
            WHERE backend_id = $1 AND kind = $2
            ORDER BY created_at, id
            ",
        )
        .bind(backend_id.as_uuid())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_binding).collect())
    }

    async fn insert(&self, binding: &Binding) -> BindingResult<()> {
        insert_on(&self.pool, binding).await
    }

    async fn transition(
        &self,
        id: BindingId,
        to: SyncState,
        error: Option<&str>,
    ) -> BindingResult<()> {
        let result = sqlx::query(
            r"
            UPDATE bindings
            SET state = $1, last_error = COALESCE($2, last_error), updated_at = $3
            WHERE id = $4
            ",
        )
        .bind(to.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BindingError::NotFound(id));
        }
        Ok(())
    }
}

fn new_binding(
    backend_id: BackendId,
    kind: EntityKind,
    local_id: LocalRef,
    external_id: Option<String>,
    state: SyncState,
) -> Binding {
    let now = Utc::now();
    Binding {
        id: BindingId::new(),
        backend_id,
        kind,
        local_id,
        external_id,
        state,
        last_synced_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

async fn insert_on<'e, E>(executor: E, binding: &Binding) -> BindingResult<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        r"
        INSERT INTO bindings (
            id, backend_id, kind, local_id, external_id, state,
            last_synced_at, last_error, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ",
    )
    .bind(binding.id.as_uuid())
    .bind(binding.backend_id.as_uuid())
    .bind(binding.kind.as_str())
    .bind(binding.local_id.as_uuid())
    .bind(&binding.external_id)
    .bind(binding.state.as_str())
    .bind(binding.last_synced_at)
    .bind(&binding.last_error)
    .bind(binding.created_at)
    .bind(binding.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Map a unique-index violation to the duplicate-binding error; pass
/// everything else through.
fn map_duplicate(
    err: BindingError,
    backend_id: BackendId,
    side: &'static str,
    identifier: String,
) -> BindingError {
    match err {
        BindingError::Database(sqlx::Error::Database(ref db)) if db.is_unique_violation() => {
            BindingError::Duplicate {
                backend_id,
                side,
                identifier,
            }
        }
        other => other,
    }
}

fn row_to_binding(row: &SqliteRow) -> Binding {
    Binding {
        id: BindingId::from_uuid(row.get::<Uuid, _>("id")),
        backend_id: BackendId::from_uuid(row.get::<Uuid, _>("backend_id")),
        kind: row
            .get::<String, _>("kind")
            .parse()
            .unwrap_or(EntityKind::Product),
        local_id: LocalRef::from_uuid(row.get::<Uuid, _>("local_id")),
        external_id: row.get("external_id"),
        state: row
            .get::<String, _>("state")
            .parse()
            .unwrap_or(SyncState::Stale),
        last_synced_at: row.get("last_synced_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
