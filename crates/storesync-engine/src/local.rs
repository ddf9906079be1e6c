//! Local system-of-record access
//!
//! Repository over the `local_records` table. The engine only needs
//! standard CRUD plus a business-key lookup; the uniqueness constraint on
//! `(kind, business_key)` keeps cross-system matching unambiguous.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use storesync_core::{DomainFilter, EntityKind, LocalRef};

/// Local store errors.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Record not found.
    #[error("local record not found: {0}")]
    NotFound(LocalRef),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for local store operations.
pub type LocalStoreResult<T> = Result<T, LocalStoreError>;

/// A record in the local system of record.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    /// Record ID.
    pub id: LocalRef,

    /// Entity kind.
    pub kind: EntityKind,

    /// Cross-system matching key derived from the payload.
    pub business_key: Option<String>,

    /// Record fields.
    pub payload: serde_json::Value,

    /// Whether the record is active (inactive records are excluded from
    /// export by the usual domain filters).
    pub active: bool,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    /// Build a new record for a kind, deriving the business key from the
    /// payload per the kind's policy.
    #[must_use]
    pub fn new(kind: EntityKind, payload: serde_json::Value, active: bool) -> Self {
        let now = Utc::now();
        Self {
            id: LocalRef::new(),
            kind,
            business_key: kind.business_key(&payload),
            payload,
            active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Repository for local records.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Create a new local store over a pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record using the given executor.
    ///
    /// Exposed so the binding registry can insert the record and its
    /// binding in one transaction.
    pub(crate) async fn insert_on<'e, E>(executor: E, record: &LocalRecord) -> LocalStoreResult<()>
    where
        E: sqlx::SqliteExecutor<'e>,
    {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            r"
            INSERT INTO local_records (id, kind, business_key, payload, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(record.id.as_uuid())
        .bind(record.kind.as_str())
        .bind(&record.business_key)
        .bind(payload)
        .bind(record.active)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Insert a new record.
    #[instrument(skip(self, payload))]
    pub async fn insert(
        &self,
        kind: EntityKind,
        payload: serde_json::Value,
        active: bool,
    ) -> LocalStoreResult<LocalRecord> {
        let record = LocalRecord::new(kind, payload, active);
        Self::insert_on(&self.pool, &record).await?;
        Ok(record)
    }

    /// Get a record by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: LocalRef) -> LocalStoreResult<LocalRecord> {
        let row = sqlx::query(
            r"
            SELECT id, kind, business_key, payload, active, created_at, updated_at
            FROM local_records
            WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map_or(Err(LocalStoreError::NotFound(id)), |r| row_to_record(&r))
    }

    /// Replace a record's payload, refreshing the derived business key.
    #[instrument(skip(self, payload))]
    pub async fn update_payload(
        &self,
        id: LocalRef,
        kind: EntityKind,
        payload: &serde_json::Value,
    ) -> LocalStoreResult<()> {
        let business_key = kind.business_key(payload);
        let text = serde_json::to_string(payload)?;
        let result = sqlx::query(
            r"
            UPDATE local_records
            SET payload = $1, business_key = $2, updated_at = $3
            WHERE id = $4
            ",
        )
        .bind(text)
        .bind(business_key)
        .bind(Utc::now())
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LocalStoreError::NotFound(id));
        }
        Ok(())
    }

    /// Find a record by its business key.
    #[instrument(skip(self))]
    pub async fn find_by_business_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> LocalStoreResult<Option<LocalRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, kind, business_key, payload, active, created_at, updated_at
            FROM local_records
            WHERE kind = $1 AND business_key = $2
            ",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Select records of a kind matching a domain filter, in insertion
    /// order.
    #[instrument(skip(self, filter))]
    pub async fn select(
        &self,
        kind: EntityKind,
        filter: &DomainFilter,
    ) -> LocalStoreResult<Vec<LocalRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, kind, business_key, payload, active, created_at, updated_at
            FROM local_records
            WHERE kind = $1
            ORDER BY created_at, id
            ",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::new();
        for row in &rows {
            let record = row_to_record(row)?;
            if filter.matches(&record.payload) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn row_to_record(row: &SqliteRow) -> LocalStoreResult<LocalRecord> {
    let payload: String = row.get("payload");
    let kind: String = row.get("kind");
    Ok(LocalRecord {
        id: LocalRef::from_uuid(row.get::<Uuid, _>("id")),
        kind: kind
            .parse()
            .map_err(|e: String| LocalStoreError::Database(sqlx::Error::Decode(e.into())))?,
        business_key: row.get("business_key"),
        payload: serde_json::from_str(&payload)?,
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("test.db")).await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        (dir, LocalStore::new(pool))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_dir, store) = store().await;
        let record = store
            .insert(EntityKind::Product, json!({"sku": "A-1", "name": "A"}), true)
            .await
            .unwrap();
        assert_eq!(record.business_key.as_deref(), Some("A-1"));

        let loaded = store.get(record.id).await.unwrap();
        assert_eq!(loaded.payload["name"], "A");
        assert_eq!(loaded.kind, EntityKind::Product);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.get(LocalRef::new()).await.unwrap_err();
        assert!(matches!(err, LocalStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_business_key_lookup() {
        let (_dir, store) = store().await;
        store
            .insert(EntityKind::Customer, json!({"email": "a@example.com"}), true)
            .await
            .unwrap();

        let found = store
            .find_by_business_key(EntityKind::Customer, "a@example.com")
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .find_by_business_key(EntityKind::Customer, "b@example.com")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_update_payload_refreshes_key() {
        let (_dir, store) = store().await;
        let record = store
            .insert(EntityKind::Product, json!({"sku": "OLD", "name": "P"}), true)
            .await
            .unwrap();

        store
            .update_payload(record.id, EntityKind::Product, &json!({"sku": "NEW", "name": "P"}))
            .await
            .unwrap();

        let loaded = store.get(record.id).await.unwrap();
        assert_eq!(loaded.business_key.as_deref(), Some("NEW"));
    }

    #[tokio::test]
    async fn test_select_applies_filter_in_order() {
        let (_dir, store) = store().await;
        store
            .insert(EntityKind::Product, json!({"sku": "A", "name": "A", "active": true}), true)
            .await
            .unwrap();
        store
            .insert(EntityKind::Product, json!({"sku": "B", "name": "B", "active": false}), true)
            .await
            .unwrap();
        store
            .insert(EntityKind::Product, json!({"sku": "C", "name": "C", "active": true}), true)
            .await
            .unwrap();

        let active = store
            .select(EntityKind::Product, &DomainFilter::field("active", true))
            .await
            .unwrap();
        let keys: Vec<_> = active
            .iter()
            .map(|r| r.business_key.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["A", "C"]);
    }
}
