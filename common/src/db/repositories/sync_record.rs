// Sync history persistence

use super::queries::sync_queries;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{SyncOutcome, SyncRecord};
use tracing::instrument;
use uuid::Uuid;

/// Repository for sync_records rows. Rows are written twice at most:
/// once as `running`, once with the final outcome.
pub struct SyncRecordRepository {
    pool: DbPool,
}

impl SyncRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a running record. A partial unique index on
    /// (binding_id) WHERE outcome = 'running' turns a concurrent start into
    /// `DatabaseError::DuplicateKey`.
    #[instrument(skip(self, record), fields(sync_id = %record.id, binding_id = %record.binding_id))]
    pub async fn insert(&self, record: &SyncRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (
                id, binding_id, kind, outcome,
                files_added, files_updated, files_removed, files_failed,
                commit_sha, duration_ms, error, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.binding_id)
        .bind(record.kind.to_string())
        .bind(record.outcome.to_string())
        .bind(record.files_added)
        .bind(record.files_updated)
        .bind(record.files_removed)
        .bind(record.files_failed)
        .bind(&record.commit_sha)
        .bind(record.duration_ms)
        .bind(&record.error)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Complete a running record; completed records are never touched again
    #[instrument(skip(self, record), fields(sync_id = %record.id, outcome = %record.outcome))]
    pub async fn complete(&self, record: &SyncRecord) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_records
            SET outcome = $2,
                files_added = $3,
                files_updated = $4,
                files_removed = $5,
                files_failed = $6,
                commit_sha = $7,
                duration_ms = $8,
                error = $9,
                completed_at = $10
            WHERE id = $1 AND outcome = $11
            "#,
        )
        .bind(record.id)
        .bind(record.outcome.to_string())
        .bind(record.files_added)
        .bind(record.files_updated)
        .bind(record.files_removed)
        .bind(record.files_failed)
        .bind(&record.commit_sha)
        .bind(record.duration_ms)
        .bind(&record.error)
        .bind(record.completed_at)
        .bind(SyncOutcome::Running.to_string())
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "No running sync record {}",
                record.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find_by_binding(
        &self,
        binding_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SyncRecord>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM sync_records WHERE binding_id = $1 ORDER BY started_at DESC LIMIT $2",
            sync_queries::SELECT_ALL_COLUMNS
        );
        let records = sqlx::query_as::<_, SyncRecord>(&query)
            .bind(binding_id)
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(records)
    }
}
