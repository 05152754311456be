// Repository binding persistence

use super::queries::binding_queries;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{BindingStatus, RepositoryBinding};
use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

/// Repository for repository_bindings rows
pub struct BindingRepository {
    pool: DbPool,
}

impl BindingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn find_active(&self) -> Result<Vec<RepositoryBinding>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM repository_bindings WHERE status = $1 ORDER BY created_at",
            binding_queries::SELECT_ALL_COLUMNS
        );
        let bindings = sqlx::query_as::<_, RepositoryBinding>(&query)
            .bind(BindingStatus::Active.to_string())
            .fetch_all(self.pool.pool())
            .await?;
        Ok(bindings)
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<RepositoryBinding>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM repository_bindings WHERE id = $1",
            binding_queries::SELECT_ALL_COLUMNS
        );
        let binding = sqlx::query_as::<_, RepositoryBinding>(&query)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(binding)
    }

    #[instrument(skip(self))]
    pub async fn find_by_name(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Option<RepositoryBinding>, DatabaseError> {
        let query = format!(
            r#"SELECT {} FROM repository_bindings
            WHERE lower(owner) = lower($1) AND lower(name) = lower($2) AND branch = $3"#,
            binding_queries::SELECT_ALL_COLUMNS
        );
        let binding = sqlx::query_as::<_, RepositoryBinding>(&query)
            .bind(owner)
            .bind(name)
            .bind(branch)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(binding)
    }

    #[instrument(skip(self, binding), fields(binding_id = %binding.id))]
    pub async fn upsert(&self, binding: &RepositoryBinding) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO repository_bindings (id, owner, name, branch, status, last_synced_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET owner = EXCLUDED.owner,
                name = EXCLUDED.name,
                branch = EXCLUDED.branch,
                status = EXCLUDED.status,
                last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(binding.id)
        .bind(&binding.owner)
        .bind(&binding.name)
        .bind(&binding.branch)
        .bind(binding.status.to_string())
        .bind(binding.last_synced_at)
        .bind(binding.created_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE repository_bindings SET last_synced_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Binding not found: {}", id)));
        }
        Ok(())
    }
}
