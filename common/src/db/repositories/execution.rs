// Script execution record persistence

use super::queries::execution_queries;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{ExecutionRecord, ExecutionStatus};
use sqlx::types::Json;
use tracing::instrument;
use uuid::Uuid;

/// Repository for script_executions rows
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a new execution record at admission time
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    pub async fn create(&self, execution: &ExecutionRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO script_executions (
                id, script_id, script_version, ad_hoc_content, status, parameters,
                timeout_seconds, constrained_mode, memory_limit_mb,
                output, error_output, exit_code, error,
                host_name, runtime_version, requested_by,
                created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(execution.id)
        .bind(execution.script_id)
        .bind(execution.script_version)
        .bind(&execution.ad_hoc_content)
        .bind(execution.status.to_string())
        .bind(Json(&execution.parameters))
        .bind(execution.timeout_seconds)
        .bind(execution.constrained_mode)
        .bind(execution.memory_limit_mb)
        .bind(&execution.output)
        .bind(&execution.error_output)
        .bind(execution.exit_code)
        .bind(&execution.error)
        .bind(&execution.host_name)
        .bind(&execution.runtime_version)
        .bind(&execution.requested_by)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(
            execution_id = %execution.id,
            script_id = ?execution.script_id,
            "Execution created"
        );
        Ok(())
    }

    /// Write the mutable part of an execution record
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status))]
    pub async fn update(&self, execution: &ExecutionRecord) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE script_executions
            SET status = $2,
                script_version = $3,
                memory_limit_mb = $4,
                output = $5,
                error_output = $6,
                exit_code = $7,
                error = $8,
                host_name = $9,
                runtime_version = $10,
                started_at = $11,
                completed_at = $12
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.to_string())
        .bind(execution.script_version)
        .bind(execution.memory_limit_mb)
        .bind(&execution.output)
        .bind(&execution.error_output)
        .bind(execution.exit_code)
        .bind(&execution.error)
        .bind(&execution.host_name)
        .bind(&execution.runtime_version)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "Execution not found: {}",
                execution.id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM script_executions WHERE id = $1",
            execution_queries::SELECT_ALL_COLUMNS
        );
        let execution = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(execution)
    }

    #[instrument(skip(self))]
    pub async fn find_by_status(
        &self,
        status: ExecutionStatus,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM script_executions WHERE status = $1 ORDER BY created_at LIMIT $2",
            execution_queries::SELECT_ALL_COLUMNS
        );
        let executions = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(status.to_string())
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(executions)
    }
}
