// Script catalog and synchronized file persistence

use super::queries::{file_queries, script_queries};
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{RepositoryFile, Script};
use sqlx::types::Json;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Repository for the scripts and repository_files tables
pub struct CatalogRepository {
    pool: DbPool,
}

impl CatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn find_script(&self, id: Uuid) -> Result<Option<Script>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM scripts WHERE id = $1",
            script_queries::SELECT_ALL_COLUMNS
        );
        let script = sqlx::query_as::<_, Script>(&query)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(script)
    }

    #[instrument(skip(self))]
    pub async fn find_script_by_source(
        &self,
        binding_id: Uuid,
        path: &str,
    ) -> Result<Option<Script>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM scripts WHERE binding_id = $1 AND source_path = $2",
            script_queries::SELECT_ALL_COLUMNS
        );
        let script = sqlx::query_as::<_, Script>(&query)
            .bind(binding_id)
            .bind(path)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(script)
    }

    #[instrument(skip(self))]
    pub async fn list_files(
        &self,
        binding_id: Uuid,
        branch: &str,
    ) -> Result<Vec<RepositoryFile>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM repository_files WHERE binding_id = $1 AND branch = $2 ORDER BY path",
            file_queries::SELECT_ALL_COLUMNS
        );
        let files = sqlx::query_as::<_, RepositoryFile>(&query)
            .bind(binding_id)
            .bind(branch)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(files)
    }

    #[instrument(skip(self))]
    pub async fn find_file(
        &self,
        binding_id: Uuid,
        path: &str,
        branch: &str,
    ) -> Result<Option<RepositoryFile>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM repository_files WHERE binding_id = $1 AND path = $2 AND branch = $3",
            file_queries::SELECT_ALL_COLUMNS
        );
        let file = sqlx::query_as::<_, RepositoryFile>(&query)
            .bind(binding_id)
            .bind(path)
            .bind(branch)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(file)
    }

    /// Upsert the catalog entry, then the file row pointing at it, in one transaction
    #[instrument(skip(self, file, script), fields(path = %file.path, script_id = %script.id))]
    pub async fn commit_file(
        &self,
        file: &RepositoryFile,
        script: &Script,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        upsert_script(&mut tx, script).await?;
        upsert_file(&mut tx, file).await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        tracing::debug!(path = %file.path, version = script.version, "Catalog file committed");
        Ok(())
    }

    /// Delete the file row and deactivate its catalog entry in one transaction
    #[instrument(skip(self, file), fields(path = %file.path))]
    pub async fn remove_file(&self, file: &RepositoryFile) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM repository_files WHERE binding_id = $1 AND path = $2 AND branch = $3",
        )
        .bind(file.binding_id)
        .bind(&file.path)
        .bind(&file.branch)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "Repository file not found: {}",
                file.path
            )));
        }

        if let Some(script_id) = file.script_id {
            sqlx::query("UPDATE scripts SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
                .bind(script_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        Ok(())
    }
}

async fn upsert_script(conn: &mut PgConnection, script: &Script) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO scripts (
            id, name, description, version, content, content_hash, tags,
            is_active, timeout_seconds, min_runtime_version, risk_level,
            requires_elevation, parameters, dependencies, binding_id, source_path,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name,
            description = EXCLUDED.description,
            version = EXCLUDED.version,
            content = EXCLUDED.content,
            content_hash = EXCLUDED.content_hash,
            tags = EXCLUDED.tags,
            is_active = EXCLUDED.is_active,
            timeout_seconds = EXCLUDED.timeout_seconds,
            min_runtime_version = EXCLUDED.min_runtime_version,
            risk_level = EXCLUDED.risk_level,
            requires_elevation = EXCLUDED.requires_elevation,
            parameters = EXCLUDED.parameters,
            dependencies = EXCLUDED.dependencies,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(script.id)
    .bind(&script.name)
    .bind(&script.description)
    .bind(script.version)
    .bind(&script.content)
    .bind(&script.content_hash)
    .bind(Json(&script.tags))
    .bind(script.is_active)
    .bind(script.timeout_seconds)
    .bind(&script.min_runtime_version)
    .bind(script.risk_level.to_string())
    .bind(script.requires_elevation)
    .bind(Json(&script.parameters))
    .bind(Json(&script.dependencies))
    .bind(script.binding_id)
    .bind(&script.source_path)
    .bind(script.created_at)
    .bind(script.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_file(conn: &mut PgConnection, file: &RepositoryFile) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO repository_files (
            id, binding_id, path, branch, content_hash, script_id,
            risk_level, requires_elevation, findings, parse_warnings, last_modified_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (binding_id, path, branch) DO UPDATE
        SET content_hash = EXCLUDED.content_hash,
            script_id = EXCLUDED.script_id,
            risk_level = EXCLUDED.risk_level,
            requires_elevation = EXCLUDED.requires_elevation,
            findings = EXCLUDED.findings,
            parse_warnings = EXCLUDED.parse_warnings,
            last_modified_at = EXCLUDED.last_modified_at
        "#,
    )
    .bind(file.id)
    .bind(file.binding_id)
    .bind(&file.path)
    .bind(&file.branch)
    .bind(&file.content_hash)
    .bind(file.script_id)
    .bind(file.risk_level.to_string())
    .bind(file.requires_elevation)
    .bind(Json(&file.findings))
    .bind(Json(&file.parse_warnings))
    .bind(file.last_modified_at)
    .execute(conn)
    .await?;
    Ok(())
}
