// Persistence collaborators used by the sync and execution engines

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::errors::StorageError;
use crate::models::{
    ExecutionRecord, ExecutionStatus, RepositoryBinding, RepositoryFile, Script, SyncRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Catalog side: bindings, synchronized files, scripts and sync history
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_active_bindings(&self) -> Result<Vec<RepositoryBinding>, StorageError>;

    async fn find_binding(&self, id: Uuid) -> Result<Option<RepositoryBinding>, StorageError>;

    /// Look up the binding tracking `branch` of `owner`/`name`. Owner and
    /// name compare case-insensitively, the branch exactly.
    async fn find_binding_by_name(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Option<RepositoryBinding>, StorageError>;

    /// Insert or replace a binding. A repository may be bound once per
    /// branch; a second binding for the same branch is a conflict.
    async fn save_binding(&self, binding: &RepositoryBinding) -> Result<(), StorageError>;

    async fn mark_binding_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError>;

    async fn list_files(
        &self,
        binding_id: Uuid,
        branch: &str,
    ) -> Result<Vec<RepositoryFile>, StorageError>;

    async fn find_file(
        &self,
        binding_id: Uuid,
        path: &str,
        branch: &str,
    ) -> Result<Option<RepositoryFile>, StorageError>;

    async fn find_script(&self, id: Uuid) -> Result<Option<Script>, StorageError>;

    /// Catalog entry sourced from a binding path, active or not
    async fn find_script_by_source(
        &self,
        binding_id: Uuid,
        path: &str,
    ) -> Result<Option<Script>, StorageError>;

    /// Upsert a file and its catalog entry as one unit
    async fn commit_file(&self, file: &RepositoryFile, script: &Script) -> Result<(), StorageError>;

    /// Delete a file and deactivate its catalog entry as one unit
    async fn remove_file(&self, file: &RepositoryFile) -> Result<(), StorageError>;

    async fn insert_sync_record(&self, record: &SyncRecord) -> Result<(), StorageError>;

    /// Write the final state of a running record
    async fn complete_sync_record(&self, record: &SyncRecord) -> Result<(), StorageError>;

    /// Most recent first
    async fn list_sync_records(
        &self,
        binding_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SyncRecord>, StorageError>;
}

/// Execution side: execution records plus read access to the catalog
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn fetch_script(&self, id: Uuid) -> Result<Option<Script>, StorageError>;

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    async fn find_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StorageError>;

    /// Oldest first
    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;
}
