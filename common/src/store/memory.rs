// In-process store for tests and local runs

use super::{CatalogStore, ExecutionStore};
use crate::errors::StorageError;
use crate::models::{
    ExecutionRecord, ExecutionStatus, RepositoryBinding, RepositoryFile, Script, SyncOutcome,
    SyncRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// (binding, path, branch)
type FileKey = (Uuid, String, String);

#[derive(Debug, Default)]
struct Tables {
    bindings: HashMap<Uuid, RepositoryBinding>,
    files: HashMap<FileKey, RepositoryFile>,
    scripts: HashMap<Uuid, Script>,
    sync_records: Vec<SyncRecord>,
    executions: HashMap<Uuid, ExecutionRecord>,
}

/// MemoryStore keeps every table in a single mutex-guarded map set.
/// The guard is never held across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a catalog entry directly, bypassing sync
    pub fn insert_script(&self, script: Script) {
        self.tables().scripts.insert(script.id, script);
    }

    pub fn scripts(&self) -> Vec<Script> {
        self.tables().scripts.values().cloned().collect()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.tables().executions.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_active_bindings(&self) -> Result<Vec<RepositoryBinding>, StorageError> {
        let mut bindings: Vec<RepositoryBinding> = self
            .tables()
            .bindings
            .values()
            .filter(|b| b.status == crate::models::BindingStatus::Active)
            .cloned()
            .collect();
        bindings.sort_by_key(|b| b.created_at);
        Ok(bindings)
    }

    async fn find_binding(&self, id: Uuid) -> Result<Option<RepositoryBinding>, StorageError> {
        Ok(self.tables().bindings.get(&id).cloned())
    }

    async fn find_binding_by_name(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Option<RepositoryBinding>, StorageError> {
        Ok(self
            .tables()
            .bindings
            .values()
            .find(|b| {
                b.owner.eq_ignore_ascii_case(owner)
                    && b.name.eq_ignore_ascii_case(name)
                    && b.branch == branch
            })
            .cloned())
    }

    async fn save_binding(&self, binding: &RepositoryBinding) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let duplicate = tables.bindings.values().any(|b| {
            b.id != binding.id
                && b.owner.eq_ignore_ascii_case(&binding.owner)
                && b.name.eq_ignore_ascii_case(&binding.name)
                && b.branch == binding.branch
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "Binding already exists for {}@{}",
                binding.full_name(),
                binding.branch
            )));
        }
        tables.bindings.insert(binding.id, binding.clone());
        Ok(())
    }

    async fn mark_binding_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        match self.tables().bindings.get_mut(&id) {
            Some(binding) => {
                binding.last_synced_at = Some(at);
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("Binding not found: {}", id))),
        }
    }

    async fn list_files(
        &self,
        binding_id: Uuid,
        branch: &str,
    ) -> Result<Vec<RepositoryFile>, StorageError> {
        let mut files: Vec<RepositoryFile> = self
            .tables()
            .files
            .values()
            .filter(|f| f.binding_id == binding_id && f.branch == branch)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn find_file(
        &self,
        binding_id: Uuid,
        path: &str,
        branch: &str,
    ) -> Result<Option<RepositoryFile>, StorageError> {
        let key = (binding_id, path.to_string(), branch.to_string());
        Ok(self.tables().files.get(&key).cloned())
    }

    async fn find_script(&self, id: Uuid) -> Result<Option<Script>, StorageError> {
        Ok(self.tables().scripts.get(&id).cloned())
    }

    async fn find_script_by_source(
        &self,
        binding_id: Uuid,
        path: &str,
    ) -> Result<Option<Script>, StorageError> {
        Ok(self
            .tables()
            .scripts
            .values()
            .find(|s| s.binding_id == Some(binding_id) && s.source_path.as_deref() == Some(path))
            .cloned())
    }

    async fn commit_file(&self, file: &RepositoryFile, script: &Script) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables.scripts.insert(script.id, script.clone());
        let key = (file.binding_id, file.path.clone(), file.branch.clone());
        tables.files.insert(key, file.clone());
        Ok(())
    }

    async fn remove_file(&self, file: &RepositoryFile) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let key = (file.binding_id, file.path.clone(), file.branch.clone());
        if tables.files.remove(&key).is_none() {
            return Err(StorageError::NotFound(format!(
                "Repository file not found: {}",
                file.path
            )));
        }
        if let Some(script) = file.script_id.and_then(|id| tables.scripts.get_mut(&id)) {
            script.is_active = false;
            script.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_sync_record(&self, record: &SyncRecord) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let running = tables
            .sync_records
            .iter()
            .any(|r| r.binding_id == record.binding_id && r.outcome == SyncOutcome::Running);
        if running {
            return Err(StorageError::Conflict(format!(
                "A sync is already running for binding {}",
                record.binding_id
            )));
        }
        tables.sync_records.push(record.clone());
        Ok(())
    }

    async fn complete_sync_record(&self, record: &SyncRecord) -> Result<(), StorageError> {
        let mut tables = self.tables();
        match tables
            .sync_records
            .iter_mut()
            .find(|r| r.id == record.id && r.outcome == SyncOutcome::Running)
        {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "No running sync record {}",
                record.id
            ))),
        }
    }

    async fn list_sync_records(
        &self,
        binding_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        let mut records: Vec<SyncRecord> = self
            .tables()
            .sync_records
            .iter()
            .filter(|r| r.binding_id == binding_id)
            .cloned()
            .collect();
        // Insertion order breaks timestamp ties
        records.reverse();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn fetch_script(&self, id: Uuid) -> Result<Option<Script>, StorageError> {
        Ok(self.tables().scripts.get(&id).cloned())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let mut tables = self.tables();
        if tables.executions.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "Execution already exists: {}",
                record.id
            )));
        }
        tables.executions.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        match self.tables().executions.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "Execution not found: {}",
                record.id
            ))),
        }
    }

    async fn find_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StorageError> {
        Ok(self.tables().executions.get(&id).cloned())
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut records: Vec<ExecutionRecord> = self
            .tables()
            .executions
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}
