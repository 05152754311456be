// Repository synchronization into the script catalog

pub mod diff;

use crate::config::Settings;
use crate::errors::{RepositoryError, StorageError, SyncError};
use crate::github::{EntryKind, RemoteEntry, RemoteFile, RepositoryClient};
use crate::models::{
    BindingStatus, RepoRef, RepositoryBinding, RepositoryFile, Script, SyncKind, SyncOutcome,
    SyncRecord,
};
use crate::parser::ScriptParser;
use crate::store::CatalogStore;
use crate::telemetry;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Knobs the engine needs from configuration
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub script_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    /// Timeout budget given to newly catalogued scripts
    pub default_timeout_seconds: i32,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            script_extensions: settings.sync.script_extensions.clone(),
            max_file_size_bytes: settings.sync.max_file_size_bytes,
            default_timeout_seconds: settings
                .execution
                .default_timeout_seconds
                .min(i32::MAX as u64) as i32,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Which files a run looks at
#[derive(Debug, Clone)]
enum SyncScope {
    Full,
    Paths(Vec<String>),
}

impl SyncScope {
    fn kind(&self) -> SyncKind {
        match self {
            SyncScope::Full => SyncKind::Full,
            SyncScope::Paths(_) => SyncKind::Incremental,
        }
    }
}

/// Running tally for one sync run
#[derive(Debug, Default)]
struct Tally {
    added: i32,
    updated: i32,
    removed: i32,
    failed: i32,
}

impl Tally {
    fn write_to(&self, record: &mut SyncRecord) {
        record.files_added = self.added;
        record.files_updated = self.updated;
        record.files_removed = self.removed;
        record.files_failed = self.failed;
    }
}

enum Applied {
    Added,
    Updated,
    Skipped,
}

/// Marks a binding as syncing for as long as it is alive
struct InProgressGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    binding_id: Uuid,
}

impl InProgressGuard {
    fn acquire(set: &Arc<Mutex<HashSet<Uuid>>>, binding_id: Uuid) -> Option<Self> {
        let mut running = set.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(binding_id) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            binding_id,
        })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut running = self.set.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.binding_id);
    }
}

/// SyncEngine mirrors one repository binding's scripts into the catalog.
///
/// At most one run per binding is in flight inside this process; a second
/// request is rejected with [`SyncError::AlreadyRunning`], never queued.
pub struct SyncEngine {
    store: Arc<dyn CatalogStore>,
    client: Arc<dyn RepositoryClient>,
    parser: ScriptParser,
    options: SyncOptions,
    in_progress: Arc<Mutex<HashSet<Uuid>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        client: Arc<dyn RepositoryClient>,
        options: SyncOptions,
    ) -> Self {
        Self {
            parser: ScriptParser::new(&options.script_extensions),
            store,
            client,
            options,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a run for this binding is currently in flight
    pub fn is_running(&self, binding_id: Uuid) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&binding_id)
    }

    /// List the whole repository and reconcile every script file
    #[instrument(skip(self))]
    pub async fn full_sync(&self, binding_id: Uuid) -> Result<SyncRecord, SyncError> {
        self.run(binding_id, SyncScope::Full).await
    }

    /// Reconcile only the named paths. A path the host no longer has is
    /// treated as removed.
    #[instrument(skip(self, paths), fields(path_count = paths.len()))]
    pub async fn incremental_sync(
        &self,
        binding_id: Uuid,
        paths: Vec<String>,
    ) -> Result<SyncRecord, SyncError> {
        self.run(binding_id, SyncScope::Paths(paths)).await
    }

    async fn run(&self, binding_id: Uuid, scope: SyncScope) -> Result<SyncRecord, SyncError> {
        let _guard = InProgressGuard::acquire(&self.in_progress, binding_id)
            .ok_or(SyncError::AlreadyRunning(binding_id))?;

        let binding = self
            .store
            .find_binding(binding_id)
            .await?
            .ok_or_else(|| SyncError::BindingNotFound(binding_id.to_string()))?;
        if binding.status != BindingStatus::Active {
            return Err(SyncError::BindingInactive(binding.full_name()));
        }

        let kind = scope.kind();
        let mut record = SyncRecord::start(binding.id, kind);
        match self.store.insert_sync_record(&record).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => return Err(SyncError::AlreadyRunning(binding_id)),
            Err(e) => return Err(e.into()),
        }

        info!(
            sync_id = %record.id,
            repository = %binding.full_name(),
            branch = %binding.branch,
            kind = %kind,
            "Sync started"
        );

        let started = Instant::now();
        let mut tally = Tally::default();
        let result = match &scope {
            SyncScope::Full => self.sync_full(&binding, &mut record, &mut tally).await,
            SyncScope::Paths(paths) => self.sync_paths(&binding, paths, &mut tally).await,
        };

        tally.write_to(&mut record);
        record.duration_ms = Some(started.elapsed().as_millis() as i64);
        record.completed_at = Some(Utc::now());

        match result {
            Ok(None) => {
                record.outcome = if tally.failed > 0 {
                    SyncOutcome::Partial
                } else {
                    SyncOutcome::Success
                };
            }
            Ok(Some(listing_error)) => {
                record.outcome = SyncOutcome::Failure;
                record.error = Some(listing_error);
            }
            Err(e) => {
                record.outcome = SyncOutcome::Failure;
                record.error = Some(e.to_string());
                if let Err(complete_err) = self.store.complete_sync_record(&record).await {
                    error!(
                        sync_id = %record.id,
                        error = %complete_err,
                        "Failed to record sync failure"
                    );
                }
                self.finish_metrics(&record, started);
                error!(sync_id = %record.id, error = %e, "Sync aborted by storage failure");
                return Err(e);
            }
        }

        if matches!(record.outcome, SyncOutcome::Success | SyncOutcome::Partial) {
            self.store
                .mark_binding_synced(binding.id, record.completed_at.unwrap_or_else(Utc::now))
                .await?;
        }
        self.store.complete_sync_record(&record).await?;
        self.finish_metrics(&record, started);

        info!(
            sync_id = %record.id,
            repository = %binding.full_name(),
            outcome = %record.outcome,
            added = record.files_added,
            updated = record.files_updated,
            removed = record.files_removed,
            failed = record.files_failed,
            duration_ms = record.duration_ms,
            "Sync finished"
        );

        Ok(record)
    }

    fn finish_metrics(&self, record: &SyncRecord, started: Instant) {
        telemetry::record_sync(record.kind, record.outcome, started.elapsed().as_secs_f64());
        telemetry::record_sync_changes(
            record.files_added.max(0) as u64,
            record.files_updated.max(0) as u64,
            record.files_removed.max(0) as u64,
        );
    }

    /// Full listing. `Ok(Some(msg))` reports a listing failure; `Err` is fatal.
    async fn sync_full(
        &self,
        binding: &RepositoryBinding,
        record: &mut SyncRecord,
        tally: &mut Tally,
    ) -> Result<Option<String>, SyncError> {
        let repo = binding.repo_ref();

        match self.client.get_branch(&repo, &binding.branch).await {
            Ok(branch) => record.commit_sha = Some(branch.head_sha),
            Err(e) => return Ok(Some(format!("Failed to resolve branch {}: {}", binding.branch, e))),
        }

        let remote = match self.list_scripts(&repo, &binding.branch).await {
            Ok(remote) => remote,
            Err(e) => return Ok(Some(format!("Failed to list repository: {}", e))),
        };

        let local = self.store.list_files(binding.id, &binding.branch).await?;
        let plan = diff::plan(remote, local);
        debug!(
            added = plan.added.len(),
            updated = plan.updated.len(),
            removed = plan.removed.len(),
            unchanged = plan.unchanged,
            "Sync plan computed"
        );

        for entry in plan.added {
            self.fetch_and_apply(binding, &entry, None, tally).await?;
        }
        for (entry, existing) in plan.updated {
            self.fetch_and_apply(binding, &entry, Some(&existing), tally).await?;
        }
        for file in plan.removed {
            self.store.remove_file(&file).await?;
            info!(path = %file.path, "Script removed from repository, catalog entry deactivated");
            tally.removed += 1;
        }

        Ok(None)
    }

    /// Breadth-first walk from the root, keeping files with script extensions
    async fn list_scripts(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Vec<RemoteEntry>, RepositoryError> {
        let mut scripts = Vec::new();
        let mut pending = VecDeque::from([String::new()]);
        let mut visited = HashSet::new();

        while let Some(dir) = pending.pop_front() {
            if !visited.insert(dir.clone()) {
                continue;
            }
            for entry in self.client.list_directory(repo, branch, &dir).await? {
                match entry.kind {
                    EntryKind::Dir => pending.push_back(entry.path),
                    EntryKind::File if self.parser.is_script_path(&entry.path) => {
                        scripts.push(entry)
                    }
                    _ => {}
                }
            }
        }
        Ok(scripts)
    }

    async fn fetch_and_apply(
        &self,
        binding: &RepositoryBinding,
        entry: &RemoteEntry,
        existing: Option<&RepositoryFile>,
        tally: &mut Tally,
    ) -> Result<(), SyncError> {
        if entry.size > self.options.max_file_size_bytes {
            warn!(
                path = %entry.path,
                size = entry.size,
                max_size = self.options.max_file_size_bytes,
                "Script exceeds maximum file size, skipped"
            );
            return Ok(());
        }

        let remote = match self
            .client
            .get_file(&binding.repo_ref(), &binding.branch, &entry.path)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(path = %entry.path, error = %e, "Failed to fetch script, counted as failed");
                tally.failed += 1;
                return Ok(());
            }
        };

        match self.apply(binding, remote, existing).await? {
            Applied::Added => tally.added += 1,
            Applied::Updated => tally.updated += 1,
            Applied::Skipped => {}
        }
        Ok(())
    }

    async fn sync_paths(
        &self,
        binding: &RepositoryBinding,
        paths: &[String],
        tally: &mut Tally,
    ) -> Result<Option<String>, SyncError> {
        let repo = binding.repo_ref();
        let mut seen = HashSet::new();

        for path in paths {
            let path = path.trim_start_matches('/');
            if !self.parser.is_script_path(path) || !seen.insert(path.to_string()) {
                continue;
            }

            let existing = self.store.find_file(binding.id, path, &binding.branch).await?;

            match self.client.get_file(&repo, &binding.branch, path).await {
                Ok(remote) => {
                    if existing.as_ref().map(|f| f.content_hash.as_str()) == Some(remote.sha.as_str()) {
                        continue;
                    }
                    if remote.content.len() as u64 > self.options.max_file_size_bytes {
                        warn!(path = %path, "Script exceeds maximum file size, skipped");
                        continue;
                    }
                    match self.apply(binding, remote, existing.as_ref()).await? {
                        Applied::Added => tally.added += 1,
                        Applied::Updated => tally.updated += 1,
                        Applied::Skipped => {}
                    }
                }
                Err(e) if e.is_not_found() => {
                    if let Some(file) = existing {
                        self.store.remove_file(&file).await?;
                        info!(path = %path, "Script removed from repository, catalog entry deactivated");
                        tally.removed += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to fetch script, counted as failed");
                    tally.failed += 1;
                }
            }
        }

        Ok(None)
    }

    /// Parse fetched content and commit the file plus its catalog entry
    async fn apply(
        &self,
        binding: &RepositoryBinding,
        remote: RemoteFile,
        existing: Option<&RepositoryFile>,
    ) -> Result<Applied, SyncError> {
        if existing.map(|f| f.content_hash == remote.sha).unwrap_or(false) {
            return Ok(Applied::Skipped);
        }

        let metadata = self.parser.parse(&remote.content, &remote.path);
        if metadata.is_high_risk() {
            warn!(
                path = %remote.path,
                categories = ?metadata.security.categories(),
                "High-risk constructs found in script"
            );
        }

        let script = match self
            .store
            .find_script_by_source(binding.id, &remote.path)
            .await?
        {
            Some(mut script) => {
                script.revise(remote.content, remote.sha.clone(), &metadata);
                script
            }
            None => Script::from_source(
                binding.id,
                &remote.path,
                remote.content,
                remote.sha.clone(),
                &metadata,
                self.options.default_timeout_seconds,
            ),
        };

        let file = RepositoryFile {
            id: existing.map(|f| f.id).unwrap_or_else(Uuid::new_v4),
            binding_id: binding.id,
            path: remote.path.clone(),
            branch: binding.branch.clone(),
            content_hash: remote.sha,
            script_id: Some(script.id),
            risk_level: metadata.security.risk_level,
            requires_elevation: metadata.security.requires_elevation,
            findings: metadata.security.findings,
            parse_warnings: metadata.warnings,
            last_modified_at: Utc::now(),
        };

        self.store.commit_file(&file, &script).await?;
        debug!(path = %file.path, version = script.version, "Script committed to catalog");

        Ok(if existing.is_some() {
            Applied::Updated
        } else {
            Applied::Added
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_guard_releases_on_drop() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let id = Uuid::new_v4();

        let guard = InProgressGuard::acquire(&set, id).unwrap();
        assert!(InProgressGuard::acquire(&set, id).is_none());
        drop(guard);
        assert!(InProgressGuard::acquire(&set, id).is_some());
    }

    #[test]
    fn test_options_follow_settings() {
        let mut settings = Settings::default();
        settings.sync.max_file_size_bytes = 42;
        settings.execution.default_timeout_seconds = 90;
        let options = SyncOptions::from_settings(&settings);
        assert_eq!(options.max_file_size_bytes, 42);
        assert_eq!(options.default_timeout_seconds, 90);
    }
}
