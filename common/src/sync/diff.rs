// Hash-based comparison of remote listings against synchronized files

use crate::github::RemoteEntry;
use crate::models::RepositoryFile;
use std::collections::{HashMap, HashSet};

/// What a full sync has to do
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Present remotely, unknown locally
    pub added: Vec<RemoteEntry>,
    /// Present on both sides with different hashes
    pub updated: Vec<(RemoteEntry, RepositoryFile)>,
    /// Known locally, gone remotely
    pub removed: Vec<RepositoryFile>,
    pub unchanged: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Compare remote script entries with the local file set by path and hash
pub fn plan(remote: Vec<RemoteEntry>, local: Vec<RepositoryFile>) -> SyncPlan {
    let mut local_by_path: HashMap<String, RepositoryFile> =
        local.into_iter().map(|f| (f.path.clone(), f)).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut plan = SyncPlan::default();

    for entry in remote {
        if !seen.insert(entry.path.clone()) {
            continue;
        }
        match local_by_path.remove(&entry.path) {
            None => plan.added.push(entry),
            Some(file) if file.content_hash != entry.sha => plan.updated.push((entry, file)),
            Some(_) => plan.unchanged += 1,
        }
    }

    let mut removed: Vec<RepositoryFile> = local_by_path.into_values().collect();
    removed.sort_by(|a, b| a.path.cmp(&b.path));
    plan.removed = removed;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::EntryKind;
    use crate::models::RiskLevel;
    use chrono::Utc;
    use uuid::Uuid;

    fn remote(path: &str, sha: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            kind: EntryKind::File,
            sha: sha.to_string(),
            size: 10,
        }
    }

    fn local(path: &str, sha: &str) -> RepositoryFile {
        RepositoryFile {
            id: Uuid::new_v4(),
            binding_id: Uuid::nil(),
            path: path.to_string(),
            branch: "main".to_string(),
            content_hash: sha.to_string(),
            script_id: None,
            risk_level: RiskLevel::Low,
            requires_elevation: false,
            findings: Vec::new(),
            parse_warnings: Vec::new(),
            last_modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_plan_classifies_every_file_once() {
        let plan = plan(
            vec![remote("a.ps1", "1"), remote("b.ps1", "2"), remote("c.ps1", "3-new")],
            vec![local("a.ps1", "1"), local("c.ps1", "3"), local("d.ps1", "4")],
        );

        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.added.len(), 1);
        assert_eq!(plan.added[0].path, "b.ps1");
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(plan.updated[0].0.path, "c.ps1");
        assert_eq!(plan.updated[0].1.content_hash, "3");
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.removed[0].path, "d.ps1");
    }

    #[test]
    fn test_identical_sides_produce_empty_plan() {
        let plan = plan(vec![remote("x.ps1", "9")], vec![local("x.ps1", "9")]);
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_duplicate_remote_paths_are_ignored() {
        let plan = plan(vec![remote("x.ps1", "1"), remote("x.ps1", "2")], vec![]);
        assert_eq!(plan.added.len(), 1);
        assert_eq!(plan.added[0].sha, "1");
    }
}
