// Remote repository host access

pub mod client;

pub use client::GitHubClient;

use crate::errors::RepositoryError;
use crate::models::RepoRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of a directory listing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Submodule,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Content digest as reported by the host (git blob sha)
    pub sha: String,
    #[serde(default)]
    pub size: u64,
}

/// Decoded content of a remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub content: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub head_sha: String,
}

/// RepositoryClient is the typed facade over the host's REST API.
///
/// Implementations gate every call through the shared rate limiter and
/// retry transient failures on their own; errors that reach the caller are
/// final for that call.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Entries of one directory (`""` is the repository root)
    async fn list_directory(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, RepositoryError>;

    async fn get_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<RemoteFile, RepositoryError>;

    async fn get_repository(&self, repo: &RepoRef) -> Result<RepositoryInfo, RepositoryError>;

    async fn get_branch(&self, repo: &RepoRef, branch: &str) -> Result<BranchInfo, RepositoryError>;
}
