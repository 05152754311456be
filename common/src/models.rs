use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::parser::{ScriptDependency, ScriptMetadata, ScriptParameter, SecurityFinding};

/// Implements Display/FromStr/TryFrom<String> for a snake_case status enum
/// so it can round-trip through a text column.
macro_rules! text_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text),)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_str(&s)
            }
        }
    };
}

// ============================================================================
// Security classification
// ============================================================================

/// RiskLevel is the coarse result of static security screening
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    High,
}

text_enum!(RiskLevel, "risk level" {
    Low => "low",
    High => "high",
});

// ============================================================================
// Catalog Models
// ============================================================================

/// Script is a catalog entry: a registered, executable script version
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Script {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: i32,
    pub content: String,
    pub content_hash: String,
    #[sqlx(json)]
    pub tags: Vec<String>,
    pub is_active: bool,
    pub timeout_seconds: i32,
    pub min_runtime_version: Option<String>,
    #[sqlx(try_from = "String")]
    pub risk_level: RiskLevel,
    pub requires_elevation: bool,
    #[sqlx(json)]
    pub parameters: Vec<ScriptParameter>,
    #[sqlx(json)]
    pub dependencies: Vec<ScriptDependency>,
    pub binding_id: Option<Uuid>,
    pub source_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Script {
    /// Build a first-version catalog entry from parsed repository content
    pub fn from_source(
        binding_id: Uuid,
        path: &str,
        content: String,
        content_hash: String,
        metadata: &ScriptMetadata,
        timeout_seconds: i32,
    ) -> Self {
        let now = Utc::now();
        let mut script = Self {
            id: Uuid::new_v4(),
            name: metadata.name.clone(),
            description: None,
            version: 1,
            content,
            content_hash,
            tags: Vec::new(),
            is_active: true,
            timeout_seconds,
            min_runtime_version: None,
            risk_level: RiskLevel::Low,
            requires_elevation: false,
            parameters: Vec::new(),
            dependencies: Vec::new(),
            binding_id: Some(binding_id),
            source_path: Some(path.to_string()),
            created_at: now,
            updated_at: now,
        };
        script.apply_metadata(metadata);
        script
    }

    /// Replace content with a new revision. The version only moves when
    /// the content hash changes; a reactivated entry always gets a new one.
    pub fn revise(&mut self, content: String, content_hash: String, metadata: &ScriptMetadata) {
        if self.content_hash != content_hash || !self.is_active {
            self.version += 1;
        }
        self.content = content;
        self.content_hash = content_hash;
        self.is_active = true;
        self.apply_metadata(metadata);
        self.updated_at = Utc::now();
    }

    fn apply_metadata(&mut self, metadata: &ScriptMetadata) {
        self.description = metadata.summary();
        self.tags = metadata.tags.clone();
        self.min_runtime_version = metadata.min_runtime_version.clone();
        self.risk_level = metadata.security.risk_level;
        self.requires_elevation = metadata.security.requires_elevation;
        self.parameters = metadata.parameters.clone();
        self.dependencies = metadata.dependencies.clone();
    }
}

/// BindingStatus is the lifecycle state of a repository binding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    Active,
    Inactive,
    Archived,
}

text_enum!(BindingStatus, "binding status" {
    Active => "active",
    Inactive => "inactive",
    Archived => "archived",
});

/// RepositoryBinding is a tracked link to one remote repository and branch
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RepositoryBinding {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub branch: String,
    #[sqlx(try_from = "String")]
    pub status: BindingStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RepositoryBinding {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            branch: branch.into(),
            status: BindingStatus::Active,
            last_synced_at: None,
            created_at: Utc::now(),
        }
    }

    /// `owner/name`, the form used by the host and by webhook payloads
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(self.owner.clone(), self.name.clone())
    }
}

/// RepoRef identifies a repository on the remote host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse an `owner/name` string
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// RepositoryFile is the synchronized state of one remote script file
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RepositoryFile {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub path: String,
    pub branch: String,
    pub content_hash: String,
    pub script_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub risk_level: RiskLevel,
    pub requires_elevation: bool,
    #[sqlx(json)]
    pub findings: Vec<SecurityFinding>,
    #[sqlx(json)]
    pub parse_warnings: Vec<String>,
    pub last_modified_at: DateTime<Utc>,
}

// ============================================================================
// Sync history
// ============================================================================

/// SyncKind distinguishes a full listing from a webhook-scoped sync
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Full,
    Incremental,
}

text_enum!(SyncKind, "sync kind" {
    Full => "full",
    Incremental => "incremental",
});

/// SyncOutcome is the result of one sync run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Running,
    Success,
    Partial,
    Failure,
}

text_enum!(SyncOutcome, "sync outcome" {
    Running => "running",
    Success => "success",
    Partial => "partial",
    Failure => "failure",
});

/// SyncRecord is the append-only history entry for one sync run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncRecord {
    pub id: Uuid,
    pub binding_id: Uuid,
    #[sqlx(try_from = "String")]
    pub kind: SyncKind,
    #[sqlx(try_from = "String")]
    pub outcome: SyncOutcome,
    pub files_added: i32,
    pub files_updated: i32,
    pub files_removed: i32,
    pub files_failed: i32,
    pub commit_sha: Option<String>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncRecord {
    pub fn start(binding_id: Uuid, kind: SyncKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            binding_id,
            kind,
            outcome: SyncOutcome::Running,
            files_added: 0,
            files_updated: 0,
            files_removed: 0,
            files_failed: 0,
            commit_sha: None,
            duration_ms: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn total_changes(&self) -> i32 {
        self.files_added + self.files_updated + self.files_removed
    }
}

// ============================================================================
// Execution Models
// ============================================================================

/// ExecutionStatus represents the lifecycle of a script execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(ExecutionStatus, "execution status" {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// ExecutionRecord is the durable account of one script execution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub script_id: Option<Uuid>,
    pub script_version: Option<i32>,
    pub ad_hoc_content: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    #[sqlx(json)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub timeout_seconds: i32,
    pub constrained_mode: bool,
    pub memory_limit_mb: Option<i64>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub host_name: Option<String>,
    pub runtime_version: Option<String>,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a new pending execution at admission time
    pub fn new_pending(
        script_id: Option<Uuid>,
        ad_hoc_content: Option<String>,
        parameters: HashMap<String, serde_json::Value>,
        timeout_seconds: i32,
        constrained_mode: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            script_id,
            script_version: None,
            ad_hoc_content,
            status: ExecutionStatus::Pending,
            parameters,
            timeout_seconds,
            constrained_mode,
            memory_limit_mb: None,
            output: None,
            error_output: None,
            exit_code: None,
            error: None,
            host_name: None,
            runtime_version: None,
            requested_by: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// RateLimitState is a snapshot of the remote host's API quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub remaining: u32,
    pub ceiling: u32,
    pub reset_at: Option<DateTime<Utc>>,
}
