// Webhook signature validation and change-event routing

use crate::errors::{SyncError, WebhookError};
use crate::models::{RepoRef, SyncRecord};
use crate::store::CatalogStore;
use crate::sync::SyncEngine;
use crate::telemetry;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Compute the `sha256=<hex>` header value for a payload
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a `sha256=<hex>` signature header against the raw payload.
///
/// The digest comparison is constant-time. Empty, malformed or mismatched
/// input yields `false`.
pub fn validate_signature(payload: &[u8], header: &str, secret: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// What caused a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Push,
    BranchCreated,
    BranchDeleted,
    PullRequestMerged,
}

/// A request to sync one repository branch, derived from a webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub repository: RepoRef,
    pub branch: String,
    /// Changed paths; empty when the event does not name files
    pub paths: Vec<String>,
    pub trigger: SyncTrigger,
}

/// Result of processing one webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Dispatched(SyncRequest),
    Ignored(String),
    Rejected(String),
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Dispatched(_) => "dispatched",
            WebhookOutcome::Ignored(_) => "ignored",
            WebhookOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Hands sync requests off without making the webhook sender wait
#[cfg_attr(test, mockall::automock)]
pub trait SyncDispatcher: Send + Sync {
    fn dispatch(&self, request: SyncRequest);
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct CommitPayload {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: RepositoryPayload,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    commits: Vec<CommitPayload>,
    #[serde(default)]
    head_commit: Option<CommitPayload>,
}

#[derive(Debug, Deserialize)]
struct RefPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    ref_type: String,
    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct PullRequestBase {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestDetail {
    #[serde(default)]
    merged: bool,
    base: PullRequestBase,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequestDetail,
    repository: RepositoryPayload,
}

fn parse_repository(payload: &RepositoryPayload) -> Result<RepoRef, WebhookError> {
    RepoRef::parse(&payload.full_name).ok_or_else(|| {
        WebhookError::InvalidPayload(format!("Invalid repository name: {}", payload.full_name))
    })
}

/// Changed paths across all commits, first occurrence order
fn collect_paths(commits: &[CommitPayload]) -> Vec<String> {
    let mut seen: HashSet<&String> = HashSet::new();
    commits
        .iter()
        .flat_map(|c| c.added.iter().chain(&c.modified).chain(&c.removed))
        .filter(|p| seen.insert(*p))
        .cloned()
        .collect()
}

/// WebhookIngestor authenticates deliveries and turns recognized events
/// into sync requests. It never returns an error: every failure is folded
/// into a [`WebhookOutcome`] so the sender can be acknowledged promptly.
pub struct WebhookIngestor {
    secret: String,
    dispatcher: Arc<dyn SyncDispatcher>,
}

impl WebhookIngestor {
    pub fn new(secret: impl Into<String>, dispatcher: Arc<dyn SyncDispatcher>) -> Self {
        Self {
            secret: secret.into(),
            dispatcher,
        }
    }

    pub fn validate_signature(&self, payload: &[u8], header: &str) -> bool {
        validate_signature(payload, header, &self.secret)
    }

    /// Validate the signature, then process the event
    pub fn handle(&self, event_type: &str, signature: &str, payload: &[u8]) -> WebhookOutcome {
        if !self.validate_signature(payload, signature) {
            warn!(event_type = %event_type, "Webhook signature rejected");
            let outcome = WebhookOutcome::Rejected(WebhookError::InvalidSignature.to_string());
            telemetry::record_webhook_event(event_type, outcome.label());
            return outcome;
        }
        self.process(event_type, payload)
    }

    /// Route an already-authenticated event
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub fn process(&self, event_type: &str, payload: &[u8]) -> WebhookOutcome {
        let outcome = match self.route(event_type, payload) {
            Ok(Some(request)) => {
                info!(
                    repository = %request.repository,
                    branch = %request.branch,
                    path_count = request.paths.len(),
                    trigger = ?request.trigger,
                    "Dispatching sync for webhook event"
                );
                self.dispatcher.dispatch(request.clone());
                WebhookOutcome::Dispatched(request)
            }
            Ok(None) => {
                debug!(event_type = %event_type, "Webhook event acknowledged without sync");
                WebhookOutcome::Ignored(format!("No sync for {} event", event_type))
            }
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Malformed webhook payload");
                WebhookOutcome::Rejected(e.to_string())
            }
        };
        telemetry::record_webhook_event(event_type, outcome.label());
        outcome
    }

    fn route(&self, event_type: &str, payload: &[u8]) -> Result<Option<SyncRequest>, WebhookError> {
        match event_type {
            "push" => {
                let event: PushPayload = serde_json::from_slice(payload)?;
                let Some(branch) = event.git_ref.strip_prefix(BRANCH_REF_PREFIX) else {
                    return Ok(None);
                };
                let repository = parse_repository(&event.repository)?;
                if event.deleted {
                    return Ok(Some(SyncRequest {
                        repository,
                        branch: branch.to_string(),
                        paths: Vec::new(),
                        trigger: SyncTrigger::BranchDeleted,
                    }));
                }
                let mut paths = collect_paths(&event.commits);
                if paths.is_empty() {
                    if let Some(head) = &event.head_commit {
                        paths = collect_paths(std::slice::from_ref(head));
                    }
                }
                Ok(Some(SyncRequest {
                    repository,
                    branch: branch.to_string(),
                    paths,
                    trigger: SyncTrigger::Push,
                }))
            }
            "create" | "delete" => {
                let event: RefPayload = serde_json::from_slice(payload)?;
                if event.ref_type != "branch" {
                    return Ok(None);
                }
                let branch = event
                    .git_ref
                    .strip_prefix(BRANCH_REF_PREFIX)
                    .unwrap_or(&event.git_ref)
                    .to_string();
                Ok(Some(SyncRequest {
                    repository: parse_repository(&event.repository)?,
                    branch,
                    paths: Vec::new(),
                    trigger: if event_type == "create" {
                        SyncTrigger::BranchCreated
                    } else {
                        SyncTrigger::BranchDeleted
                    },
                }))
            }
            "pull_request" => {
                let event: PullRequestPayload = serde_json::from_slice(payload)?;
                if event.action != "closed" || !event.pull_request.merged {
                    return Ok(None);
                }
                Ok(Some(SyncRequest {
                    repository: parse_repository(&event.repository)?,
                    branch: event.pull_request.base.git_ref,
                    paths: Vec::new(),
                    trigger: SyncTrigger::PullRequestMerged,
                }))
            }
            // ping and everything else
            _ => Ok(None),
        }
    }
}

/// BackgroundSyncDispatcher resolves the tracked binding and runs the sync
/// on a spawned task
#[derive(Clone)]
pub struct BackgroundSyncDispatcher {
    store: Arc<dyn CatalogStore>,
    engine: Arc<SyncEngine>,
}

impl BackgroundSyncDispatcher {
    pub fn new(store: Arc<dyn CatalogStore>, engine: Arc<SyncEngine>) -> Self {
        Self { store, engine }
    }

    /// Resolve and run one request. `Ok(None)` means nothing was synced.
    #[instrument(skip(self, request), fields(repository = %request.repository, branch = %request.branch))]
    pub async fn execute(&self, request: SyncRequest) -> Result<Option<SyncRecord>, SyncError> {
        let Some(binding) = self
            .store
            .find_binding_by_name(
                &request.repository.owner,
                &request.repository.name,
                &request.branch,
            )
            .await?
        else {
            info!("Webhook for untracked repository or branch ignored");
            return Ok(None);
        };

        if request.trigger == SyncTrigger::BranchDeleted {
            warn!(binding_id = %binding.id, "Tracked branch deleted on repository host");
            return Ok(None);
        }

        // Pushes stay incremental even without paths; branch creation and
        // merged pull requests carry no file list and reconcile everything
        let record = match request.trigger {
            SyncTrigger::Push => self.engine.incremental_sync(binding.id, request.paths).await?,
            _ if request.paths.is_empty() => self.engine.full_sync(binding.id).await?,
            _ => self.engine.incremental_sync(binding.id, request.paths).await?,
        };
        Ok(Some(record))
    }
}

impl SyncDispatcher for BackgroundSyncDispatcher {
    fn dispatch(&self, request: SyncRequest) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.execute(request).await {
                Ok(_) => {}
                Err(SyncError::AlreadyRunning(binding_id)) => {
                    info!(binding_id = %binding_id, "Sync already running, webhook sync skipped");
                }
                Err(e) => error!(error = %e, "Webhook-triggered sync failed"),
            }
        });
    }
}
