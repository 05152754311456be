// GitHub REST v3 client

use super::{BranchInfo, EntryKind, RemoteEntry, RemoteFile, RepositoryClient, RepositoryInfo};
use crate::config::GitHubConfig;
use crate::errors::RepositoryError;
use crate::models::RepoRef;
use crate::rate_limit::RateLimiter;
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_RESET: &str = "x-ratelimit-reset";
const API_VERSION: &str = "2022-11-28";

/// Result of a single HTTP round trip
enum Attempt<T> {
    Done(T),
    Quota { reset_at: Option<DateTime<Utc>> },
    Failed(RepositoryError),
}

/// Rate-limit headers of one response
#[derive(Debug, Default, Clone, Copy)]
struct QuotaHeaders {
    remaining: Option<u32>,
    limit: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
    retry_after: Option<Duration>,
}

impl QuotaHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        let number = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        Self {
            remaining: number(HEADER_REMAINING).map(|v| v.min(u32::MAX as u64) as u32),
            limit: number(HEADER_LIMIT).map(|v| v.min(u32::MAX as u64) as u32),
            reset_at: number(HEADER_RESET)
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            retry_after: number(RETRY_AFTER.as_str()).map(Duration::from_secs),
        }
    }

    fn quota_exhausted(&self) -> bool {
        self.remaining == Some(0) || self.retry_after.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsListing {
    Many(Vec<RemoteEntry>),
    One(RemoteEntry),
}

#[derive(Debug, Deserialize)]
struct ContentsFile {
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

/// GitHubClient talks to the GitHub REST API through the shared rate limiter
pub struct GitHubClient {
    http: Client,
    api_url: Url,
    token: Option<String>,
    limiter: Arc<RateLimiter>,
    retry: Arc<dyn RetryStrategy>,
    max_quota_waits: u32,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, limiter: Arc<RateLimiter>) -> Result<Self, RepositoryError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                RepositoryError::InvalidResponse(format!("Failed to create HTTP client: {}", e))
            })?;

        let api_url = Url::parse(&config.api_url).map_err(|e| {
            RepositoryError::InvalidResponse(format!("Invalid API URL {}: {}", config.api_url, e))
        })?;
        if api_url.cannot_be_a_base() {
            return Err(RepositoryError::InvalidResponse(format!(
                "API URL cannot be used as a base: {}",
                config.api_url
            )));
        }

        Ok(Self {
            http,
            api_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            limiter,
            retry: Arc::new(ExponentialBackoff::with_config(
                500,
                30_000,
                0.1,
                config.max_retries,
            )),
            max_quota_waits: config.max_quota_waits,
        })
    }

    /// Replace the backoff policy for transient failures
    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RepositoryError> {
        let mut url = self.api_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RepositoryError::InvalidResponse(format!("Invalid API URL: {}", self.api_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                // Repository paths arrive slash-separated; each part is its own segment
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    /// GET with reserve/update around every round trip, retrying transient
    /// failures with backoff and waiting out an exhausted quota.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, RepositoryError> {
        let mut attempt = 0u32;
        let mut quota_waits = 0u32;

        loop {
            self.limiter.reserve().await;

            match self.send_once(&url, query).await {
                Attempt::Done(value) => {
                    telemetry::record_github_request("success");
                    return Ok(value);
                }
                Attempt::Quota { reset_at } => {
                    telemetry::record_github_request("quota");
                    quota_waits += 1;
                    if quota_waits > self.max_quota_waits {
                        return Err(RepositoryError::RateLimited { reset_at });
                    }
                    warn!(
                        url = %url,
                        reset_at = ?reset_at,
                        quota_waits = quota_waits,
                        "Repository host quota exhausted, waiting for reset"
                    );
                }
                Attempt::Failed(err) if err.is_transient() => {
                    telemetry::record_github_request("transient");
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                url = %url,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Transient repository host failure, retrying"
                            );
                            attempt += 1;
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(RepositoryError::RetriesExhausted {
                                attempts: attempt + 1,
                                last_error: err.to_string(),
                            });
                        }
                    }
                }
                Attempt::Failed(err) => {
                    telemetry::record_github_request("error");
                    return Err(err);
                }
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(&self, url: &Url, query: &[(&str, &str)]) -> Attempt<T> {
        let mut request = self
            .http
            .get(url.clone())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Failed(RepositoryError::Transient(format!(
                    "Request to {} failed: {}",
                    url, e
                )))
            }
        };

        let status = response.status();
        let quota = QuotaHeaders::from_headers(response.headers());
        self.apply_quota(&quota);

        debug!(url = %url, status = status.as_u16(), remaining = ?quota.remaining, "Repository host responded");

        if status.is_success() {
            return match response.json::<T>().await {
                Ok(value) => Attempt::Done(value),
                Err(e) => Attempt::Failed(RepositoryError::InvalidResponse(format!(
                    "Failed to decode response from {}: {}",
                    url, e
                ))),
            };
        }

        if (status == StatusCode::FORBIDDEN && quota.quota_exhausted())
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            if !quota.quota_exhausted() {
                // 429 without any hint: back off for a minute
                let ceiling = self.limiter.snapshot().ceiling;
                self.limiter
                    .update(0, ceiling, Some(retry_instant(Duration::from_secs(60))));
            }
            return Attempt::Quota {
                reset_at: self.quota_reset(&quota),
            };
        }

        let body = response.text().await.unwrap_or_default();
        Attempt::Failed(classify_status(status, url, &body))
    }

    /// Feed response headers into the limiter. A bare `retry-after` is
    /// recorded as an empty quota until that instant.
    fn apply_quota(&self, quota: &QuotaHeaders) {
        let retry_at = quota.retry_after.map(retry_instant);
        match (quota.remaining, quota.limit, retry_at) {
            (_, Some(limit), Some(at)) => self.limiter.update(0, limit, Some(at)),
            (Some(remaining), Some(limit), None) => {
                self.limiter.update(remaining, limit, quota.reset_at)
            }
            (_, None, Some(at)) => {
                let ceiling = self.limiter.snapshot().ceiling;
                self.limiter.update(0, ceiling, Some(at));
            }
            _ => {}
        }
    }

    fn quota_reset(&self, quota: &QuotaHeaders) -> Option<DateTime<Utc>> {
        quota
            .retry_after
            .map(retry_instant)
            .or(quota.reset_at)
            .or_else(|| self.limiter.snapshot().reset_at)
    }
}

fn retry_instant(after: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

fn classify_status(status: StatusCode, url: &Url, body: &str) -> RepositoryError {
    let detail = format!("{} returned {}", url.path(), status);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepositoryError::Unauthorized(detail),
        StatusCode::NOT_FOUND => RepositoryError::NotFound(url.path().to_string()),
        s if s.is_server_error() => RepositoryError::Transient(detail),
        _ => RepositoryError::InvalidResponse(format!("{}: {}", detail, truncate(body, 200))),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn decode_content(path: &str, encoding: Option<&str>, content: Option<&str>) -> Result<String, RepositoryError> {
    match encoding {
        Some("base64") => {}
        other => {
            return Err(RepositoryError::InvalidResponse(format!(
                "Content of {} not inlined (encoding {:?})",
                path, other
            )))
        }
    }
    let packed: String = content
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(packed.as_bytes())
        .map_err(|e| RepositoryError::InvalidResponse(format!("Invalid base64 in {}: {}", path, e)))?;
    String::from_utf8(bytes)
        .map_err(|_| RepositoryError::InvalidResponse(format!("Content of {} is not UTF-8 text", path)))
}

#[async_trait]
impl RepositoryClient for GitHubClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn list_directory(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, RepositoryError> {
        let url = self.endpoint(&["repos", repo.owner.as_str(), repo.name.as_str(), "contents", path])?;
        let listing: ContentsListing = self.get_json(url, &[("ref", branch)]).await?;
        Ok(match listing {
            ContentsListing::Many(entries) => entries,
            ContentsListing::One(entry) => vec![entry],
        })
    }

    #[instrument(skip(self), fields(repo = %repo))]
    async fn get_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
    ) -> Result<RemoteFile, RepositoryError> {
        let url = self.endpoint(&["repos", repo.owner.as_str(), repo.name.as_str(), "contents", path])?;
        let file: ContentsFile = self.get_json(url, &[("ref", branch)]).await?;
        if file.kind != EntryKind::File {
            return Err(RepositoryError::InvalidResponse(format!(
                "{} is not a file",
                file.path
            )));
        }
        let content = decode_content(&file.path, file.encoding.as_deref(), file.content.as_deref())?;
        Ok(RemoteFile {
            path: file.path,
            content,
            sha: file.sha,
        })
    }

    #[instrument(skip(self), fields(repo = %repo))]
    async fn get_repository(&self, repo: &RepoRef) -> Result<RepositoryInfo, RepositoryError> {
        let url = self.endpoint(&["repos", repo.owner.as_str(), repo.name.as_str()])?;
        self.get_json(url, &[]).await
    }

    #[instrument(skip(self), fields(repo = %repo))]
    async fn get_branch(&self, repo: &RepoRef, branch: &str) -> Result<BranchInfo, RepositoryError> {
        let url = self.endpoint(&["repos", repo.owner.as_str(), repo.name.as_str(), "branches", branch])?;
        let response: BranchResponse = self.get_json(url, &[]).await?;
        Ok(BranchInfo {
            name: response.name,
            head_sha: response.commit.sha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content_handles_wrapped_base64() {
        // GitHub wraps base64 at 60 columns
        let encoded = "V3JpdGUtT3V0cHV0\nICdoaSc=\n";
        let decoded = decode_content("a.ps1", Some("base64"), Some(encoded)).unwrap();
        assert_eq!(decoded, "Write-Output 'hi'");
    }

    #[test]
    fn test_decode_content_rejects_binary() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([0xff, 0xfe, 0x00]);
        let err = decode_content("blob.ps1", Some("base64"), Some(&encoded)).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidResponse(_)));
    }

    #[test]
    fn test_decode_content_requires_inline_encoding() {
        let err = decode_content("big.ps1", Some("none"), Some("")).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidResponse(_)));
    }

    #[test]
    fn test_classify_status() {
        let url = Url::parse("https://api.github.com/repos/a/b").unwrap();
        assert!(classify_status(StatusCode::BAD_GATEWAY, &url, "").is_transient());
        assert!(classify_status(StatusCode::NOT_FOUND, &url, "").is_not_found());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &url, ""),
            RepositoryError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, &url, "bad"),
            RepositoryError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_endpoint_encodes_path_segments() {
        let limiter = Arc::new(RateLimiter::new(0));
        let config = GitHubConfig {
            api_url: "https://ghe.example.com/api/v3/".to_string(),
            token: None,
            user_agent: "test".to_string(),
            request_timeout_seconds: 5,
            max_retries: 1,
            max_quota_waits: 1,
            rate_limit_safety_margin: 0,
        };
        let client = GitHubClient::new(&config, limiter).unwrap();
        let url = client
            .endpoint(&["repos", "acme", "scripts", "contents", "ops/Clean Up.ps1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/repos/acme/scripts/contents/ops/Clean%20Up.ps1"
        );
    }
}
