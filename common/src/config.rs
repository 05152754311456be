// Configuration management with layered configuration (file, env)

use crate::errors::ValidationError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub github: GitHubConfig,
    pub sync: SyncConfig,
    pub execution: ExecutionConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    /// Apply the bundled schema migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

/// Remote repository host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    /// Attempts for transient failures before giving up
    pub max_retries: u32,
    /// How many times a call may wait out an exhausted quota
    #[serde(default = "default_max_quota_waits")]
    pub max_quota_waits: u32,
    /// Calls are held back once remaining quota drops to this value
    pub rate_limit_safety_margin: u32,
}

fn default_max_quota_waits() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub poll_interval_seconds: u64,
    pub script_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Admission ceiling: executions allowed to run simultaneously
    pub concurrency: u32,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub constrained_mode_default: bool,
    /// Reported with each execution, not enforced
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    pub runtime_executable: String,
    /// Version the validator compares minimum-version requirements against
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default)]
    pub block_high_risk: bool,
    #[serde(default)]
    pub host_name: Option<String>,
    pub worker_poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub secret: String,
    #[serde(default = "default_delivery_cache_size")]
    pub delivery_cache_size: usize,
}

fn default_delivery_cache_size() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatsConfig {
    /// Progress events are only published when a URL is configured
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("sync.script_extensions")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_positive("server.port", self.server.port as u64)?;

        require_present("database.url", &self.database.url)?;
        require_positive("database.max_connections", self.database.max_connections as u64)?;

        require_present("github.api_url", &self.github.api_url)?;
        require_positive("github.max_retries", self.github.max_retries as u64)?;

        require_positive("sync.poll_interval_seconds", self.sync.poll_interval_seconds)?;
        if self.sync.script_extensions.is_empty() {
            return Err(ValidationError::MissingField("sync.script_extensions".to_string()));
        }

        require_positive("execution.concurrency", self.execution.concurrency as u64)?;
        require_positive(
            "execution.default_timeout_seconds",
            self.execution.default_timeout_seconds,
        )?;
        if self.execution.default_timeout_seconds > self.execution.max_timeout_seconds {
            return Err(ValidationError::InvalidFieldValue {
                field: "execution.default_timeout_seconds".to_string(),
                reason: format!(
                    "cannot exceed max_timeout_seconds ({})",
                    self.execution.max_timeout_seconds
                ),
            });
        }
        require_present("execution.runtime_executable", &self.execution.runtime_executable)?;

        require_present("webhook.secret", &self.webhook.secret)?;

        Ok(())
    }
}

fn require_present(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidFieldValue {
            field: field.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/script_catalog".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                run_migrations: false,
            },
            github: GitHubConfig {
                api_url: "https://api.github.com".to_string(),
                token: None,
                user_agent: "script-orchestrator".to_string(),
                request_timeout_seconds: 30,
                max_retries: 4,
                max_quota_waits: default_max_quota_waits(),
                rate_limit_safety_margin: 50,
            },
            sync: SyncConfig {
                poll_interval_seconds: 300,
                script_extensions: vec!["ps1".to_string(), "psm1".to_string(), "psd1".to_string()],
                max_file_size_bytes: 1024 * 1024,
            },
            execution: ExecutionConfig {
                concurrency: 4,
                default_timeout_seconds: 300,
                max_timeout_seconds: 3600,
                constrained_mode_default: false,
                memory_limit_mb: Some(512),
                runtime_executable: "pwsh".to_string(),
                runtime_version: None,
                block_high_risk: false,
                host_name: None,
                worker_poll_interval_seconds: 5,
            },
            webhook: WebhookConfig {
                secret: "change-me-in-production".to_string(),
                delivery_cache_size: default_delivery_cache_size(),
            },
            nats: NatsConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
            },
        }
    }
}
