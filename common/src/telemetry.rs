// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::{ExecutionStatus, SyncKind, SyncOutcome};

/// Initialize structured logging with JSON formatting
///
/// `RUST_LOG` takes precedence over the configured level.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize Prometheus metrics exporter and describe every metric
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("sync_runs_total", "Repository sync runs by kind and outcome");
    describe_histogram!("sync_duration_seconds", "Duration of repository sync runs");
    describe_counter!(
        "sync_file_changes_total",
        "Catalog file changes applied by sync, by change type"
    );
    describe_counter!(
        "script_executions_total",
        "Script executions reaching a terminal state"
    );
    describe_histogram!(
        "script_execution_duration_seconds",
        "Wall-clock duration of script executions"
    );
    describe_gauge!(
        "script_executions_running",
        "Script executions currently holding an admission slot"
    );
    describe_gauge!(
        "github_rate_limit_remaining",
        "Remaining API quota as last reported by the repository host"
    );
    describe_counter!("github_requests_total", "Requests to the repository host by outcome");
    describe_counter!("webhook_events_total", "Webhook deliveries by event type and outcome");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_sync(kind: SyncKind, outcome: SyncOutcome, duration_seconds: f64) {
    counter!(
        "sync_runs_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("sync_duration_seconds", "kind" => kind.to_string()).record(duration_seconds);
}

#[inline]
pub fn record_sync_changes(added: u64, updated: u64, removed: u64) {
    counter!("sync_file_changes_total", "change" => "added").increment(added);
    counter!("sync_file_changes_total", "change" => "updated").increment(updated);
    counter!("sync_file_changes_total", "change" => "removed").increment(removed);
}

#[inline]
pub fn record_execution(status: ExecutionStatus, duration_seconds: f64) {
    counter!("script_executions_total", "status" => status.to_string()).increment(1);
    histogram!("script_execution_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn update_running_executions(running: usize) {
    gauge!("script_executions_running").set(running as f64);
}

#[inline]
pub fn update_rate_limit_remaining(remaining: u32) {
    gauge!("github_rate_limit_remaining").set(remaining as f64);
}

#[inline]
pub fn record_github_request(outcome: &'static str) {
    counter!("github_requests_total", "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_webhook_event(event_type: &str, outcome: &'static str) {
    counter!(
        "webhook_events_total",
        "event" => event_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_valid_level() {
        // Either succeeds or another test already installed a subscriber
        let result = init_logging("info");
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_sync(SyncKind::Full, SyncOutcome::Success, 0.25);
        record_sync_changes(1, 2, 3);
        record_execution(ExecutionStatus::Failed, 1.5);
        update_running_executions(2);
        update_rate_limit_remaining(4999);
        record_github_request("success");
        record_webhook_event("push", "dispatched");
    }
}
