// Execution progress events for the real-time push channel

use crate::errors::ProgressError;
use crate::executor::OutputStream;
use crate::models::ExecutionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

/// Event published while an execution is in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionStatusChanged {
        execution_id: Uuid,
        status: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },
    ExecutionOutput {
        execution_id: Uuid,
        stream: OutputStream,
        line: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn status(execution_id: Uuid, status: ExecutionStatus) -> Self {
        ProgressEvent::ExecutionStatusChanged {
            execution_id,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn output(execution_id: Uuid, stream: OutputStream, line: String) -> Self {
        ProgressEvent::ExecutionOutput {
            execution_id,
            stream,
            line,
            timestamp: Utc::now(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            ProgressEvent::ExecutionStatusChanged { execution_id, .. }
            | ProgressEvent::ExecutionOutput { execution_id, .. } => *execution_id,
        }
    }

    /// Subject the event is published on
    pub fn subject(&self) -> String {
        format!("status.execution.{}", self.execution_id())
    }
}

/// ProgressSink receives progress events. Callers treat failures as
/// non-fatal and only log them.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError>;
}

/// Publishes events as JSON over core NATS
pub struct NatsProgressSink {
    client: async_nats::Client,
}

impl NatsProgressSink {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, ProgressError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| ProgressError::PublishFailed(format!("Failed to connect to NATS: {}", e)))?;
        tracing::info!("Connected to NATS for progress events");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ProgressSink for NatsProgressSink {
    async fn publish(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| ProgressError::Serialization(e.to_string()))?;
        self.client
            .publish(event.subject(), payload.into())
            .await
            .map_err(|e| ProgressError::PublishFailed(e.to_string()))
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn publish(&self, _event: &ProgressEvent) -> Result<(), ProgressError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_uses_execution_id() {
        let id = Uuid::new_v4();
        let event = ProgressEvent::status(id, ExecutionStatus::Running);
        assert_eq!(event.subject(), format!("status.execution.{}", id));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = ProgressEvent::output(Uuid::nil(), OutputStream::Stderr, "boom".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_output");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["line"], "boom");
    }

    #[tokio::test]
    async fn test_noop_sink_accepts_everything() {
        let sink = NoopProgressSink;
        let event = ProgressEvent::status(Uuid::new_v4(), ExecutionStatus::Completed);
        assert!(sink.publish(&event).await.is_ok());
    }
}
