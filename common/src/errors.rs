// Error handling framework

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the remote repository host client
#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    #[error("Transient repository host failure: {0}")]
    Transient(String),

    #[error("Repository host rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Not found on repository host: {0}")]
    NotFound(String),

    #[error("Repository host rate limit exhausted until {reset_at:?}")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("Invalid response from repository host: {0}")]
    InvalidResponse(String),

    #[error("Giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl RepositoryError {
    /// Whether the request may succeed if simply repeated after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

/// Repository synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already running for binding {0}")]
    AlreadyRunning(Uuid),

    #[error("Repository binding not found: {0}")]
    BindingNotFound(String),

    #[error("Repository binding {0} is not active")]
    BindingInactive(String),

    #[error("Repository host error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Script execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Script not found: {0}")]
    ScriptNotFound(Uuid),

    #[error("Script {0} is inactive")]
    ScriptInactive(Uuid),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("Script runtime failure: {0}")]
    Runtime(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration and input validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),
}

/// Persistence collaborator errors, as seen by the engines
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Duplicate webhook delivery: {0}")]
    DuplicateDelivery(String),
}

/// Real-time push channel errors
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Failed to serialize progress event: {0}")]
    Serialization(String),

    #[error("Failed to publish progress event: {0}")]
    PublishFailed(String),
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::from(DatabaseError::from(err))
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => StorageError::NotFound(msg),
            DatabaseError::DuplicateKey(msg) => StorageError::Conflict(msg),
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}


impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Transient("reset by peer".to_string()).is_transient());
        assert!(!RepositoryError::NotFound("a.ps1".to_string()).is_transient());
        assert!(!RepositoryError::Unauthorized("bad token".to_string()).is_transient());
        assert!(!RepositoryError::RateLimited { reset_at: None }.is_transient());
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout(300);
        assert!(err.to_string().contains("300 seconds"));
    }

    #[test]
    fn test_sync_conflict_message_names_binding() {
        let id = Uuid::new_v4();
        let err = SyncError::AlreadyRunning(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_duplicate_key_maps_to_conflict() {
        let err: StorageError = DatabaseError::DuplicateKey("scripts_name_key".to_string()).into();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_every_database_error_has_a_storage_mapping() {
        let err: StorageError = DatabaseError::NotFound("binding".to_string()).into();
        assert!(matches!(err, StorageError::NotFound(_)));
        let err: StorageError = DatabaseError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, StorageError::DatabaseError(msg) if msg.contains("refused")));
    }
}
