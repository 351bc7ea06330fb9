//! Error types for the keel persistence core.
//!
//! Every repository, query builder and queue operation returns [`Result`]. Errors are
//! surfaced to the immediate caller; only the job reservation transaction performs local
//! recovery (rollback) before re-raising.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeelError {
    /// Structurally invalid filter expression
    #[error("Malformed filter: {0}")]
    MalformedFilter(String),

    /// A single-result query matched more than one row
    #[error("Non-unique result: filter on {entity} matched {count} rows, expected at most one")]
    NonUniqueResult { entity: String, count: usize },

    /// Operation the target dialect cannot express (e.g. OFFSET on UPDATE/DELETE)
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Insert/update/delete or the required re-read failed
    #[error("Persist failed for {entity}: {reason}")]
    PersistFailed { entity: String, reason: String },

    /// An error inside a transactional operation; the transaction was rolled back
    #[error("Transaction failure during {operation}: {source}")]
    TransactionFailure {
        operation: String,
        source: Box<KeelError>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl KeelError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        KeelError::MalformedFilter(reason.into())
    }

    pub fn persist_failed(entity: &str, reason: impl std::fmt::Display) -> Self {
        KeelError::PersistFailed {
            entity: entity.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn transaction_failure(operation: &str, source: KeelError) -> Self {
        KeelError::TransactionFailure {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<sqlx::Error> for KeelError {
    fn from(err: sqlx::Error) -> Self {
        KeelError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(error: serde_json::Error) -> Self {
        KeelError::InvalidInput(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for KeelError {
    fn from(error: config::ConfigError) -> Self {
        KeelError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
