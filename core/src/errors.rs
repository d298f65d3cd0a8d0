/// Error types shared by the delegate agent crates.
use thiserror::Error;

/// Errors raised by calls to the manager (control plane).
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Connection to manager failed: {0}")]
    ConnectionError(String),

    #[error("Manager returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Timeout waiting for manager")]
    Timeout,

    #[error("Invalid manager response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Delegate used an invalid token")]
    InvalidToken,

    #[error("Delegate used an expired token")]
    ExpiredToken,

    #[error("Delegate used a revoked token")]
    RevokedToken,

    #[error("Request rejected by manager: {0}")]
    Rejected(String),
}

impl ManagerError {
    /// Maps a response body to one of the token errors, if it carries one.
    pub fn from_body(status: u16, body: &str) -> Self {
        if body.contains("INVALID_TOKEN") {
            ManagerError::InvalidToken
        } else if body.contains("EXPIRED_TOKEN") {
            ManagerError::ExpiredToken
        } else if body.contains("REVOKED_TOKEN") {
            ManagerError::RevokedToken
        } else {
            ManagerError::Status {
                status,
                body: body.to_string(),
            }
        }
    }

    /// Network-level failures and timeouts are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ManagerError::ConnectionError(_) | ManagerError::Timeout
        ) || matches!(self, ManagerError::Status { status, .. } if *status >= 500)
    }
}

/// Result type for manager calls.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors from the message/status side channel.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Corrupt record {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while building or running a task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unsupported task type: {0}")]
    UnsupportedType(String),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("Task execution failed: {0}")]
    ExecutionError(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;
