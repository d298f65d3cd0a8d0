/// Error types for the delegate agent
use delegate_core::{ManagerError, StoreError, TaskError};
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Token signing error
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Manager call failed
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Status store failure
    #[error("Status store error: {0}")]
    Store(#[from] StoreError),

    /// Task construction or execution failure
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Registration gave up
    #[error("Registration failed: {0}")]
    RegistrationError(String),

    /// TLS failure on the stream connection
    #[error("Secure channel error: {0}")]
    SecureChannelError(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Time-limited call expired
    #[error("Operation timed out")]
    Timeout,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// Timeouts and network failures; retried or logged, never escalated.
    pub fn is_transient(&self) -> bool {
        match self {
            DaemonError::Timeout | DaemonError::ConnectionError(_) => true,
            DaemonError::Manager(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The manager error carried by this error, if any.
    pub fn as_manager_error(&self) -> Option<&ManagerError> {
        match self {
            DaemonError::Manager(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::error::Error> for DaemonError {
    fn from(e: serde_json::error::Error) -> Self {
        DaemonError::SerializationError(e.to_string())
    }
}

impl From<String> for DaemonError {
    fn from(e: String) -> Self {
        DaemonError::Other(e)
    }
}

impl From<&str> for DaemonError {
    fn from(e: &str) -> Self {
        DaemonError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(DaemonError::Timeout.is_transient());
        assert!(DaemonError::ConnectionError("refused".into()).is_transient());
        assert!(DaemonError::from(ManagerError::Timeout).is_transient());
        assert!(!DaemonError::from(ManagerError::InvalidToken).is_transient());
        assert!(!DaemonError::ConfigError("bad".into()).is_transient());
    }

    #[test]
    fn test_manager_error_is_exposed() {
        let err = DaemonError::from(ManagerError::ExpiredToken);
        assert!(matches!(err.as_manager_error(), Some(ManagerError::ExpiredToken)));
        assert!(DaemonError::Timeout.as_manager_error().is_none());
    }
}
