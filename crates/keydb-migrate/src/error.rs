//! Error types for the migration library.

use std::time::Duration;
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store could not be reached or failed its health check
    #[error("Cannot reach {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Command-level error returned by a store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Keyspace scan misbehaved (cursor never terminates, malformed cursor)
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// A single store call exceeded the per-operation timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Transfer failed for a specific key
    #[error("Transfer failed for key {key}: {message}")]
    Transfer { key: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, run timeout, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// Run finished but strict mode treats failed or skipped keys as fatal
    #[error("Strict mode: {failed} failed, {skipped} skipped, {mismatched} not matching")]
    StrictModeFailure {
        failed: u64,
        skipped: u64,
        mismatched: u64,
    },
}

pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CONNECTION_ERROR: u8 = 2;
pub const EXIT_ENUMERATION_ERROR: u8 = 3;
pub const EXIT_STRICT_FAILURE: u8 = 4;
pub const EXIT_CANCELLED: u8 = 5;
pub const EXIT_OTHER_ERROR: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Connection error
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(key: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Timeouts, pool exhaustion and network-class store errors are transient.
    /// Protocol and type errors (WRONGTYPE, parse failures) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Timeout { .. } | MigrateError::Pool { .. } => true,
            MigrateError::Connection { .. } => true,
            MigrateError::Store(e) => {
                e.is_timeout()
                    || e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain
                            | redis::ErrorKind::BusyLoadingError
                            | redis::ErrorKind::MasterDown
                            | redis::ErrorKind::ClusterDown
                    )
            }
            MigrateError::Io(_) => true,
            // Rejected writes and PEXPIRE on a missing key fail the same way again
            _ => false,
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection { .. } | MigrateError::Pool { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::Enumeration(_) => EXIT_ENUMERATION_ERROR,
            MigrateError::StrictModeFailure { .. } => EXIT_STRICT_FAILURE,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_OTHER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = MigrateError::Timeout {
            operation: "TYPE".into(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_wrongtype_is_not_transient() {
        let err: MigrateError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE")).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transfer_rejection_is_not_transient() {
        let err = MigrateError::transfer("h1", "empty hash");
        assert!(!err.is_transient());
        assert_eq!(err.exit_code(), EXIT_OTHER_ERROR);
    }

    #[test]
    fn test_enumeration_is_fatal() {
        let err = MigrateError::Enumeration("cursor stuck".into());
        assert!(!err.is_transient());
        assert_eq!(err.exit_code(), EXIT_ENUMERATION_ERROR);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            MigrateError::connection("localhost:6379", "refused").exit_code(),
            EXIT_CONNECTION_ERROR
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(
            MigrateError::StrictModeFailure {
                failed: 1,
                skipped: 0,
                mismatched: 0
            }
            .exit_code(),
            EXIT_STRICT_FAILURE
        );
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::transfer("user:1", "HSET failed");
        let detailed = err.format_detailed();
        assert!(detailed.contains("user:1"));
        assert!(detailed.contains("HSET failed"));
    }
}
