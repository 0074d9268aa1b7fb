//! Error types for the replication pipeline
//!
//! One enum for the whole crate, with classification for retry decisions.
//! Discardable parse issues never surface here: the envelope parser returns
//! `None` for those and the batch controller never sees them.

use thiserror::Error;

/// Pipeline-specific errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Target database driver error
    #[cfg(feature = "postgres")]
    #[error("target driver error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Target write/transaction error
    #[error("target error: {0}")]
    Target(String),

    /// Event source error
    #[error("source error: {0}")]
    Source(String),

    /// Checkpoint persistence error
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Schema history persistence error
    #[error("schema history error: {0}")]
    SchemaHistory(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection refused
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Create a new target error
    pub fn target(msg: impl Into<String>) -> Self {
        Self::Target(msg.into())
    }

    /// Create a new source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a new checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a new schema history error
    pub fn schema_history(msg: impl Into<String>) -> Self {
        Self::SchemaHistory(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a connection refused error
    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry. The batch
    /// controller retries these with backoff; exhaustion becomes the fatal
    /// connectivity case.
    pub fn is_retriable(&self) -> bool {
        match self {
            // Always retriable
            Self::ConnectionClosed => true,
            Self::ConnectionRefused(_) => true,
            Self::Timeout(_) => true,

            // Target errors may be retriable
            Self::Target(msg) => {
                msg.contains("temporarily")
                    || msg.contains("connection reset")
                    || msg.contains("connection lost")
                    || msg.contains("deadlock")
            }

            // PostgreSQL-wire transient errors
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            // I/O errors may be retriable
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            // Non-retriable
            Self::Source(_)
            | Self::Checkpoint(_)
            | Self::SchemaHistory(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }
}

/// Check if a PostgreSQL-wire error is transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::target("insert rejected");
        assert!(err.to_string().contains("target error"));
        assert!(err.to_string().contains("insert rejected"));
    }

    #[test]
    fn test_error_constructors() {
        let _ = PipelineError::source("stream closed");
        let _ = PipelineError::checkpoint("write failed");
        let _ = PipelineError::config("missing option");
        let _ = PipelineError::timeout("5 seconds");
        let _ = PipelineError::other("unknown");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(PipelineError::ConnectionClosed.is_retriable());
        assert!(PipelineError::connection_refused("host:5432").is_retriable());
        assert!(PipelineError::timeout("5s").is_retriable());
        assert!(PipelineError::target("connection lost mid-write").is_retriable());

        assert!(!PipelineError::config("bad config").is_retriable());
        assert!(!PipelineError::checkpoint("disk full").is_retriable());
        assert!(!PipelineError::target("constraint violation").is_retriable());
        assert!(!PipelineError::other("unknown").is_retriable());
    }

    #[test]
    fn test_io_error_retriability() {
        let reset = PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(reset.is_retriable());

        let not_found = PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert!(!not_found.is_retriable());
    }
}
