//! Error types for the ingestion and replay paths.
//!
//! Every error in this crate degrades a single operation only: a broken
//! connection, an unreadable capture or a rejected publish. Per-frame decode
//! problems are not errors at all; they are reported as
//! [`DecodeFailure`](crate::decoder::DecodeFailure) values and never cross
//! into this type.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: the broker refused or dropped a connection
//! - **Publish Errors**: a single frame could not be handed to the broker
//! - **Archive Errors**: a capture file is missing, unreadable or malformed
//! - **Configuration Errors**: an address, port or topic failed validation
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use v2v_telemetry::V2vError;
//!
//! let error = V2vError::connection_failed("broker refused connection");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline, connection and replay operations.
pub type Result<T, E = V2vError> = std::result::Result<T, E>;

/// Main error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum V2vError {
    #[error("Failed to connect to broker: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to publish on topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Capture archive error: {path}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed capture archive {path}: {details}")]
    ArchiveFormat { path: PathBuf, details: String },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Channel closed: {context}")]
    ChannelClosed { context: String },
}

impl V2vError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            V2vError::Connection { .. } => true,
            V2vError::Publish { .. } => true,
            V2vError::Timeout { .. } => true,
            V2vError::Archive { .. } => false,
            V2vError::ArchiveFormat { .. } => false,
            V2vError::Config { .. } => false,
            V2vError::ChannelClosed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            V2vError::Connection { .. } => vec![
                "Check the broker address and port",
                "Ensure the broker is running and reachable",
                "Reconfigure the connection once the broker is back",
            ],
            V2vError::Publish { .. } => vec![
                "Check the connection to the broker",
                "Verify the topic accepts publishes",
            ],
            V2vError::Archive { .. } => vec![
                "Check the capture file exists and is readable",
                "Check file permissions",
            ],
            V2vError::ArchiveFormat { .. } => vec![
                "Verify the file is a pcap or pcapng capture",
                "Re-export the capture if it was truncated",
            ],
            V2vError::Config { .. } => vec![
                "Provide a non-empty broker address and topic",
                "Use a numeric port between 1 and 65535",
            ],
            V2vError::Timeout { .. } => {
                vec!["Increase timeout duration", "Verify the broker is responding"]
            }
            V2vError::ChannelClosed { .. } => vec!["Restart the ingestion or replay task"],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        V2vError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        V2vError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for publish errors.
    pub fn publish_failed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        V2vError::Publish { topic: topic.into(), reason: reason.into() }
    }

    /// Helper constructor for archive I/O errors with path context.
    pub fn archive_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        V2vError::Archive { path: path.into(), source }
    }

    /// Helper constructor for malformed archives.
    pub fn archive_format(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        V2vError::ArchiveFormat { path: path.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        V2vError::Config { details: details.into() }
    }
}
