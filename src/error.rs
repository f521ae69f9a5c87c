//! Error types for the WIS2 node.
//!
//! All errors are strongly typed using thiserror. Failures local to one
//! incoming file event never escalate beyond that event; only configuration
//! errors raised while the process starts are meant to be fatal.

use thiserror::Error;

/// Configuration errors raised while loading settings or the dataset catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required setting '{name}' is not set")]
    MissingSetting {
        name: String,
    },

    #[error("Setting '{name}' has invalid value '{value}': {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Dataset definition is missing required field '{field}'")]
    MissingDatasetField {
        field: String,
    },

    #[error("Failed to read catalog document {path}: {message}")]
    CatalogUnreadable {
        path: String,
        message: String,
    },

    #[error("Catalog document is malformed: {message}")]
    CatalogMalformed {
        message: String,
    },

    #[error("Dataset id '{id}' is reserved for the process totals")]
    ReservedDatasetId {
        id: String,
    },

    #[error("Metrics are not recorded by this pipeline")]
    MetricsDisabled,
}

/// Errors that abort building one notification message.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Datetime pattern '{pattern}' is invalid: {reason}")]
    MalformedTimestampPattern {
        pattern: String,
        reason: String,
    },

    #[error("Captured datetime {groups:?} is not a valid calendar value")]
    InvalidTimestamp {
        groups: Vec<u32>,
    },

    #[error("Failed to serialize notification: {message}")]
    Serialization {
        message: String,
    },
}

/// Errors talking to the broker, the duplicate cache or the metrics store.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Broker rejected publish on '{topic}': {reason}")]
    Rejected {
        topic: String,
        reason: String,
    },

    #[error("Publish timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Publish queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Publish worker disconnected")]
    Disconnected,

    #[error("Store error: {message}")]
    Store {
        message: String,
    },
}

/// A regex filter in a dataset definition failed to compile.
///
/// This degrades the owning definition (it never matches) instead of
/// failing the dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dataset '{metadata_id}' has malformed filter '{pattern}': {reason}")]
pub struct FilterError {
    pub metadata_id: String,
    pub pattern: String,
    pub reason: String,
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl NodeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a build error.
    #[must_use]
    pub const fn is_build(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if redelivering the original event may succeed.
    ///
    /// The core never retries; this only informs the host pipeline.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !matches!(e, TransportError::Rejected { .. }),
            Self::Configuration(_) | Self::Build(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
