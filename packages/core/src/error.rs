//! Error taxonomy shared by the runtime and every transport.

use std::path::PathBuf;

/// Failures looking up values in the context tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("no value of type `{type_name}` found in the context or any of its ancestors")]
    NotFound { type_name: &'static str },
}

/// Fatal configuration problems. Raised at startup and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "unable to determine the storage directory for the learning transport: no `{marker}` \
         was found between {} and the filesystem root. Create a `{directory}` directory \
         in one of the parent directories, or set the storage directory explicitly.",
        start.display()
    )]
    StorageDirectoryNotFound {
        start: PathBuf,
        marker: &'static str,
        directory: &'static str,
    },
    #[error("invalid {what} `{value}`: {reason}")]
    InvalidPath {
        what: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Errors surfaced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The destination queue does not exist (yet). Transient during startup.
    #[error("queue `{queue}` not found")]
    QueueNotFound { queue: String },
    #[error("message of {size} bytes exceeds the maximum payload size of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("delivery constraint `{constraint}` is not supported by this transport")]
    UnsupportedConstraint { constraint: &'static str },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// Wraps an I/O error with the path it occurred on.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for "destination not yet provisioned" failures.
    #[must_use]
    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }
}
