//! Error types for provider operations.

use crate::id::ObjectId;
use crate::status::ProviderStatus;
use std::io;
use thiserror::Error;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object does not exist (absent, deleted, or never committed).
    #[error("object not found: {id}")]
    NotFound {
        /// The id that was requested.
        id: String,
    },

    /// A reserved object already exists and cannot be created again.
    #[error("object already exists: {id}")]
    AlreadyExists {
        /// The id that was requested.
        id: String,
    },

    /// A CRUD operation was attempted before the provider reached `Initialized`.
    #[error("provider is not initialized (status: {status})")]
    NotInitialized {
        /// The status at the time of the call.
        status: ProviderStatus,
    },

    /// Connection or transfer failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A local I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The id is malformed or not allowed for this operation.
    #[error("invalid object id: {0}")]
    InvalidId(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The provider configuration is unusable.
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

impl ProviderError {
    /// Creates a not-found error for the given id.
    pub fn not_found(id: &ObjectId) -> Self {
        Self::NotFound {
            id: id.to_string(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    /// Returns true if the error came from the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport { .. } | ProviderError::Io(_))
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport { retryable, .. } => *retryable,
            ProviderError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
