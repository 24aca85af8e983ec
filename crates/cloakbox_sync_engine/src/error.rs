//! Error types for the sync engine.

use cloakbox_provider::ProviderError;
use cloakbox_store::StoreError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Conflicts are not errors: they are resolved during the pass and
/// reported in [`crate::PassReport::conflicts`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// A provider operation failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Encryption, decryption or decoding failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local file system error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The local state file is unreadable or inconsistent.
    #[error("sync state corrupted: {0}")]
    StateCorrupted(String),

    /// Another process is synchronizing the same tree.
    #[error("sync state locked by another process: {}", .0.display())]
    Locked(PathBuf),

    /// A reconciliation pass is already running on this engine.
    #[error("a reconciliation pass is already in progress")]
    PassInProgress,

    /// The pass was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No provider is configured.
    #[error("no providers configured")]
    NoProviders,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a state corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::StateCorrupted(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if a later pass may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Provider(e) => e.is_retryable(),
            SyncError::Store(StoreError::Provider(e)) => e.is_retryable(),
            SyncError::PassInProgress => true,
            _ => false,
        }
    }

    /// Returns true if the error means the data could not be decrypted.
    pub fn is_crypto(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_crypto())
    }
}
