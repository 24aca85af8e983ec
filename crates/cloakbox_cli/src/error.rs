//! CLI error type.

use cloakbox_store::StoreError;
use cloakbox_sync_engine::SyncError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by `cloakbox` commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The configuration file is missing or invalid.
    #[error("config {path}: {message}")]
    Config {
        /// Path of the configuration file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// `init` would overwrite an existing configuration.
    #[error("{0} already exists (use --force to overwrite)")]
    AlreadyExists(PathBuf),

    /// No passphrase was supplied.
    #[error("passphrase: {0}")]
    Passphrase(String),

    /// Key derivation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine refused or failed an operation.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Rendering output failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Creates a configuration error.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
