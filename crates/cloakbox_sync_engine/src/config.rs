//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;

/// Name of the state directory inside the synchronized root.
pub const STATE_DIR_NAME: &str = ".cloakbox";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the local tree to synchronize.
    pub root: PathBuf,
    /// Initialization attempts per provider and pass.
    pub retry_attempts: u32,
    /// Whether downloaded content is checked against the remote fingerprint.
    pub verify_downloads: bool,
}

impl SyncConfig {
    /// Creates a configuration for the tree at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry_attempts: 3,
            verify_downloads: true,
        }
    }

    /// Sets the number of initialization attempts per provider.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Enables or disables download verification.
    pub fn with_verify_downloads(mut self, verify: bool) -> Self {
        self.verify_downloads = verify;
        self
    }

    /// Returns the state directory path.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    /// Checks the configuration for obvious mistakes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the root is not a directory.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.root.is_dir() {
            return Err(SyncError::config(format!(
                "sync root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("/home/alice/Documents")
            .with_retry_attempts(5)
            .with_verify_downloads(false);

        assert_eq!(config.root, PathBuf::from("/home/alice/Documents"));
        assert_eq!(config.retry_attempts, 5);
        assert!(!config.verify_downloads);
        assert_eq!(
            config.state_dir(),
            PathBuf::from("/home/alice/Documents/.cloakbox")
        );
    }

    #[test]
    fn missing_root_is_rejected() {
        let config = SyncConfig::new("/definitely/not/here");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}
