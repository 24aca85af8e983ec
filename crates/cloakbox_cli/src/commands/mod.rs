//! CLI command implementations.

pub mod conflicts;
pub mod init;
pub mod ls;
pub mod status;
pub mod sync;

use crate::config::LoadedConfig;
use crate::error::{CliError, CliResult};
use clap::ValueEnum;
use cloakbox_store::{ContentKey, MasterKey};
use cloakbox_sync_engine::Engine;
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

/// Environment variable holding the passphrase.
pub const PASSPHRASE_ENV: &str = "CLOAKBOX_PASSPHRASE";

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Reads the passphrase from `file`, or from [`PASSPHRASE_ENV`].
///
/// A single trailing newline is stripped from file contents.
pub fn read_passphrase(file: Option<&Path>) -> CliResult<Zeroizing<String>> {
    let secret = match file {
        Some(path) => {
            let mut text = Zeroizing::new(std::fs::read_to_string(path)?);
            if text.ends_with('\n') {
                text.pop();
                if text.ends_with('\r') {
                    text.pop();
                }
            }
            text
        }
        None => match std::env::var(PASSPHRASE_ENV) {
            Ok(value) => Zeroizing::new(value),
            Err(_) => {
                return Err(CliError::Passphrase(format!(
                    "set {PASSPHRASE_ENV} or pass --passphrase-file"
                )))
            }
        },
    };
    if secret.is_empty() {
        return Err(CliError::Passphrase("passphrase is empty".into()));
    }
    Ok(secret)
}

/// Stretches the passphrase into the content key.
///
/// The passphrase buffer is wiped when it drops at the end of this call.
pub fn derive_key(loaded: &LoadedConfig, passphrase: Zeroizing<String>) -> CliResult<ContentKey> {
    debug!(kdf = ?loaded.config.kdf, "deriving content key");
    let master = MasterKey::derive(passphrase.as_bytes(), &loaded.config.salt, &loaded.config.kdf)?;
    Ok(ContentKey::from_master(&master)?)
}

/// Loads the configuration, derives the key and opens the engine.
pub fn open_engine(config_path: &Path, passphrase_file: Option<&Path>) -> CliResult<Engine> {
    let loaded = LoadedConfig::load(config_path)?;
    let key = derive_key(&loaded, read_passphrase(passphrase_file)?)?;
    Ok(Engine::open(loaded.sync_config(), loaded.providers(), &key)?)
}
