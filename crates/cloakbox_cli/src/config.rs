//! TOML configuration file.
//!
//! ```toml
//! root = "/home/me/Documents"
//! salt = "00112233445566778899aabbccddeeff"
//! retry_attempts = 3
//!
//! [kdf]
//! memory_kib = 65536
//! iterations = 3
//! parallelism = 4
//!
//! [[providers]]
//! kind = "local"
//! name = "usb"
//! path = "/media/usb/cloakbox"
//!
//! [[providers]]
//! kind = "ftp"
//! name = "nas"
//! host = "nas.local"
//! username = "me"
//! password = "secret"
//! folder = "cloakbox"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::error::{CliError, CliResult};
use cloakbox_provider::{FtpConfig, FtpProvider, LocalProvider, Password, Provider, DEFAULT_PORT};
use cloakbox_store::{KdfParams, Salt};
use cloakbox_sync_engine::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cloakbox.toml";

fn default_retry_attempts() -> u32 {
    3
}

fn default_verify_downloads() -> bool {
    true
}

/// Parsed configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Local tree to synchronize.
    pub root: PathBuf,
    /// Argon2id salt shared by every client of the same remotes.
    pub salt: Salt,
    /// Argon2id cost parameters.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Initialization attempts per provider and pass.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Check downloaded content against the remote fingerprint.
    #[serde(default = "default_verify_downloads")]
    pub verify_downloads: bool,
    /// Configured remotes.
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

/// One `[[providers]]` entry.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProviderSpec {
    /// A directory on a local or mounted filesystem.
    Local {
        /// Provider name.
        name: String,
        /// Directory holding the objects.
        path: PathBuf,
    },
    /// An FTP account.
    Ftp {
        /// Provider name.
        name: String,
        /// Server host.
        host: String,
        /// Control port.
        #[serde(default)]
        port: Option<u16>,
        /// Account user name.
        username: String,
        /// Account password.
        password: Password,
        /// Folder scoping the objects.
        #[serde(default)]
        folder: Option<String>,
        /// Connect timeout in seconds.
        #[serde(default)]
        connect_timeout_secs: Option<u64>,
    },
}

impl ProviderSpec {
    /// Returns the provider name.
    pub fn name(&self) -> &str {
        match self {
            ProviderSpec::Local { name, .. } | ProviderSpec::Ftp { name, .. } => name,
        }
    }

    fn build(&self, base: &Path) -> Arc<dyn Provider> {
        match self {
            ProviderSpec::Local { name, path } => {
                Arc::new(LocalProvider::new(name.clone(), resolve(base, path)))
            }
            ProviderSpec::Ftp {
                name,
                host,
                port,
                username,
                password,
                folder,
                connect_timeout_secs,
            } => {
                let mut config = FtpConfig::new(host.clone(), username.clone(), password.clone())
                    .with_port(port.unwrap_or(DEFAULT_PORT));
                if let Some(folder) = folder {
                    config = config.with_folder(folder.clone());
                }
                if let Some(secs) = connect_timeout_secs {
                    config = config.with_connect_timeout(Duration::from_secs(*secs));
                }
                Arc::new(FtpProvider::new(name.clone(), config))
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// A loaded configuration together with the directory it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Parsed contents.
    pub config: CliConfig,
    base: PathBuf,
}

impl LoadedConfig {
    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Config`] if the file cannot be read or parsed,
    /// or if two providers share a name.
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CliError::config(path, format!("cannot read: {e}")))?;
        let config = parse(&text).map_err(|message| CliError::config(path, message))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(Self { config, base })
    }

    /// Returns the sync root, resolved against the file's directory.
    pub fn root(&self) -> PathBuf {
        resolve(&self.base, &self.config.root)
    }

    /// Builds the engine configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::new(self.root())
            .with_retry_attempts(self.config.retry_attempts)
            .with_verify_downloads(self.config.verify_downloads)
    }

    /// Instantiates every configured provider.
    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.config
            .providers
            .iter()
            .map(|spec| spec.build(&self.base))
            .collect()
    }
}

fn parse(text: &str) -> Result<CliConfig, String> {
    let config: CliConfig = toml::from_str(text).map_err(|e| e.to_string())?;
    let mut seen = std::collections::HashSet::new();
    for spec in &config.providers {
        if spec.name().is_empty() {
            return Err("provider name must not be empty".into());
        }
        if !seen.insert(spec.name()) {
            return Err(format!("duplicate provider name: {}", spec.name()));
        }
    }
    Ok(config)
}

/// Skeleton written by `cloakbox init`.
#[derive(Debug, Serialize)]
pub struct ConfigTemplate {
    /// Local tree to synchronize.
    pub root: PathBuf,
    /// Freshly generated salt.
    pub salt: Salt,
    /// Initialization attempts per provider and pass.
    pub retry_attempts: u32,
    /// Argon2id cost parameters.
    pub kdf: KdfParams,
    /// Local providers given on the command line.
    pub providers: Vec<LocalTemplate>,
}

/// A `kind = "local"` provider entry.
#[derive(Debug, Serialize)]
pub struct LocalTemplate {
    /// Always `"local"`.
    pub kind: &'static str,
    /// Provider name.
    pub name: String,
    /// Directory holding the objects.
    pub path: PathBuf,
}

impl ConfigTemplate {
    /// Creates a template for `root` with a new random salt.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            salt: Salt::generate(),
            retry_attempts: default_retry_attempts(),
            kdf: KdfParams::default(),
            providers: Vec::new(),
        }
    }

    /// Adds a local provider.
    pub fn with_local(mut self, name: impl Into<String>, path: PathBuf) -> Self {
        self.providers.push(LocalTemplate {
            kind: "local",
            name: name.into(),
            path,
        });
        self
    }

    /// Renders the template as TOML.
    ///
    /// # Errors
    ///
    /// Fails only if a path is not valid UTF-8.
    pub fn render(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
root = "tree"
salt = "00112233445566778899aabbccddeeff"

[[providers]]
kind = "local"
name = "usb"
path = "/media/usb/cloakbox"

[[providers]]
kind = "ftp"
name = "nas"
host = "nas.local"
port = 2121
username = "me"
password = "secret"
folder = "cloakbox"
"#;

    #[test]
    fn parses_both_provider_kinds() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.retry_attempts, 3);
        assert!(config.verify_downloads);
        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name(), "usb");
        match &config.providers[1] {
            ProviderSpec::Ftp {
                port, password, folder, ..
            } => {
                assert_eq!(*port, Some(2121));
                assert_eq!(password.expose(), "secret");
                assert_eq!(folder.as_deref(), Some("cloakbox"));
            }
            other => panic!("expected ftp, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let text = r#"
root = "tree"
salt = "00112233445566778899aabbccddeeff"

[[providers]]
kind = "local"
name = "usb"
path = "a"

[[providers]]
kind = "local"
name = "usb"
path = "b"
"#;
        let err = parse(text).unwrap_err();
        assert!(err.contains("duplicate provider name"));
    }

    #[test]
    fn rejects_bad_salt_and_unknown_kind() {
        let bad_salt = "root = \"t\"\nsalt = \"abc\"\n";
        assert!(parse(bad_salt).is_err());

        let bad_kind = r#"
root = "t"
salt = "00112233445566778899aabbccddeeff"

[[providers]]
kind = "s3"
name = "x"
"#;
        assert!(parse(bad_kind).is_err());
    }

    #[test]
    fn relative_paths_follow_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();

        let loaded = LoadedConfig::load(&path).unwrap();
        assert_eq!(loaded.root(), dir.path().join("tree"));
        assert_eq!(loaded.sync_config().retry_attempts, 3);

        let providers = loaded.providers();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name(), "usb");
        assert_eq!(providers[1].kind(), "ftp");
    }

    #[test]
    fn template_round_trips() {
        let template = ConfigTemplate::new(PathBuf::from("tree"))
            .with_local("usb", PathBuf::from("/media/usb"));
        let text = template.render().unwrap();
        let config = parse(&text).unwrap();
        assert_eq!(config.salt, template.salt);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name(), "usb");
    }
}
