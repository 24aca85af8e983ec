//! Init command implementation.

use crate::config::ConfigTemplate;
use crate::error::{CliError, CliResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Parses a `--local name=path` argument.
pub fn parse_local(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got {arg:?}")),
    }
}

/// Writes a fresh configuration file with a new salt.
///
/// The sync root is created if missing. Local provider directories are
/// left alone; providers create them on first initialization.
pub fn run(
    config_path: &Path,
    root: &Path,
    locals: &[(String, PathBuf)],
    force: bool,
) -> CliResult<()> {
    if config_path.exists() && !force {
        return Err(CliError::AlreadyExists(config_path.to_path_buf()));
    }

    fs::create_dir_all(root)?;
    let template = locals
        .iter()
        .fold(ConfigTemplate::new(root.to_path_buf()), |t, (name, path)| {
            t.with_local(name.clone(), path.clone())
        });
    let text = template
        .render()
        .map_err(|e| CliError::config(config_path, e.to_string()))?;
    fs::write(config_path, text)?;
    info!(path = %config_path.display(), "configuration written");

    println!("✓ Configuration written to {}", config_path.display());
    println!("  Root: {}", root.display());
    println!("  Salt: {}", template.salt);
    println!("  Providers: {}", template.providers.len());
    println!();
    println!("Every client sharing these remotes needs the same salt and passphrase.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadedConfig;

    #[test]
    fn parse_local_args() {
        assert_eq!(
            parse_local("usb=/media/usb").unwrap(),
            ("usb".to_string(), PathBuf::from("/media/usb"))
        );
        assert!(parse_local("usb").is_err());
        assert!(parse_local("=x").is_err());
        assert!(parse_local("usb=").is_err());
    }

    #[test]
    fn init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cloakbox.toml");
        let root = dir.path().join("tree");
        let locals = vec![("usb".to_string(), dir.path().join("usb"))];

        run(&config_path, &root, &locals, false).unwrap();
        assert!(root.is_dir());

        let loaded = LoadedConfig::load(&config_path).unwrap();
        assert_eq!(loaded.root(), root);
        assert_eq!(loaded.providers().len(), 1);

        let err = run(&config_path, &root, &locals, false).unwrap_err();
        assert!(matches!(err, CliError::AlreadyExists(_)));
        run(&config_path, &root, &[], true).unwrap();
        assert!(LoadedConfig::load(&config_path).unwrap().providers().is_empty());
    }
}
