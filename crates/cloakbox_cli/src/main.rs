//! Cloakbox CLI
//!
//! Keeps a local directory tree in sync with several encrypted remotes.
//!
//! # Commands
//!
//! - `init` - Write a configuration file with a fresh salt
//! - `sync` - Run one reconciliation pass
//! - `status` - Connect every provider and report its health
//! - `ls` - List tracked files and their state
//! - `conflicts` - List preserved conflict copies
//!
//! The passphrase is read from `CLOAKBOX_PASSPHRASE` or `--passphrase-file`.

mod commands;
mod config;
mod error;

use clap::{Parser, Subcommand};
use commands::Format;
use config::DEFAULT_CONFIG_FILE;
use error::CliResult;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Encrypted multi-provider file sync.
#[derive(Parser)]
#[command(name = "cloakbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Read the passphrase from this file instead of the environment
    #[arg(global = true, long)]
    passphrase_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration file
    Init {
        /// Local tree to synchronize
        root: PathBuf,

        /// Add a local-directory provider (NAME=PATH), repeatable
        #[arg(long = "local", value_parser = commands::init::parse_local)]
        locals: Vec<(String, PathBuf)>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run one reconciliation pass
    Sync {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Connect every provider and report its health
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List tracked files
    Ls {
        /// Only show files that are not fully synced
        #[arg(short, long)]
        pending: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List preserved conflict copies
    Conflicts {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatches a command. `Ok(false)` means it ran but found problems.
async fn run(cli: Cli) -> CliResult<bool> {
    let passphrase_file = cli.passphrase_file.as_deref();
    match cli.command {
        Commands::Init {
            root,
            locals,
            force,
        } => {
            commands::init::run(&cli.config, &root, &locals, force)?;
            Ok(true)
        }
        Commands::Sync { format } => {
            let engine = commands::open_engine(&cli.config, passphrase_file)?;
            commands::sync::run(&engine, format).await
        }
        Commands::Status { format } => {
            let engine = commands::open_engine(&cli.config, passphrase_file)?;
            commands::status::run(&engine, format).await
        }
        Commands::Ls { pending, format } => {
            let engine = commands::open_engine(&cli.config, passphrase_file)?;
            commands::ls::run(&engine, pending, format)?;
            Ok(true)
        }
        Commands::Conflicts { format } => {
            let engine = commands::open_engine(&cli.config, passphrase_file)?;
            commands::conflicts::run(&engine, format)?;
            Ok(true)
        }
        Commands::Version => {
            println!("Cloakbox CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Remote format v{}, state format v{}",
                cloakbox_store::REMOTE_FORMAT_VERSION,
                cloakbox_sync_engine::STATE_FORMAT_VERSION
            );
            Ok(true)
        }
    }
}
