//! Ls command implementation.

use super::Format;
use crate::error::CliResult;
use cloakbox_sync_engine::{Engine, ItemState, TrackedItem};

/// Lists tracked files with their state after the last pass.
pub fn run(engine: &Engine, pending_only: bool, format: Format) -> CliResult<()> {
    let items: Vec<TrackedItem> = engine
        .items()
        .into_iter()
        .filter(|item| !pending_only || item.state != ItemState::Synced)
        .collect();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        Format::Text => {
            if items.is_empty() {
                println!("No tracked files");
            }
            for item in &items {
                println!(
                    "{:<18} {}  [{}]",
                    item.state.to_string(),
                    item.path,
                    item.providers.join(", ")
                );
            }
        }
    }
    Ok(())
}
