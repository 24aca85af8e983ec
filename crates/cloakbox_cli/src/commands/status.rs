//! Status command implementation.

use super::Format;
use crate::error::CliResult;
use cloakbox_sync_engine::{Engine, ProviderHealth};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct StatusOutput {
    root: String,
    client_id: String,
    tracked_files: usize,
    conflicts: usize,
    providers: Vec<ProviderHealth>,
}

/// Connects every provider and reports its health.
///
/// Returns `false` if any provider is not ready.
pub async fn run(engine: &Engine, format: Format) -> CliResult<bool> {
    let providers = engine.connect().await;
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "provider shutdown failed");
    }

    let output = StatusOutput {
        root: engine.config().root.display().to_string(),
        client_id: engine.client_id().to_string(),
        tracked_files: engine.items().len(),
        conflicts: engine.conflicts().len(),
        providers,
    };
    let all_ready = output.providers.iter().all(|p| p.health.is_ready());

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        Format::Text => {
            println!("Root:      {}", output.root);
            println!("Client:    {}", output.client_id);
            println!("Tracked:   {} files", output.tracked_files);
            println!("Conflicts: {}", output.conflicts);
            println!();
            for p in &output.providers {
                let mark = if p.health.is_ready() { "✓" } else { "✗" };
                println!("{mark} {} ({}): {}", p.name, p.kind, p.health);
            }
        }
    }
    Ok(all_ready)
}
