//! Conflicts command implementation.

use super::Format;
use crate::error::CliResult;
use cloakbox_sync_engine::Engine;

/// Lists every conflict resolved so far and where the local copy went.
pub fn run(engine: &Engine, format: Format) -> CliResult<()> {
    let conflicts = engine.conflicts();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        Format::Text => {
            if conflicts.is_empty() {
                println!("No conflicts");
                return Ok(());
            }
            println!("Conflicts ({} total)", conflicts.len());
            println!("================");
            for c in &conflicts {
                println!();
                println!("  {}", c.path);
                println!("    kept local copy: {}", c.preserved);
                println!(
                    "    local {} / remote {} from {}",
                    c.local_fingerprint.short(),
                    c.remote_fingerprint.short(),
                    c.provider
                );
                println!("    detected at: {} ms since epoch", c.detected_at);
            }
        }
    }
    Ok(())
}
