//! Sync command implementation.

use super::Format;
use crate::error::CliResult;
use cloakbox_sync_engine::{Engine, OperationKind, PassReport, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs one reconciliation pass. Ctrl-C stops the pass between files.
///
/// Returns `false` if any file failed or any provider was skipped.
pub async fn run(engine: &Engine, format: Format) -> CliResult<bool> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing current file");
                cancel.cancel();
            }
        })
    };

    let result = engine.reconcile_cancellable(&cancel).await;
    watcher.abort();
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "provider shutdown failed");
    }

    let report = match result {
        Ok(report) => report,
        Err(SyncError::Cancelled) => {
            println!("Pass cancelled; completed work was saved.");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        operations = report.operations.len(),
        failures = report.failures.len(),
        skipped = report.skipped_providers.len(),
        "pass finished"
    );

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_text_output(&report),
    }
    Ok(report.failures.is_empty() && report.skipped_providers.is_empty())
}

fn print_text_output(report: &PassReport) {
    if report.is_clean() && report.skipped_providers.is_empty() {
        println!("✓ Everything in sync ({:.2?})", report.duration);
        return;
    }

    for op in &report.operations {
        let verb = match op.kind {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::DeleteRemote => "delete remote",
            OperationKind::DeleteLocal => "delete local",
            OperationKind::Preserve => "preserve",
        };
        match &op.provider {
            Some(provider) => println!("  {verb:<14} {} [{provider}]", op.path),
            None => println!("  {verb:<14} {}", op.path),
        }
    }
    for conflict in &report.conflicts {
        println!(
            "  conflict       {} -> kept local copy at {}",
            conflict.path, conflict.preserved
        );
    }
    for failure in &report.failures {
        match &failure.provider {
            Some(provider) => println!("✗ {} [{provider}]: {}", failure.path, failure.error),
            None => println!("✗ {}: {}", failure.path, failure.error),
        }
    }
    for skipped in &report.skipped_providers {
        println!("✗ skipped {} ({}): {}", skipped.name, skipped.kind, skipped.health);
    }

    println!();
    println!(
        "{} uploads, {} downloads, {} deletions, {} conflicts, {} failures ({:.2?})",
        report.count(OperationKind::Upload),
        report.count(OperationKind::Download),
        report.count(OperationKind::DeleteRemote) + report.count(OperationKind::DeleteLocal),
        report.conflicts.len(),
        report.failures.len(),
        report.duration
    );
}
