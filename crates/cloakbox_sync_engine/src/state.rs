//! Engine state, statistics and pass reports.

use crate::descriptor::ConflictRecord;
use crate::planner::ItemState;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No pass has run yet.
    Idle,
    /// Initializing providers and reading remote manifests.
    Connecting,
    /// Walking the local tree.
    Scanning,
    /// Planning and executing per-file actions.
    Reconciling,
    /// The last pass completed.
    Synced,
    /// The last pass failed.
    Error,
}

impl EngineState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Connecting | EngineState::Scanning | EngineState::Reconciling
        )
    }

    /// Returns true if a new pass may start.
    pub fn can_start_pass(&self) -> bool {
        !self.is_active()
    }
}

/// Statistics about reconciliation passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that ran to completion.
    pub passes_completed: u64,
    /// Files written to a provider.
    pub uploads: u64,
    /// Files written locally from a provider.
    pub downloads: u64,
    /// Local and remote deletions.
    pub deletions: u64,
    /// Conflicts resolved by preserving a local edit.
    pub conflicts_encountered: u64,
    /// Per-file failures.
    pub failures: u64,
    /// When the last pass finished.
    pub last_pass_time: Option<Instant>,
    /// Error that ended the last pass, if any.
    pub last_error: Option<String>,
}

/// Kind of a transfer performed during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Local content written to a provider.
    Upload,
    /// Remote content written to the local tree.
    Download,
    /// Remote copy deleted.
    DeleteRemote,
    /// Local file deleted.
    DeleteLocal,
    /// Local edit moved to a conflict side slot.
    Preserve,
}

/// One transfer performed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    /// Relative path of the file.
    pub path: String,
    /// What was done.
    pub kind: OperationKind,
    /// Provider involved, if any.
    pub provider: Option<String>,
}

/// A file that could not be brought into agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    /// Relative path of the file.
    pub path: String,
    /// Provider involved, if the failure is provider specific.
    pub provider: Option<String>,
    /// Rendered error.
    pub error: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Transfers performed, in execution order.
    pub operations: Vec<Operation>,
    /// Conflicts detected and resolved.
    pub conflicts: Vec<ConflictRecord>,
    /// Per-file failures; the affected items stay `Partial` or `Error`.
    pub failures: Vec<FileFailure>,
    /// Providers left out of this pass, with the reason.
    pub skipped_providers: Vec<ProviderHealth>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl PassReport {
    /// Returns true if the pass changed nothing and hit no failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.operations.is_empty() && self.failures.is_empty() && self.conflicts.is_empty()
    }

    /// Counts operations of one kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    pub(crate) fn record(&mut self, path: &str, kind: OperationKind, provider: Option<&str>) {
        self.operations.push(Operation {
            path: path.to_string(),
            kind,
            provider: provider.map(str::to_string),
        });
    }

    pub(crate) fn fail(&mut self, path: &str, provider: Option<&str>, error: impl fmt::Display) {
        self.failures.push(FileFailure {
            path: path.to_string(),
            provider: provider.map(str::to_string),
            error: error.to_string(),
        });
    }
}

/// A path the engine tracks, with its state after the last pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedItem {
    /// Relative path.
    pub path: String,
    /// Current state.
    pub state: ItemState,
    /// Providers known to hold the current content.
    pub providers: Vec<String>,
}

/// Outcome of connecting one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    /// Initialized, and its manifest decrypts under our key.
    Ready {
        /// Identity of the remote.
        remote_id: Uuid,
    },
    /// Initialization or manifest access failed.
    Unreachable {
        /// Rendered cause.
        reason: String,
    },
    /// Reachable, but the manifest does not decrypt under our key.
    CannotDecrypt {
        /// Rendered cause.
        reason: String,
    },
}

impl Health {
    /// Returns true if the provider takes part in passes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Health::Ready { .. })
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Ready { remote_id } => write!(f, "ready (remote {remote_id})"),
            Health::Unreachable { reason } => write!(f, "could not connect: {reason}"),
            Health::CannotDecrypt { reason } => write!(f, "cannot decrypt: {reason}"),
        }
    }
}

/// Connection status of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    /// Provider name.
    pub name: String,
    /// Backend kind.
    pub kind: String,
    /// Outcome.
    #[serde(flatten)]
    pub health: Health,
}
