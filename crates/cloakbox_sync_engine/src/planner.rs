//! Per-file reconciliation decisions.
//!
//! Planning is pure: it looks at the local fingerprint, the descriptor and
//! what each reachable provider's index says, and returns the state of the
//! item plus the single action that brings it back in agreement. The pass
//! executes the action; nothing here touches the network or the disk.
//!
//! Provider positions in a [`FilePlan`] index into the `remotes` slice
//! given to [`plan`].

use crate::descriptor::Descriptor;
use cloakbox_store::{Fingerprint, IndexEntry};
use serde::Serialize;
use std::fmt;

/// Sync state of one tracked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Local, descriptor and every reachable remote agree.
    Synced,
    /// Present locally, never uploaded.
    Unsynced,
    /// Some providers lack the current content.
    Partial,
    /// Edited locally since the last sync.
    LocallyModified,
    /// Edited on a remote since the last sync.
    RemotelyModified,
    /// Edited both locally and remotely.
    Conflict,
    /// Removed locally since the last sync.
    DeletedLocally,
    /// Removed on a remote since the last sync.
    DeletedRemotely,
    /// Present on a remote, never seen locally.
    RemoteOnly,
    /// The last attempt failed on every provider.
    Error,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Synced => "synced",
            ItemState::Unsynced => "unsynced",
            ItemState::Partial => "partial",
            ItemState::LocallyModified => "locally modified",
            ItemState::RemotelyModified => "remotely modified",
            ItemState::Conflict => "conflict",
            ItemState::DeletedLocally => "deleted locally",
            ItemState::DeletedRemotely => "deleted remotely",
            ItemState::RemoteOnly => "remote only",
            ItemState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a reachable provider's index says about one path.
#[derive(Debug, Clone, Copy)]
pub struct RemoteView<'a> {
    /// Provider name.
    pub name: &'a str,
    /// Index entry, if the provider holds the path.
    pub entry: Option<&'a IndexEntry>,
}

/// The transfer that restores agreement for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to transfer.
    None,
    /// Upload local content to `targets`.
    Upload {
        /// Providers to write.
        targets: Vec<usize>,
    },
    /// Replace local content with the copy held by `source`.
    Download {
        /// Provider to read from.
        source: usize,
        /// Move the current local file to a side slot first.
        preserve_local: bool,
        /// Providers to write the downloaded content to afterwards.
        propagate: Vec<usize>,
    },
    /// Delete the remote copies on `targets`.
    DeleteRemote {
        /// Providers to delete from.
        targets: Vec<usize>,
    },
    /// Delete the local file, then the remote copies on `targets`.
    DeleteLocal {
        /// Providers still holding the file.
        targets: Vec<usize>,
    },
    /// Drop the descriptor; no copy remains anywhere reachable.
    Forget,
}

impl Action {
    /// Returns true if the action moves or deletes data.
    #[must_use]
    pub fn is_transfer(&self) -> bool {
        !matches!(self, Action::None | Action::Forget)
    }
}

/// Outcome of planning one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePlan {
    /// Classified state.
    pub state: ItemState,
    /// Providers whose entry already holds the content the plan converges
    /// on; their references are recorded without a transfer.
    pub adopt: Vec<usize>,
    /// Action to execute.
    pub action: Action,
}

impl FilePlan {
    fn new(state: ItemState, adopt: Vec<usize>, action: Action) -> Self {
        Self {
            state,
            adopt,
            action,
        }
    }
}

/// How one provider's entry relates to the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drift {
    /// Holds the descriptor's content.
    Same,
    /// Holds what this client last wrote there, which is older content.
    Stale,
    /// Holds content this client did not put there.
    Changed,
    /// Held the file once; the entry is gone.
    Removed,
    /// Never held the file.
    Missing,
}

fn drift(descriptor: &Descriptor, view: &RemoteView<'_>) -> Drift {
    let known = descriptor.remote(view.name);
    match view.entry {
        Some(e) if e.fingerprint == descriptor.fingerprint => Drift::Same,
        Some(e) => match known {
            Some(r) if r.object_id == e.object_id && r.fingerprint == e.fingerprint => Drift::Stale,
            _ => Drift::Changed,
        },
        None if known.is_some() => Drift::Removed,
        None => Drift::Missing,
    }
}

fn holds(view: &RemoteView<'_>, fingerprint: Fingerprint) -> bool {
    view.entry.is_some_and(|e| e.fingerprint == fingerprint)
}

/// Splits providers into those holding `fingerprint` and the rest.
fn partition(remotes: &[RemoteView<'_>], fingerprint: Fingerprint) -> (Vec<usize>, Vec<usize>) {
    (0..remotes.len()).partition(|&i| holds(&remotes[i], fingerprint))
}

/// Plans a download from `source`, writing the result to every provider
/// that does not already hold it.
fn download_from(
    state: ItemState,
    remotes: &[RemoteView<'_>],
    source: usize,
    preserve_local: bool,
) -> FilePlan {
    let fingerprint = remotes[source]
        .entry
        .map(|e| e.fingerprint)
        .unwrap_or_else(|| Fingerprint::from_digest([0; 32]));
    let (adopt, propagate) = partition(remotes, fingerprint);
    FilePlan::new(
        state,
        adopt,
        Action::Download {
            source,
            preserve_local,
            propagate,
        },
    )
}

/// Plans an upload of `local` to every provider that lacks it.
fn upload_to_rest(
    done: ItemState,
    pending: ItemState,
    remotes: &[RemoteView<'_>],
    local: Fingerprint,
) -> FilePlan {
    let (adopt, targets) = partition(remotes, local);
    if targets.is_empty() {
        FilePlan::new(done, adopt, Action::None)
    } else {
        FilePlan::new(pending, adopt, Action::Upload { targets })
    }
}

/// Decides what to do with one path.
///
/// `local` is the fingerprint of the file on disk, `descriptor` what this
/// client last agreed on, and `remotes` the reachable providers.
#[must_use]
pub fn plan(
    local: Option<Fingerprint>,
    descriptor: Option<&Descriptor>,
    remotes: &[RemoteView<'_>],
) -> FilePlan {
    match descriptor {
        None => plan_untracked(local, remotes),
        Some(d) => plan_tracked(local, d, remotes),
    }
}

fn plan_untracked(local: Option<Fingerprint>, remotes: &[RemoteView<'_>]) -> FilePlan {
    let first_present = remotes.iter().position(|v| v.entry.is_some());
    match (local, first_present) {
        (Some(_), None) => FilePlan::new(
            ItemState::Unsynced,
            Vec::new(),
            Action::Upload {
                targets: (0..remotes.len()).collect(),
            },
        ),
        (Some(l), Some(_)) => {
            let differing = remotes
                .iter()
                .position(|v| v.entry.is_some_and(|e| e.fingerprint != l));
            match differing {
                Some(source) => download_from(ItemState::Conflict, remotes, source, true),
                None => upload_to_rest(ItemState::Synced, ItemState::Partial, remotes, l),
            }
        }
        (None, Some(source)) => download_from(ItemState::RemoteOnly, remotes, source, false),
        (None, None) => FilePlan::new(ItemState::Synced, Vec::new(), Action::None),
    }
}

fn plan_tracked(
    local: Option<Fingerprint>,
    descriptor: &Descriptor,
    remotes: &[RemoteView<'_>],
) -> FilePlan {
    let drifts: Vec<Drift> = remotes.iter().map(|v| drift(descriptor, v)).collect();
    let first_changed = drifts.iter().position(|d| *d == Drift::Changed);
    let still_held: Vec<usize> = (0..remotes.len())
        .filter(|&i| matches!(drifts[i], Drift::Same | Drift::Stale))
        .collect();

    match local {
        Some(l) if l == descriptor.fingerprint => {
            if let Some(source) = first_changed {
                download_from(ItemState::RemotelyModified, remotes, source, false)
            } else if drifts.contains(&Drift::Removed) && still_held.is_empty() {
                // Every provider that had the file deleted it.
                FilePlan::new(
                    ItemState::DeletedRemotely,
                    Vec::new(),
                    Action::DeleteLocal {
                        targets: Vec::new(),
                    },
                )
            } else {
                upload_to_rest(ItemState::Synced, ItemState::Partial, remotes, l)
            }
        }
        Some(l) => {
            let diverged = (0..remotes.len())
                .find(|&i| drifts[i] == Drift::Changed && !holds(&remotes[i], l));
            match diverged {
                Some(source) => download_from(ItemState::Conflict, remotes, source, true),
                // Either nobody else edited, or their edit equals ours.
                None => upload_to_rest(
                    ItemState::Synced,
                    ItemState::LocallyModified,
                    remotes,
                    l,
                ),
            }
        }
        None => {
            if let Some(source) = first_changed {
                download_from(ItemState::RemotelyModified, remotes, source, false)
            } else if still_held.is_empty() {
                FilePlan::new(ItemState::DeletedLocally, Vec::new(), Action::Forget)
            } else {
                FilePlan::new(
                    ItemState::DeletedLocally,
                    Vec::new(),
                    Action::DeleteRemote {
                        targets: still_held,
                    },
                )
            }
        }
    }
}
