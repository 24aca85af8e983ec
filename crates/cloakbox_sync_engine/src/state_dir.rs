//! Local state directory.
//!
//! Layout inside the synchronized root:
//!
//! ```text
//! <root>/.cloakbox/
//! ├─ LOCK              # Advisory lock: one engine per tree
//! ├─ state.json        # Client id, descriptors, conflicts, remote ids
//! ├─ tmp/              # Downloads staged before rename
//! └─ conflicts/        # Preserved local edits (side slots)
//! ```

use crate::descriptor::{ConflictRecord, Descriptor};
use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "state.json";
const STATE_TEMP: &str = "state.json.tmp";
const TMP_DIR: &str = "tmp";
pub(crate) const CONFLICTS_DIR: &str = "conflicts";

/// Current state file format version.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Contents of `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// State file format version.
    pub format_version: u32,
    /// Identity of this client, recorded as `modified_by` on remotes.
    pub client_id: Uuid,
    /// Descriptors keyed by relative path.
    pub descriptors: BTreeMap<String, Descriptor>,
    /// Conflicts detected so far.
    pub conflicts: Vec<ConflictRecord>,
    /// Last `remote_id` seen per provider name.
    #[serde(default)]
    pub remote_ids: BTreeMap<String, Uuid>,
}

impl PersistedState {
    fn fresh() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            client_id: Uuid::new_v4(),
            descriptors: BTreeMap::new(),
            conflicts: Vec::new(),
            remote_ids: BTreeMap::new(),
        }
    }

    fn check(&self) -> SyncResult<()> {
        if self.format_version != STATE_FORMAT_VERSION {
            return Err(SyncError::corrupted(format!(
                "unsupported state format version {}",
                self.format_version
            )));
        }
        if let Some((key, d)) = self.descriptors.iter().find(|(k, d)| **k != d.path) {
            return Err(SyncError::corrupted(format!(
                "descriptor for {key} records path {}",
                d.path
            )));
        }
        Ok(())
    }
}

/// Exclusive handle on a tree's state directory.
///
/// Holding a `StateDir` holds an advisory lock; a second engine on the same
/// tree, in this process or another, fails with [`SyncError::Locked`].
#[derive(Debug)]
pub struct StateDir {
    path: PathBuf,
    state: PersistedState,
    _lock_file: File,
}

impl StateDir {
    /// Opens or creates the state directory at `path` and loads its state.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another engine holds the directory,
    /// `StateCorrupted` if `state.json` cannot be parsed, or an I/O error.
    pub fn open(path: &Path) -> SyncResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::Locked(path.to_path_buf()));
        }

        // Staged downloads from an interrupted pass are never referenced.
        let tmp = path.join(TMP_DIR);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;
        fs::create_dir_all(path.join(CONFLICTS_DIR))?;

        let state = match fs::read(path.join(STATE_FILE)) {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::corrupted(format!("{STATE_FILE}: {e}")))?;
                state.check()?;
                debug!(descriptors = state.descriptors.len(), "loaded sync state");
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = PersistedState::fresh();
                info!(client_id = %state.client_id, "created sync state");
                state
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            state,
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory for staging downloads.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.path.join(TMP_DIR)
    }

    /// Directory holding preserved local edits.
    #[must_use]
    pub fn conflicts_dir(&self) -> PathBuf {
        self.path.join(CONFLICTS_DIR)
    }

    /// This client's identity.
    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.state.client_id
    }

    /// Descriptors keyed by relative path.
    #[must_use]
    pub fn descriptors(&self) -> &BTreeMap<String, Descriptor> {
        &self.state.descriptors
    }

    /// Replaces all descriptors.
    pub fn set_descriptors(&mut self, descriptors: BTreeMap<String, Descriptor>) {
        self.state.descriptors = descriptors;
    }

    /// The remote identity last seen behind provider `name`.
    #[must_use]
    pub fn remote_id(&self, name: &str) -> Option<Uuid> {
        self.state.remote_ids.get(name).copied()
    }

    /// Records the remote identity behind provider `name`.
    pub fn set_remote_id(&mut self, name: &str, remote_id: Uuid) {
        self.state.remote_ids.insert(name.to_string(), remote_id);
    }

    /// Drops every descriptor reference to provider `name`.
    ///
    /// Returns the number of references removed.
    pub fn forget_remote(&mut self, name: &str) -> usize {
        let mut removed = 0;
        for d in self.state.descriptors.values_mut() {
            if d.remotes.remove(name).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Conflicts recorded so far, oldest first.
    #[must_use]
    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.state.conflicts
    }

    /// Appends conflict records.
    pub fn add_conflicts(&mut self, records: impl IntoIterator<Item = ConflictRecord>) {
        self.state.conflicts.extend(records);
    }

    /// Writes the state atomically (temp file, sync, rename).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn save(&self) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| SyncError::corrupted(format!("cannot encode state: {e}")))?;

        let temp = self.path.join(STATE_TEMP);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.path.join(STATE_FILE))?;
        Ok(())
    }
}
