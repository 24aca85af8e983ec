//! Per-remote manifests stored at reserved ids.
//!
//! Object names on a remote are opaque ids, so everything that gives them
//! meaning lives in two encrypted objects:
//!
//! - [`RemoteConfig`] at `config`: who this remote is
//! - [`RemoteIndex`] at `index`: which path each object holds

use crate::error::{StoreError, StoreResult};
use crate::fingerprint::Fingerprint;
use cloakbox_provider::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current manifest format version.
pub const REMOTE_FORMAT_VERSION: u32 = 1;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Self-describing manifest of one remote.
///
/// Read once when the engine connects: decrypting it proves both that the
/// remote is reachable and that the passphrase is right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Manifest format version.
    pub format_version: u32,
    /// Stable identity of this remote.
    pub remote_id: Uuid,
    /// Backend kind that created the remote.
    pub provider_kind: String,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Last metadata change, Unix milliseconds.
    pub updated_at: u64,
}

impl RemoteConfig {
    /// Creates the manifest for a freshly bootstrapped remote.
    #[must_use]
    pub fn new(provider_kind: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            format_version: REMOTE_FORMAT_VERSION,
            remote_id: Uuid::new_v4(),
            provider_kind: provider_kind.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a metadata change.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    /// Fails if the manifest was written by an incompatible version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] for an unknown format version.
    pub fn check_version(&self) -> StoreResult<()> {
        if self.format_version == REMOTE_FORMAT_VERSION {
            Ok(())
        } else {
            Err(StoreError::codec(format!(
                "unsupported remote format version {} (expected {})",
                self.format_version, REMOTE_FORMAT_VERSION
            )))
        }
    }
}

/// One synchronized file as recorded on a remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Object holding the encrypted content.
    pub object_id: ObjectId,
    /// Fingerprint of the plaintext.
    pub fingerprint: Fingerprint,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Client that last wrote this entry.
    pub modified_by: Uuid,
}

/// Encrypted inventory of one remote: relative path to [`IndexEntry`].
///
/// `revision` increases on every write, which lets a client tell whether
/// anything changed since it last looked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIndex {
    /// Monotonic write counter.
    pub revision: u64,
    entries: BTreeMap<String, IndexEntry>,
}

impl RemoteIndex {
    /// Creates an empty index at revision zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// Records `entry` for `path`, returning the previous entry.
    pub fn insert(&mut self, path: impl Into<String>, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(path.into(), entry)
    }

    /// Removes the entry for `path`.
    pub fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        self.entries.remove(path)
    }

    /// Iterates entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates tracked paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no file is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances the revision before a write.
    pub fn bump(&mut self) {
        self.revision += 1;
    }
}
