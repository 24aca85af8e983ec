//! Per-file sync records.

use cloakbox_provider::ObjectId;
use cloakbox_store::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where one provider holds a file, as last confirmed by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Object holding the encrypted content.
    pub object_id: ObjectId,
    /// Fingerprint of the content that object held.
    pub fingerprint: Fingerprint,
}

/// What this client last agreed on for one file.
///
/// Created on the first successful sync of a path, updated after every
/// transfer, and dropped once the file is gone locally and on every remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Path relative to the sync root.
    pub path: String,
    /// Fingerprint of the last synchronized content.
    pub fingerprint: Fingerprint,
    /// Size of the last synchronized content.
    pub size: u64,
    /// Per-provider location, keyed by provider name.
    pub remotes: BTreeMap<String, RemoteRef>,
}

impl Descriptor {
    /// Creates a descriptor with no remote copies yet.
    pub fn new(path: impl Into<String>, fingerprint: Fingerprint, size: u64) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            size,
            remotes: BTreeMap::new(),
        }
    }

    /// Returns the reference recorded for `provider`.
    #[must_use]
    pub fn remote(&self, provider: &str) -> Option<&RemoteRef> {
        self.remotes.get(provider)
    }

    /// Returns true if `provider` holds the current content.
    #[must_use]
    pub fn is_current_on(&self, provider: &str) -> bool {
        self.remote(provider)
            .is_some_and(|r| r.fingerprint == self.fingerprint)
    }
}

/// A local edit preserved because a remote edit won the canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Path of the conflicted file.
    pub path: String,
    /// Side slot holding the preserved local content, relative to the root.
    pub preserved: String,
    /// Fingerprint of the preserved local content.
    pub local_fingerprint: Fingerprint,
    /// Fingerprint of the remote content that won.
    pub remote_fingerprint: Fingerprint,
    /// Provider the winning content came from.
    pub provider: String,
    /// Detection time, Unix milliseconds.
    pub detected_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_on_tracks_fingerprint() {
        let mut d = Descriptor::new("a.txt", Fingerprint::of(b"v2"), 2);
        d.remotes.insert(
            "usb".into(),
            RemoteRef {
                object_id: ObjectId::generate(),
                fingerprint: Fingerprint::of(b"v1"),
            },
        );
        d.remotes.insert(
            "ftp".into(),
            RemoteRef {
                object_id: ObjectId::generate(),
                fingerprint: Fingerprint::of(b"v2"),
            },
        );
        assert!(!d.is_current_on("usb"));
        assert!(d.is_current_on("ftp"));
        assert!(!d.is_current_on("nas"));
    }
}
