//! Execution of one reconciliation pass.
//!
//! A [`Pass`] works on a private copy of the descriptors. Remote index
//! changes are buffered per provider and written once at the end by
//! [`Pass::flush`]; if an index write fails, the descriptor references for
//! that provider are rolled back so the next pass redoes the work.

use crate::config::STATE_DIR_NAME;
use crate::descriptor::{ConflictRecord, Descriptor, RemoteRef};
use crate::error::{SyncError, SyncResult};
use crate::planner::{self, Action, ItemState, RemoteView};
use crate::state::{OperationKind, PassReport, TrackedItem};
use crate::state_dir::CONFLICTS_DIR;
use crate::tree::{hash_file, local_path, LocalFile};
use cloakbox_provider::{ObjectId, Provider, ReservedId};
use cloakbox_store::{
    now_millis, BlobDigest, Fingerprint, IndexEntry, ObjectStore, RemoteIndex, StoreError,
    StoreResult,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A buffered change to one remote index.
#[derive(Debug, Clone)]
enum IndexChange {
    Set(String, IndexEntry),
    Remove(String),
}

impl IndexChange {
    fn path(&self) -> &str {
        match self {
            IndexChange::Set(path, _) | IndexChange::Remove(path) => path,
        }
    }

    fn apply(&self, index: &mut RemoteIndex) {
        match self {
            IndexChange::Set(path, entry) => {
                index.insert(path.clone(), entry.clone());
            }
            IndexChange::Remove(path) => {
                index.remove(path);
            }
        }
    }
}

/// A reachable provider and its index as seen by this pass.
pub(crate) struct Remote {
    provider: Arc<dyn Provider>,
    index: RemoteIndex,
    loaded_revision: u64,
    changes: Vec<IndexChange>,
}

impl Remote {
    pub(crate) fn new(provider: Arc<dyn Provider>, index: RemoteIndex) -> Self {
        Self {
            provider,
            loaded_revision: index.revision,
            index,
            changes: Vec::new(),
        }
    }

    fn name(&self) -> &str {
        self.provider.name()
    }

    fn paths(&self) -> impl Iterator<Item = &str> {
        self.index.paths()
    }

    fn set(&mut self, path: &str, entry: IndexEntry) {
        self.index.insert(path, entry.clone());
        self.changes.push(IndexChange::Set(path.to_string(), entry));
    }

    fn remove(&mut self, path: &str) {
        self.index.remove(path);
        self.changes.push(IndexChange::Remove(path.to_string()));
    }
}

/// Loads a provider's index; a remote with no index yet has an empty one.
pub(crate) async fn load_index(store: &ObjectStore, provider: &dyn Provider) -> StoreResult<RemoteIndex> {
    match store
        .get_object(provider, &ObjectId::reserved(ReservedId::Index))
        .await
    {
        Ok(index) => Ok(index),
        Err(e) if e.is_not_found() => Ok(RemoteIndex::new()),
        Err(e) => Err(e),
    }
}

/// Writes `remote`'s buffered changes onto the freshest copy of its index.
async fn write_index(store: &ObjectStore, remote: &Remote) -> StoreResult<u64> {
    let provider = remote.provider.as_ref();
    let mut index = load_index(store, provider).await?;
    if index.revision != remote.loaded_revision {
        debug!(
            provider = remote.name(),
            loaded = remote.loaded_revision,
            current = index.revision,
            "remote index moved during pass, merging"
        );
    }
    for change in &remote.changes {
        change.apply(&mut index);
    }
    index.bump();

    let id = ObjectId::reserved(ReservedId::Index);
    match store.put_object(provider, &index, Some(&id)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            store
                .create_object(provider, ReservedId::Index, &index)
                .await?;
        }
        Err(e) => return Err(e),
    }
    Ok(index.revision)
}

/// Streams the file at `source` over `existing` in place, or posts it as
/// a new object. Returns the id and the digest of what was read.
async fn store_blob(
    store: &ObjectStore,
    provider: &dyn Provider,
    existing: Option<&ObjectId>,
    source: &Path,
) -> StoreResult<(ObjectId, BlobDigest)> {
    if let Some(id) = existing {
        let file = tokio::fs::File::open(source).await?;
        match store.put_blob(provider, id, file).await {
            Ok(digest) => return Ok((id.clone(), digest)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    let file = tokio::fs::File::open(source).await?;
    store.post_blob(provider, file).await
}

fn changed_during_pass() -> SyncError {
    SyncError::Io(io::Error::other("file changed while syncing"))
}

fn fingerprint_mismatch() -> SyncError {
    SyncError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "downloaded content does not match its fingerprint",
    ))
}

/// Removes now-empty folders between `file` and `root`.
async fn prune_empty_dirs(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || tokio::fs::remove_dir(d).await.is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// Where a pass reads and writes local data.
pub(crate) struct PassEnv<'a> {
    pub(crate) root: &'a Path,
    pub(crate) tmp_dir: PathBuf,
    pub(crate) conflicts_dir: PathBuf,
    pub(crate) store: &'a ObjectStore,
    pub(crate) client_id: Uuid,
    pub(crate) verify_downloads: bool,
}

/// What a finished pass hands back to the engine.
pub(crate) struct PassOutcome {
    pub(crate) descriptors: BTreeMap<String, Descriptor>,
    pub(crate) report: PassReport,
    /// Processed paths with their new item, `None` once a path is gone.
    pub(crate) items: Vec<(String, Option<TrackedItem>)>,
}

/// State of one running pass.
pub(crate) struct Pass<'a> {
    env: PassEnv<'a>,
    remotes: Vec<Remote>,
    original: BTreeMap<String, Descriptor>,
    descriptors: BTreeMap<String, Descriptor>,
    present: BTreeSet<String>,
    processed: Vec<String>,
    failed: BTreeSet<String>,
    report: PassReport,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(
        env: PassEnv<'a>,
        remotes: Vec<Remote>,
        descriptors: BTreeMap<String, Descriptor>,
        report: PassReport,
    ) -> Self {
        Self {
            env,
            remotes,
            original: descriptors.clone(),
            descriptors,
            present: BTreeSet::new(),
            processed: Vec::new(),
            failed: BTreeSet::new(),
            report,
        }
    }

    /// Every path known locally, to this client, or to a reachable remote.
    pub(crate) fn paths<'t>(&self, local: impl Iterator<Item = &'t LocalFile>) -> Vec<String> {
        let mut paths: BTreeSet<String> = local.map(|f| f.path.clone()).collect();
        paths.extend(self.descriptors.keys().cloned());
        for remote in &self.remotes {
            paths.extend(remote.paths().map(str::to_string));
        }
        paths.into_iter().collect()
    }

    /// Leaves `path` out of this pass; its descriptor is kept as is.
    pub(crate) fn keep(&mut self, path: &str) {
        self.present.insert(path.to_string());
    }

    /// Records a per-file failure.
    pub(crate) fn fail(&mut self, path: &str, provider: Option<&str>, error: impl std::fmt::Display) {
        warn!(path, provider, %error, "file not synchronized");
        self.failed.insert(path.to_string());
        self.report.fail(path, provider, error);
    }

    fn name(&self, i: usize) -> String {
        self.remotes[i].name().to_string()
    }

    /// Plans and executes the action for one path.
    pub(crate) async fn reconcile_file(&mut self, path: &str, local: Option<&LocalFile>) {
        self.processed.push(path.to_string());
        if local.is_some() {
            self.present.insert(path.to_string());
        }

        let entries: Vec<Option<IndexEntry>> = self
            .remotes
            .iter()
            .map(|r| r.index.get(path).cloned())
            .collect();
        let plan = {
            let views: Vec<RemoteView<'_>> = self
                .remotes
                .iter()
                .zip(&entries)
                .map(|(r, e)| RemoteView {
                    name: r.name(),
                    entry: e.as_ref(),
                })
                .collect();
            planner::plan(
                local.map(|f| f.fingerprint),
                self.descriptors.get(path),
                &views,
            )
        };
        if plan.action.is_transfer() {
            debug!(path, state = %plan.state, action = ?plan.action, "planned");
        }

        let adopted = self.holders(&plan.adopt, &entries);
        match plan.action {
            Action::None => {
                if let Some(file) = local {
                    self.settle(path, file.fingerprint, file.size, adopted);
                }
            }
            Action::Upload { targets } => {
                if let Some(file) = local {
                    self.upload(path, file, &targets, &entries, adopted).await;
                }
            }
            Action::Download {
                source,
                preserve_local,
                propagate,
            } => {
                self.download(path, local, source, preserve_local, &propagate, &entries, adopted)
                    .await;
            }
            Action::DeleteRemote { targets } => {
                self.delete_remote(path, &targets, &entries).await;
                self.forget_absent(path, &entries);
            }
            Action::DeleteLocal { targets } => {
                if self.delete_local(path, local).await {
                    self.delete_remote(path, &targets, &entries).await;
                    self.forget_absent(path, &entries);
                }
            }
            Action::Forget => self.forget_absent(path, &entries),
        }
    }

    fn holders(&self, adopt: &[usize], entries: &[Option<IndexEntry>]) -> Vec<(String, RemoteRef)> {
        adopt
            .iter()
            .filter_map(|&i| {
                entries[i].as_ref().map(|e| {
                    (
                        self.name(i),
                        RemoteRef {
                            object_id: e.object_id.clone(),
                            fingerprint: e.fingerprint,
                        },
                    )
                })
            })
            .collect()
    }

    /// Records `holders` and moves the descriptor to `fingerprint` once some
    /// provider holds that content.
    fn settle(
        &mut self,
        path: &str,
        fingerprint: Fingerprint,
        size: u64,
        holders: Vec<(String, RemoteRef)>,
    ) {
        if holders.is_empty() && !self.descriptors.contains_key(path) {
            return;
        }
        let d = self
            .descriptors
            .entry(path.to_string())
            .or_insert_with(|| Descriptor::new(path, fingerprint, size));
        for (name, remote) in holders {
            d.remotes.insert(name, remote);
        }
        if d.remotes.values().any(|r| r.fingerprint == fingerprint) {
            d.fingerprint = fingerprint;
            d.size = size;
        }
    }

    async fn upload(
        &mut self,
        path: &str,
        file: &LocalFile,
        targets: &[usize],
        entries: &[Option<IndexEntry>],
        mut holders: Vec<(String, RemoteRef)>,
    ) {
        let source = local_path(self.env.root, path);
        holders.extend(
            self.fan_out(path, targets, entries, &source, file.fingerprint)
                .await,
        );
        self.settle(path, file.fingerprint, file.size, holders);
    }

    /// Streams the file at `source` to every provider in `targets`
    /// concurrently, expecting its content to be `fingerprint`.
    async fn fan_out(
        &mut self,
        path: &str,
        targets: &[usize],
        entries: &[Option<IndexEntry>],
        source: &Path,
        fingerprint: Fingerprint,
    ) -> Vec<(String, RemoteRef)> {
        let store = self.env.store;
        let results = join_all(targets.iter().map(|&t| {
            let provider = Arc::clone(&self.remotes[t].provider);
            let existing = entries[t].as_ref().map(|e| e.object_id.clone());
            async move {
                let result = store_blob(store, provider.as_ref(), existing.as_ref(), source).await;
                (t, result)
            }
        }))
        .await;

        let mut holders = Vec::new();
        for (t, result) in results {
            let name = self.name(t);
            let (object_id, digest) = match result {
                Ok(stored) => stored,
                Err(e) => {
                    self.fail(path, Some(&name), e);
                    continue;
                }
            };
            // The index describes what was stored, even if the file moved on.
            self.remotes[t].set(
                path,
                IndexEntry {
                    object_id: object_id.clone(),
                    fingerprint: digest.fingerprint,
                    size: digest.size,
                    modified_by: self.env.client_id,
                },
            );
            if digest.fingerprint != fingerprint {
                self.fail(path, Some(&name), changed_during_pass());
                continue;
            }
            self.report
                .record(path, OperationKind::Upload, Some(&name));
            holders.push((
                name,
                RemoteRef {
                    object_id,
                    fingerprint,
                },
            ));
        }
        holders
    }

    #[allow(clippy::too_many_arguments)]
    async fn download(
        &mut self,
        path: &str,
        local: Option<&LocalFile>,
        source: usize,
        preserve_local: bool,
        propagate: &[usize],
        entries: &[Option<IndexEntry>],
        mut holders: Vec<(String, RemoteRef)>,
    ) {
        let Some(entry) = entries[source].clone() else {
            return;
        };
        let source_name = self.name(source);
        let staged = match self.fetch(source, &entry).await {
            Ok(staged) => staged,
            Err(e) => {
                self.fail(path, Some(&source_name), e);
                return;
            }
        };

        if let Some(file) = local {
            let ready = if preserve_local {
                self.preserve(path, file, &entry, &source_name).await
            } else if self.unchanged_since_scan(path, file).await {
                Ok(())
            } else {
                Err(changed_during_pass())
            };
            if let Err(e) = ready {
                let _ = tokio::fs::remove_file(&staged).await;
                self.fail(path, None, e);
                return;
            }
        }

        let dest = match self.place(path, &staged).await {
            Ok(dest) => dest,
            Err(e) => {
                self.fail(path, None, e);
                return;
            }
        };
        self.present.insert(path.to_string());
        self.report
            .record(path, OperationKind::Download, Some(&source_name));

        holders.extend(
            self.fan_out(path, propagate, entries, &dest, entry.fingerprint)
                .await,
        );
        self.settle(path, entry.fingerprint, entry.size, holders);
    }

    /// Decrypts the blob behind `entry` into a new staging file.
    async fn fetch(&self, source: usize, entry: &IndexEntry) -> SyncResult<PathBuf> {
        let staged = self.env.tmp_dir.join(Uuid::new_v4().simple().to_string());
        let provider = self.remotes[source].provider.as_ref();
        let fetched: SyncResult<()> = async {
            let mut file = tokio::fs::File::create(&staged).await?;
            let digest = self
                .env
                .store
                .get_blob(provider, &entry.object_id, &mut file)
                .await?;
            file.sync_all().await?;
            if self.env.verify_downloads && digest.fingerprint != entry.fingerprint {
                return Err(fingerprint_mismatch());
            }
            Ok(())
        }
        .await;
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        Ok(staged)
    }

    /// Moves the local file to a side slot under the conflicts directory.
    async fn preserve(
        &mut self,
        path: &str,
        file: &LocalFile,
        winner: &IndexEntry,
        provider: &str,
    ) -> SyncResult<()> {
        let detected_at = now_millis();
        let slot_rel = format!("{path}.{detected_at}");
        let slot = local_path(&self.env.conflicts_dir, &slot_rel);
        if let Some(parent) = slot.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(local_path(self.env.root, path), &slot).await?;
        self.present.remove(path);

        let record = ConflictRecord {
            path: path.to_string(),
            preserved: format!("{STATE_DIR_NAME}/{CONFLICTS_DIR}/{slot_rel}"),
            local_fingerprint: file.fingerprint,
            remote_fingerprint: winner.fingerprint,
            provider: provider.to_string(),
            detected_at,
        };
        info!(path, preserved = %record.preserved, provider, "preserved conflicting local edit");
        self.report.record(path, OperationKind::Preserve, None);
        self.report.conflicts.push(record);
        Ok(())
    }

    async fn delete_remote(&mut self, path: &str, targets: &[usize], entries: &[Option<IndexEntry>]) {
        let results = join_all(targets.iter().map(|&t| {
            let provider = Arc::clone(&self.remotes[t].provider);
            let id = entries[t].as_ref().map(|e| e.object_id.clone());
            async move {
                let result = match id {
                    Some(id) => provider.delete(&id).await,
                    None => Ok(()),
                };
                (t, result)
            }
        }))
        .await;

        for (t, result) in results {
            let name = self.name(t);
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    self.fail(path, Some(&name), e);
                    continue;
                }
            }
            self.remotes[t].remove(path);
            if let Some(d) = self.descriptors.get_mut(path) {
                d.remotes.remove(&name);
            }
            self.report
                .record(path, OperationKind::DeleteRemote, Some(&name));
        }
    }

    /// Deletes the local copy. Returns false if it had to be kept.
    async fn delete_local(&mut self, path: &str, local: Option<&LocalFile>) -> bool {
        let Some(file) = local else {
            return true;
        };
        if !self.unchanged_since_scan(path, file).await {
            self.fail(path, None, changed_during_pass());
            return false;
        }
        let full = local_path(self.env.root, path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.fail(path, None, e);
                return false;
            }
        }
        prune_empty_dirs(self.env.root, &full).await;
        self.present.remove(path);
        self.report.record(path, OperationKind::DeleteLocal, None);
        true
    }

    /// Drops references to reachable providers that no longer hold `path`.
    fn forget_absent(&mut self, path: &str, entries: &[Option<IndexEntry>]) {
        let absent: Vec<String> = (0..self.remotes.len())
            .filter(|&i| entries[i].is_none())
            .map(|i| self.name(i))
            .collect();
        if let Some(d) = self.descriptors.get_mut(path) {
            for name in absent {
                d.remotes.remove(&name);
            }
        }
    }

    async fn unchanged_since_scan(&self, path: &str, file: &LocalFile) -> bool {
        let full = local_path(self.env.root, path);
        let hashed = tokio::task::spawn_blocking(move || hash_file(&full)).await;
        matches!(hashed, Ok(Ok((fingerprint, _))) if fingerprint == file.fingerprint)
    }

    /// Renames a staging file over `path` and returns where it landed.
    async fn place(&self, path: &str, staged: &Path) -> SyncResult<PathBuf> {
        let dest = local_path(self.env.root, path);
        let placed = async {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(staged, &dest).await
        }
        .await;
        if let Err(e) = placed {
            let _ = tokio::fs::remove_file(staged).await;
            return Err(e.into());
        }
        Ok(dest)
    }

    /// Writes every dirty remote index, rolling back descriptor references
    /// for providers whose index could not be written.
    pub(crate) async fn flush(&mut self) {
        let store = self.env.store;
        let results = join_all(
            self.remotes
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.changes.is_empty())
                .map(|(i, r)| async move { (i, write_index(store, r).await) }),
        )
        .await;

        for (i, result) in results {
            match result {
                Ok(revision) => {
                    debug!(
                        provider = self.remotes[i].name(),
                        revision,
                        changes = self.remotes[i].changes.len(),
                        "remote index written"
                    );
                    self.remotes[i].loaded_revision = revision;
                    self.remotes[i].changes.clear();
                }
                Err(e) => self.revert(i, &e),
            }
        }
    }

    fn revert(&mut self, i: usize, error: &StoreError) {
        let name = self.name(i);
        let changes = std::mem::take(&mut self.remotes[i].changes);
        let paths: BTreeSet<String> = changes.iter().map(|c| c.path().to_string()).collect();
        for path in paths {
            self.fail(&path, Some(&name), format!("index not updated: {error}"));
            let previous = self
                .original
                .get(&path)
                .and_then(|d| d.remote(&name))
                .cloned();
            let Some(d) = self.descriptors.get_mut(&path) else {
                continue;
            };
            match previous {
                Some(r) => d.remotes.insert(name.clone(), r),
                None => d.remotes.remove(&name),
            };
            // The descriptor must never claim content no remote holds.
            if !d.remotes.values().any(|r| r.fingerprint == d.fingerprint) {
                match self.original.get(&path) {
                    Some(o) => {
                        d.fingerprint = o.fingerprint;
                        d.size = o.size;
                    }
                    None => {
                        self.descriptors.remove(&path);
                    }
                }
            }
        }
    }

    /// Finishes the pass: drops descriptors of files gone everywhere and
    /// computes item states against the `configured` provider names.
    pub(crate) fn finish(mut self, configured: &[String]) -> PassOutcome {
        let present = &self.present;
        self.descriptors
            .retain(|path, d| !d.remotes.is_empty() || present.contains(path));

        let mut items = Vec::with_capacity(self.processed.len());
        for path in std::mem::take(&mut self.processed) {
            let item = self.item(&path, configured);
            items.push((path, item));
        }
        PassOutcome {
            descriptors: self.descriptors,
            report: self.report,
            items,
        }
    }

    fn item(&self, path: &str, configured: &[String]) -> Option<TrackedItem> {
        let present = self.present.contains(path);
        let failed = self.failed.contains(path);
        let descriptor = self.descriptors.get(path);
        if descriptor.is_none() && !present && !failed {
            return None;
        }
        let providers: Vec<String> = descriptor
            .map(|d| {
                d.remotes
                    .iter()
                    .filter(|(_, r)| r.fingerprint == d.fingerprint)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let state = if failed {
            if providers.is_empty() {
                ItemState::Error
            } else {
                ItemState::Partial
            }
        } else if !present {
            ItemState::DeletedLocally
        } else if descriptor.is_none() {
            ItemState::Unsynced
        } else if configured.iter().all(|name| providers.contains(name)) {
            ItemState::Synced
        } else {
            ItemState::Partial
        };

        Some(TrackedItem {
            path: path.to_string(),
            state,
            providers,
        })
    }
}
