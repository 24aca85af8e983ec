//! The reconciliation engine.

use crate::config::SyncConfig;
use crate::descriptor::{ConflictRecord, Descriptor};
use crate::error::{SyncError, SyncResult};
use crate::pass::{load_index, Pass, PassEnv, Remote};
use crate::planner::ItemState;
use crate::state::{
    EngineState, Health, OperationKind, PassReport, ProviderHealth, SyncStats, TrackedItem,
};
use crate::state_dir::StateDir;
use crate::tree::{is_safe_rel_path, LocalFile, LocalTree};
use cloakbox_provider::{ObjectId, Provider, ProviderError, ReservedId};
use cloakbox_store::{ContentKey, ObjectStore, RemoteConfig, RemoteIndex, StoreError, StoreResult};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keeps one local tree in agreement with a set of encrypted remotes.
///
/// The engine owns the tree's state directory for its whole lifetime, so
/// at most one engine (in any process) works on a given tree. Within one
/// engine, passes are serialized: a second [`reconcile`](Self::reconcile)
/// while one runs fails with [`SyncError::PassInProgress`].
pub struct Engine {
    config: SyncConfig,
    providers: Vec<Arc<dyn Provider>>,
    store: ObjectStore,
    state_dir: Mutex<StateDir>,
    pass_lock: tokio::sync::Mutex<()>,
    tree: RwLock<LocalTree>,
    items: RwLock<BTreeMap<String, TrackedItem>>,
    state: RwLock<EngineState>,
    stats: RwLock<SyncStats>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.config.root)
            .field("providers", &self.provider_names())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens the engine for `config.root`.
    ///
    /// # Errors
    ///
    /// Returns `NoProviders` for an empty provider list, `Config` for an
    /// invalid root or duplicate provider names, `Locked` if another engine
    /// holds the tree, or `StateCorrupted` for an unreadable state file.
    pub fn open(
        config: SyncConfig,
        providers: Vec<Arc<dyn Provider>>,
        key: &ContentKey,
    ) -> SyncResult<Self> {
        config.validate()?;
        if providers.is_empty() {
            return Err(SyncError::NoProviders);
        }
        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.name()) {
                return Err(SyncError::config(format!(
                    "duplicate provider name: {}",
                    provider.name()
                )));
            }
        }

        let state_dir = StateDir::open(&config.state_dir())?;
        let configured: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();
        let items = state_dir
            .descriptors()
            .values()
            .map(|d| (d.path.clone(), remembered_item(d, &configured)))
            .collect();
        info!(
            root = %config.root.display(),
            providers = providers.len(),
            client_id = %state_dir.client_id(),
            "engine opened"
        );

        Ok(Self {
            store: ObjectStore::new(key),
            config,
            providers,
            state_dir: Mutex::new(state_dir),
            pass_lock: tokio::sync::Mutex::new(()),
            tree: RwLock::new(LocalTree::new()),
            items: RwLock::new(items),
            state: RwLock::new(EngineState::Idle),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Returns the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// This client's identity.
    pub fn client_id(&self) -> Uuid {
        self.state_dir.lock().client_id()
    }

    /// Names of the configured providers, in configuration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
    }

    /// Tracked items with their state after the last pass.
    pub fn items(&self) -> Vec<TrackedItem> {
        self.items.read().values().cloned().collect()
    }

    /// Conflicts recorded on this tree, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state_dir.lock().conflicts().to_vec()
    }

    /// Looks up `path` in the most recent scan of the local tree.
    pub fn search_file(&self, path: &str) -> Option<LocalFile> {
        let tree = self.tree.read();
        tree.search_file(path).and_then(|id| tree.file(id)).cloned()
    }

    /// Rescans the local tree and returns the number of files found.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the tree cannot be read.
    pub async fn scan(&self) -> SyncResult<usize> {
        let tree = self.scan_tree().await?;
        let count = tree.file_count();
        *self.tree.write() = tree;
        Ok(count)
    }

    async fn scan_tree(&self) -> SyncResult<LocalTree> {
        let root = self.config.root.clone();
        tokio::task::spawn_blocking(move || LocalTree::scan(&root))
            .await
            .map_err(|e| SyncError::Io(io::Error::other(e)))?
    }

    /// Initializes every provider and opens its remote.
    ///
    /// A remote without a manifest is bootstrapped with a fresh
    /// [`RemoteConfig`] and an empty index. Failures are reported per
    /// provider, never as an error.
    pub async fn connect(&self) -> Vec<ProviderHealth> {
        self.connect_with(&CancellationToken::new()).await
    }

    async fn connect_with(&self, cancel: &CancellationToken) -> Vec<ProviderHealth> {
        join_all(
            self.providers
                .iter()
                .map(|p| self.connect_one(p.as_ref(), cancel)),
        )
        .await
    }

    async fn connect_one(&self, provider: &dyn Provider, cancel: &CancellationToken) -> ProviderHealth {
        let health = match self.init_provider(provider, cancel).await {
            Err(reason) => Health::Unreachable { reason },
            Ok(()) => match self.open_remote(provider).await {
                Ok(config) => Health::Ready {
                    remote_id: config.remote_id,
                },
                Err(StoreError::Crypto(reason)) => Health::CannotDecrypt { reason },
                Err(e) => Health::Unreachable {
                    reason: e.to_string(),
                },
            },
        };
        match &health {
            Health::Ready { remote_id } => {
                debug!(provider = provider.name(), %remote_id, "provider ready");
            }
            other => warn!(provider = provider.name(), health = %other, "provider skipped"),
        }
        ProviderHealth {
            name: provider.name().to_string(),
            kind: provider.kind().to_string(),
            health,
        }
    }

    async fn init_provider(&self, provider: &dyn Provider, cancel: &CancellationToken) -> Result<(), String> {
        let status = provider.status();
        if status.is_ready() {
            return Ok(());
        }
        if status.is_error() {
            // Error is terminal until the provider is closed.
            if let Err(e) = provider.close().await {
                debug!(provider = provider.name(), error = %e, "close before retry failed");
            }
        }
        let status = provider
            .init_cancellable(self.config.retry_attempts, cancel)
            .await;
        if status.is_ready() {
            Ok(())
        } else {
            Err(format!("initialization ended in state {status}"))
        }
    }

    async fn open_remote(&self, provider: &dyn Provider) -> StoreResult<RemoteConfig> {
        let id = ObjectId::reserved(ReservedId::Config);
        match self.store.get_object::<RemoteConfig>(provider, &id).await {
            Ok(config) => {
                config.check_version()?;
                Ok(config)
            }
            Err(e) if e.is_not_found() => self.bootstrap(provider).await,
            Err(e) => Err(e),
        }
    }

    async fn bootstrap(&self, provider: &dyn Provider) -> StoreResult<RemoteConfig> {
        match self
            .store
            .create_object(provider, ReservedId::Index, &RemoteIndex::new())
            .await
        {
            Ok(()) | Err(StoreError::Provider(ProviderError::AlreadyExists { .. })) => {}
            Err(e) => return Err(e),
        }

        let config = RemoteConfig::new(provider.kind());
        match self
            .store
            .create_object(provider, ReservedId::Config, &config)
            .await
        {
            Ok(()) => {
                info!(provider = provider.name(), remote_id = %config.remote_id, "bootstrapped remote");
                Ok(config)
            }
            // Another client bootstrapped it first.
            Err(StoreError::Provider(ProviderError::AlreadyExists { .. })) => {
                let id = ObjectId::reserved(ReservedId::Config);
                let config: RemoteConfig = self.store.get_object(provider, &id).await?;
                config.check_version()?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Compares the remote behind `name` with the one seen last time.
    ///
    /// A different identity means the remote was wiped or re-pointed: what
    /// it used to hold is forgotten, so its files are re-uploaded instead of
    /// read as deleted.
    fn check_identity(&self, name: &str, remote_id: Uuid) {
        let mut state_dir = self.state_dir.lock();
        match state_dir.remote_id(name) {
            Some(known) if known == remote_id => return,
            Some(known) => {
                let dropped = state_dir.forget_remote(name);
                warn!(
                    provider = name,
                    previous = %known,
                    current = %remote_id,
                    dropped,
                    "remote identity changed, its files will be uploaded again"
                );
            }
            None => debug!(provider = name, %remote_id, "remembering remote identity"),
        }
        state_dir.set_remote_id(name, remote_id);
    }

    /// Runs one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns `PassInProgress` if a pass is already running, or an error
    /// that stopped the whole pass (local I/O, state persistence). Per-file
    /// problems are reported in [`PassReport::failures`] instead.
    pub async fn reconcile(&self) -> SyncResult<PassReport> {
        self.reconcile_cancellable(&CancellationToken::new()).await
    }

    /// Like [`reconcile`](Self::reconcile), but stops between files when
    /// `cancel` fires. Work finished before that point is kept.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fired, plus everything
    /// [`reconcile`](Self::reconcile) returns.
    pub async fn reconcile_cancellable(&self, cancel: &CancellationToken) -> SyncResult<PassReport> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            return Err(SyncError::PassInProgress);
        };
        let start = Instant::now();
        let result = self.run_pass(cancel, start).await;

        match &result {
            Ok(report) => {
                self.set_state(EngineState::Synced);
                let mut stats = self.stats.write();
                stats.passes_completed += 1;
                stats.uploads += report.count(OperationKind::Upload) as u64;
                stats.downloads += report.count(OperationKind::Download) as u64;
                stats.deletions += (report.count(OperationKind::DeleteLocal)
                    + report.count(OperationKind::DeleteRemote))
                    as u64;
                stats.conflicts_encountered += report.conflicts.len() as u64;
                stats.failures += report.failures.len() as u64;
                stats.last_pass_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    operations = report.operations.len(),
                    conflicts = report.conflicts.len(),
                    failures = report.failures.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "pass completed"
                );
            }
            Err(SyncError::Cancelled) => {
                self.set_state(EngineState::Idle);
                self.stats.write().last_error = Some(SyncError::Cancelled.to_string());
                info!("pass cancelled");
            }
            Err(e) => {
                self.set_state(EngineState::Error);
                self.stats.write().last_error = Some(e.to_string());
                warn!(error = %e, "pass failed");
            }
        }
        result
    }

    async fn run_pass(&self, cancel: &CancellationToken, start: Instant) -> SyncResult<PassReport> {
        self.set_state(EngineState::Connecting);
        let health = self.connect_with(cancel).await;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut report = PassReport::default();
        let mut ready = Vec::new();
        for (provider, h) in self.providers.iter().zip(health) {
            match h.health {
                Health::Ready { remote_id } => {
                    self.check_identity(provider.name(), remote_id);
                    ready.push(Arc::clone(provider));
                }
                _ => report.skipped_providers.push(h),
            }
        }
        let store = &self.store;
        let loaded = join_all(ready.into_iter().map(|provider| async move {
            let index = load_index(store, provider.as_ref()).await;
            (provider, index)
        }))
        .await;
        let mut remotes = Vec::new();
        for (provider, index) in loaded {
            match index {
                Ok(index) => remotes.push(Remote::new(provider, index)),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "cannot read remote index");
                    let health = match e {
                        StoreError::Crypto(reason) => Health::CannotDecrypt { reason },
                        e => Health::Unreachable {
                            reason: format!("cannot read index: {e}"),
                        },
                    };
                    report.skipped_providers.push(ProviderHealth {
                        name: provider.name().to_string(),
                        kind: provider.kind().to_string(),
                        health,
                    });
                }
            }
        }

        self.set_state(EngineState::Scanning);
        let tree = self.scan_tree().await?;

        self.set_state(EngineState::Reconciling);
        let (descriptors, env) = {
            let state_dir = self.state_dir.lock();
            let env = PassEnv {
                root: &self.config.root,
                tmp_dir: state_dir.tmp_dir(),
                conflicts_dir: state_dir.conflicts_dir(),
                store: &self.store,
                client_id: state_dir.client_id(),
                verify_downloads: self.config.verify_downloads,
            };
            (state_dir.descriptors().clone(), env)
        };
        let mut pass = Pass::new(env, remotes, descriptors, report);
        for u in tree.unreadable() {
            pass.fail(&u.path, None, format!("cannot read: {}", u.error));
        }

        let mut cancelled = false;
        for path in pass.paths(tree.files()) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if tree.is_unreadable(&path) {
                pass.keep(&path);
                continue;
            }
            if !is_safe_rel_path(&path) {
                pass.fail(&path, None, "unsafe path in remote index");
                continue;
            }
            let local = tree.search_file(&path).and_then(|id| tree.file(id));
            pass.reconcile_file(&path, local).await;
        }
        pass.flush().await;

        let outcome = pass.finish(&self.provider_names());
        {
            let mut state_dir = self.state_dir.lock();
            state_dir.set_descriptors(outcome.descriptors);
            state_dir.add_conflicts(outcome.report.conflicts.iter().cloned());
            state_dir.save()?;
        }
        {
            let mut items = self.items.write();
            if !cancelled {
                items.retain(|path, _| tree.is_unreadable(path));
            }
            for (path, item) in outcome.items {
                match item {
                    Some(item) => items.insert(path, item),
                    None => items.remove(&path),
                };
            }
        }
        *self.tree.write() = tree;

        if cancelled {
            return Err(SyncError::Cancelled);
        }
        let mut report = outcome.report;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Closes every provider.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; every provider is closed regardless.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let results = join_all(self.providers.iter().map(|p| p.close())).await;
        info!("engine shut down");
        results
            .into_iter()
            .collect::<Result<Vec<()>, ProviderError>>()
            .map(|_| ())
            .map_err(SyncError::from)
    }
}

/// Item state known before any pass, from the descriptor alone.
fn remembered_item(d: &Descriptor, configured: &[String]) -> TrackedItem {
    let providers: Vec<String> = d
        .remotes
        .iter()
        .filter(|(_, r)| r.fingerprint == d.fingerprint)
        .map(|(name, _)| name.clone())
        .collect();
    let state = if configured.iter().all(|name| providers.contains(name)) {
        ItemState::Synced
    } else {
        ItemState::Partial
    };
    TrackedItem {
        path: d.path.clone(),
        state,
        providers,
    }
}
