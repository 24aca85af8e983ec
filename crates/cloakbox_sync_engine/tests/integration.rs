//! End-to-end reconciliation tests against in-memory remotes.

use cloakbox_provider::{MemoryProvider, ObjectId, Provider};
use cloakbox_store::{ContentKey, Fingerprint};
use cloakbox_sync_engine::{
    Engine, Health, ItemState, OperationKind, PassReport, SyncConfig, SyncError, STATE_DIR_NAME,
};
use futures::TryStreamExt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// One device: a local tree and an engine over shared remotes.
struct Client {
    dir: TempDir,
    engine: Engine,
}

impl Client {
    fn new(remotes: &[Arc<MemoryProvider>], key: &ContentKey) -> Self {
        let dir = TempDir::new().unwrap();
        let providers: Vec<Arc<dyn Provider>> = remotes
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn Provider>)
            .collect();
        let engine = Engine::open(SyncConfig::new(dir.path()), providers, key).unwrap();
        Self { dir, engine }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    fn state_of(&self, rel: &str) -> Option<ItemState> {
        self.engine
            .items()
            .into_iter()
            .find(|i| i.path == rel)
            .map(|i| i.state)
    }
}

fn remotes(names: &[&str]) -> Vec<Arc<MemoryProvider>> {
    names
        .iter()
        .map(|n| Arc::new(MemoryProvider::new(*n)))
        .collect()
}

async fn content_ids(provider: &MemoryProvider) -> Vec<ObjectId> {
    let ids: Vec<ObjectId> = provider.list().try_collect().await.unwrap();
    ids.into_iter().filter(|id| !id.is_reserved()).collect()
}

fn skipped_names(report: &PassReport) -> Vec<&str> {
    report
        .skipped_providers
        .iter()
        .map(|h| h.name.as_str())
        .collect()
}

#[tokio::test]
async fn first_pass_uploads_everywhere_then_idles() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "hello");
    a.write("docs/b.txt", "world");

    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Upload), 4);
    assert!(report.failures.is_empty());
    assert!(report.skipped_providers.is_empty());

    for remote in &remotes {
        let ids = content_ids(remote).await;
        assert_eq!(ids.len(), 2);
        for id in ids {
            let raw = remote.raw(&id).unwrap();
            assert!(!raw.windows(5).any(|w| w == b"hello" || w == b"world"));
        }
    }

    let items = a.engine.items();
    assert_eq!(items.len(), 2);
    for item in &items {
        assert_eq!(item.state, ItemState::Synced);
        assert_eq!(item.providers, vec!["nas".to_string(), "usb".to_string()]);
    }

    let mutations: Vec<u64> = remotes.iter().map(|r| r.mutation_count()).collect();
    let again = a.engine.reconcile().await.unwrap();
    assert!(again.is_clean(), "second pass did work: {:?}", again.operations);
    let after: Vec<u64> = remotes.iter().map(|r| r.mutation_count()).collect();
    assert_eq!(mutations, after, "idle pass rewrote remote objects");
}

#[tokio::test]
async fn second_client_sees_first_clients_files() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "hello");
    a.write("deep/er/c.txt", "nested");
    a.engine.reconcile().await.unwrap();

    let b = Client::new(&remotes, &key);
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Download), 2);
    assert_eq!(report.count(OperationKind::Upload), 0);
    assert_eq!(b.read("a.txt").as_deref(), Some("hello"));
    assert_eq!(b.read("deep/er/c.txt").as_deref(), Some("nested"));

    assert!(b.engine.reconcile().await.unwrap().is_clean());
    assert!(a.engine.reconcile().await.unwrap().is_clean());
    assert_ne!(a.engine.client_id(), b.engine.client_id());
}

#[tokio::test]
async fn local_edit_reaches_other_client() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "v1");
    a.engine.reconcile().await.unwrap();
    let b = Client::new(&remotes, &key);
    b.engine.reconcile().await.unwrap();

    a.write("a.txt", "v2");
    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Upload), 2);

    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Download), 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(b.read("a.txt").as_deref(), Some("v2"));
    assert_eq!(b.state_of("a.txt"), Some(ItemState::Synced));
}

#[tokio::test]
async fn conflict_preserves_local_edit() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &key);
    a.write("notes/todo.txt", "base");
    a.engine.reconcile().await.unwrap();
    let b = Client::new(&remotes, &key);
    b.engine.reconcile().await.unwrap();

    a.write("notes/todo.txt", "from a");
    a.engine.reconcile().await.unwrap();
    b.write("notes/todo.txt", "from b");
    let report = b.engine.reconcile().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.count(OperationKind::Preserve), 1);
    let record = &report.conflicts[0];
    assert_eq!(record.path, "notes/todo.txt");
    assert_eq!(record.provider, "usb");
    assert_eq!(record.local_fingerprint, Fingerprint::of(b"from b"));
    assert_eq!(record.remote_fingerprint, Fingerprint::of(b"from a"));
    assert!(record
        .preserved
        .starts_with(&format!("{STATE_DIR_NAME}/conflicts/notes/todo.txt.")));

    // Remote wins the canonical path; the local edit survives aside.
    assert_eq!(b.read("notes/todo.txt").as_deref(), Some("from a"));
    assert_eq!(b.read(&record.preserved).as_deref(), Some("from b"));
    assert_eq!(b.engine.conflicts(), vec![record.clone()]);

    assert!(b.engine.reconcile().await.unwrap().is_clean());
    assert!(a.engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn first_sight_disagreement_is_a_conflict() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "from a");
    a.engine.reconcile().await.unwrap();

    let b = Client::new(&remotes, &key);
    b.write("a.txt", "from b");
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(b.read("a.txt").as_deref(), Some("from a"));
}

#[tokio::test]
async fn deletion_propagates_both_ways() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    a.write("keep.txt", "keep");
    a.write("old/stuff/gone.txt", "bye");
    a.engine.reconcile().await.unwrap();
    let b = Client::new(&remotes, &key);
    b.engine.reconcile().await.unwrap();
    assert!(b.root().join("old/stuff/gone.txt").is_file());

    fs::remove_file(a.root().join("old/stuff/gone.txt")).unwrap();
    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::DeleteRemote), 2);
    for remote in &remotes {
        assert_eq!(content_ids(remote).await.len(), 1);
    }
    assert_eq!(a.state_of("old/stuff/gone.txt"), None);

    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::DeleteLocal), 1);
    assert!(!b.root().join("old").exists(), "empty folders left behind");
    assert_eq!(b.read("keep.txt").as_deref(), Some("keep"));

    assert!(a.engine.reconcile().await.unwrap().is_clean());
    assert!(b.engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn remote_edit_beats_local_delete() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "v1");
    a.engine.reconcile().await.unwrap();
    let b = Client::new(&remotes, &key);
    b.engine.reconcile().await.unwrap();

    a.write("a.txt", "v2");
    a.engine.reconcile().await.unwrap();
    fs::remove_file(b.root().join("a.txt")).unwrap();
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Download), 1);
    assert_eq!(b.read("a.txt").as_deref(), Some("v2"));
}

#[tokio::test]
async fn partial_fan_out_is_completed_next_pass() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "hello");

    remotes[1].set_offline(true);
    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(skipped_names(&report), vec!["nas"]);
    assert!(matches!(
        report.skipped_providers[0].health,
        Health::Unreachable { .. }
    ));
    assert_eq!(report.count(OperationKind::Upload), 1);
    assert_eq!(a.state_of("a.txt"), Some(ItemState::Partial));

    remotes[1].set_offline(false);
    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Upload), 1);
    assert_eq!(report.operations[0].provider.as_deref(), Some("nas"));
    assert_eq!(a.state_of("a.txt"), Some(ItemState::Synced));
    assert!(a.engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn emptied_remote_is_refilled_not_mirrored() {
    let key = ContentKey::generate();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "only copy").unwrap();
    let usb = Arc::new(MemoryProvider::new("usb"));

    let open = |nas: &Arc<MemoryProvider>| {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::clone(&usb) as Arc<dyn Provider>,
            Arc::clone(nas) as Arc<dyn Provider>,
        ];
        Engine::open(SyncConfig::new(dir.path()), providers, &key).unwrap()
    };

    let engine = open(&Arc::new(MemoryProvider::new("nas")));
    engine.reconcile().await.unwrap();
    let usb_objects = usb.object_count();
    drop(engine);

    // Same name, wiped storage: a new remote identity behind "nas".
    let nas = Arc::new(MemoryProvider::new("nas"));
    let engine = open(&nas);
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::DeleteLocal), 0);
    assert_eq!(report.count(OperationKind::DeleteRemote), 0);
    assert_eq!(report.count(OperationKind::Upload), 1);
    assert_eq!(report.operations[0].provider.as_deref(), Some("nas"));

    assert_eq!(
        fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "only copy"
    );
    assert_eq!(usb.object_count(), usb_objects);
    assert_eq!(content_ids(&nas).await.len(), 1);
    assert!(engine.reconcile().await.unwrap().is_clean());
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_folder_is_left_alone() {
    use std::os::unix::fs::PermissionsExt;

    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &key);
    a.write("locked/inner.txt", "kept");
    a.write("open.txt", "open");
    a.engine.reconcile().await.unwrap();

    let locked = a.root().join("locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // Permission bits do not bind this user.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }
    a.write("new.txt", "new");
    let report = a.engine.reconcile().await;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    let report = report.unwrap();

    assert_eq!(report.count(OperationKind::DeleteRemote), 0);
    assert_eq!(report.count(OperationKind::Upload), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "locked");
    assert_eq!(content_ids(&remotes[0]).await.len(), 3);
    assert_eq!(a.state_of("locked/inner.txt"), Some(ItemState::Synced));

    assert!(a.engine.reconcile().await.unwrap().is_clean());
    assert_eq!(a.read("locked/inner.txt").as_deref(), Some("kept"));
}

#[tokio::test]
async fn remote_only_file_is_fanned_out() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes[..1], &key);
    a.write("photo.jpg", "pixels");
    a.engine.reconcile().await.unwrap();

    let b = Client::new(&remotes, &key);
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Download), 1);
    assert_eq!(report.count(OperationKind::Upload), 1);
    assert_eq!(b.read("photo.jpg").as_deref(), Some("pixels"));
    assert_eq!(content_ids(&remotes[1]).await.len(), 1);
    assert!(b.engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn wrong_key_cannot_decrypt() {
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &ContentKey::generate());
    a.write("a.txt", "secret");
    a.engine.reconcile().await.unwrap();
    let objects = remotes[0].object_count();

    let b = Client::new(&remotes, &ContentKey::generate());
    b.write("b.txt", "other");
    let health = b.engine.connect().await;
    assert!(matches!(health[0].health, Health::CannotDecrypt { .. }));
    assert!(health[0].health.to_string().starts_with("cannot decrypt"));

    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(skipped_names(&report), vec!["usb"]);
    assert!(matches!(
        report.skipped_providers[0].health,
        Health::CannotDecrypt { .. }
    ));
    assert!(report.operations.is_empty());
    assert_eq!(remotes[0].object_count(), objects);
    assert_eq!(b.state_of("b.txt"), Some(ItemState::Unsynced));
}

#[tokio::test]
async fn unreachable_provider_reports_could_not_connect() {
    let remotes = remotes(&["usb"]);
    remotes[0].set_offline(true);
    let a = Client::new(&remotes, &ContentKey::generate());
    let health = a.engine.connect().await;
    assert_eq!(health[0].name, "usb");
    assert_eq!(health[0].kind, "memory");
    assert!(health[0].health.to_string().starts_with("could not connect"));
}

#[tokio::test]
async fn tampered_blob_is_a_failure_not_a_download() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &key);
    a.write("a.txt", "hello");
    a.engine.reconcile().await.unwrap();
    for id in content_ids(&remotes[0]).await {
        let mut raw = remotes[0].raw(&id).unwrap().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(remotes[0].tamper(&id, raw));
    }

    let b = Client::new(&remotes, &key);
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("cannot decrypt"));
    assert!(b.read("a.txt").is_none());
    assert_eq!(b.state_of("a.txt"), Some(ItemState::Error));
    let staging = b.root().join(STATE_DIR_NAME).join("tmp");
    assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
}

#[tokio::test]
async fn multi_chunk_file_crosses_clients() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb", "nas"]);
    let a = Client::new(&remotes, &key);
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(a.root().join("video.bin"), &content).unwrap();
    a.engine.reconcile().await.unwrap();

    let b = Client::new(&remotes, &key);
    let report = b.engine.reconcile().await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.count(OperationKind::Download), 1);
    assert_eq!(fs::read(b.root().join("video.bin")).unwrap(), content);
    assert_eq!(b.state_of("video.bin"), Some(ItemState::Synced));

    let edited: Vec<u8> = content.iter().rev().copied().collect();
    fs::write(b.root().join("video.bin"), &edited).unwrap();
    let report = b.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Upload), 2);
    a.engine.reconcile().await.unwrap();
    assert_eq!(fs::read(a.root().join("video.bin")).unwrap(), edited);
    assert_eq!(content_ids(&remotes[0]).await.len(), 1);
}

#[tokio::test]
async fn concurrent_pass_is_rejected() {
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &ContentKey::generate());
    a.write("a.txt", "hello");

    let (first, second) = tokio::join!(a.engine.reconcile(), a.engine.reconcile());
    let results = [first, second];
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(SyncError::PassInProgress)))
            .count(),
        1
    );
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[tokio::test]
async fn second_engine_on_same_tree_is_locked() {
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &ContentKey::generate());
    let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(MemoryProvider::new("usb"))];
    let err = Engine::open(SyncConfig::new(a.root()), providers, &ContentKey::generate())
        .unwrap_err();
    assert!(matches!(err, SyncError::Locked(_)));
}

#[tokio::test]
async fn state_survives_restart() {
    let key = ContentKey::generate();
    let remotes = remotes(&["usb"]);
    let dir = {
        let a = Client::new(&remotes, &key);
        a.write("a.txt", "hello");
        a.engine.reconcile().await.unwrap();
        a.dir
    };

    let providers: Vec<Arc<dyn Provider>> = vec![Arc::clone(&remotes[0]) as Arc<dyn Provider>];
    let engine = Engine::open(SyncConfig::new(dir.path()), providers, &key).unwrap();
    assert_eq!(engine.items().len(), 1);
    assert!(engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn cancelled_pass_returns_cancelled() {
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &ContentKey::generate());
    a.write("a.txt", "hello");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = a.engine.reconcile_cancellable(&cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(a.engine.state().can_start_pass());
    assert_eq!(a.engine.stats().passes_completed, 0);

    let report = a.engine.reconcile().await.unwrap();
    assert_eq!(report.count(OperationKind::Upload), 1);
}

#[tokio::test]
async fn search_file_uses_last_scan() {
    let remotes = remotes(&["usb"]);
    let a = Client::new(&remotes, &ContentKey::generate());
    a.write("x/report.txt", "one");
    a.write("y/report.txt", "two");
    assert_eq!(a.engine.scan().await.unwrap(), 2);

    let found = a.engine.search_file("y/report.txt").unwrap();
    assert_eq!(found.fingerprint, Fingerprint::of(b"two"));
    assert!(a.engine.search_file("report.txt").is_none());
    assert!(a.engine.search_file("z/report.txt").is_none());
}

#[tokio::test]
async fn open_rejects_bad_provider_sets() {
    let dir = TempDir::new().unwrap();
    let key = ContentKey::generate();
    let err = Engine::open(SyncConfig::new(dir.path()), Vec::new(), &key).unwrap_err();
    assert!(matches!(err, SyncError::NoProviders));

    let providers: Vec<Arc<dyn Provider>> = vec![
        Arc::new(MemoryProvider::new("usb")),
        Arc::new(MemoryProvider::new("usb")),
    ];
    let err = Engine::open(SyncConfig::new(dir.path()), providers, &key).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}
