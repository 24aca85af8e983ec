//! # Cloakbox Sync Engine
//!
//! Reconciliation of a local directory tree with several encrypted remotes.
//!
//! This crate provides:
//! - Local tree scanning and structural path search
//! - Per-file descriptors persisted in a locked state directory
//! - A pure per-file planner (local vs. descriptor vs. each remote)
//! - Concurrent fan-out of uploads, downloads and deletions
//! - Conflict preservation in side slots
//!
//! ## Architecture
//!
//! Every pass runs the same steps:
//! 1. Connect: initialize providers, open or bootstrap each remote
//! 2. Scan the local tree
//! 3. Plan and execute one action per path
//! 4. Write dirty remote indexes and persist descriptors
//!
//! ## Key Invariants
//!
//! - Remote content is only ever written encrypted
//! - A local edit is never discarded: losing a conflict moves it aside
//! - A descriptor never claims content that no remote holds
//! - Unreachable providers are skipped, never written to
//! - One pass at a time per engine, one engine per tree
//!
//! ## Example
//!
//! ```rust
//! use cloakbox_provider::{MemoryProvider, Provider};
//! use cloakbox_store::ContentKey;
//! use cloakbox_sync_engine::{Engine, SyncConfig};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let root = tempfile::tempdir().unwrap();
//! std::fs::write(root.path().join("notes.txt"), b"hello").unwrap();
//!
//! let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(MemoryProvider::new("usb"))];
//! let engine = Engine::open(SyncConfig::new(root.path()), providers, &ContentKey::generate()).unwrap();
//!
//! let report = engine.reconcile().await.unwrap();
//! assert_eq!(report.operations.len(), 1);
//! assert!(engine.reconcile().await.unwrap().is_clean());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod descriptor;
mod engine;
mod error;
mod pass;
mod planner;
mod state;
mod state_dir;
mod tree;

pub use config::{SyncConfig, STATE_DIR_NAME};
pub use descriptor::{ConflictRecord, Descriptor, RemoteRef};
pub use engine::Engine;
pub use error::{SyncError, SyncResult};
pub use planner::{plan, Action, FilePlan, ItemState, RemoteView};
pub use state::{
    EngineState, FileFailure, Health, Operation, OperationKind, PassReport, ProviderHealth,
    SyncStats, TrackedItem,
};
pub use state_dir::{PersistedState, StateDir, STATE_FORMAT_VERSION};
pub use tree::{
    hash_file, is_safe_rel_path, local_path, LocalFile, LocalTree, Node, NodeId, NodeKind,
    Unreadable,
};
