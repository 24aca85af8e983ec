//! # Cloakbox Store
//!
//! Client-side encryption for everything Cloakbox writes to a provider.
//!
//! This crate turns a [`cloakbox_provider::Provider`], which only moves
//! opaque bytes, into a store of typed, authenticated objects:
//!
//! - [`crypto`] derives keys from the passphrase and seals envelopes,
//!   including the chunked streaming envelope for file content
//! - [`ObjectStore`] serializes, encrypts and stores objects and blobs
//! - [`RemoteConfig`] and [`RemoteIndex`] are the manifests every remote
//!   carries at its reserved ids
//!
//! ## Example
//!
//! ```rust
//! use cloakbox_provider::{MemoryProvider, Provider};
//! use cloakbox_store::{ContentKey, ObjectStore};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let provider = MemoryProvider::new("scratch");
//! provider.init(1).await;
//!
//! let store = ObjectStore::new(&ContentKey::generate());
//! let id = store.put_object(&provider, &vec!["a", "b"], None).await.unwrap();
//! let back: Vec<String> = store.get_object(&provider, &id).await.unwrap();
//! assert_eq!(back, vec!["a", "b"]);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
mod error;
mod fingerprint;
mod remote;
mod store;

pub use crypto::{Cipher, ContentKey, KdfParams, MasterKey, Salt, SealedDigest};
pub use error::{StoreError, StoreResult};
pub use fingerprint::{BlobDigest, Fingerprint};
pub use remote::{now_millis, IndexEntry, RemoteConfig, RemoteIndex, REMOTE_FORMAT_VERSION};
pub use store::ObjectStore;
