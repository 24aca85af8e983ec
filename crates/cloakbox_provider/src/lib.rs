//! # Cloakbox Provider
//!
//! The provider contract and the storage backends Cloakbox synchronizes to.
//!
//! A provider is an **opaque object store** reached through one connection:
//! it assigns ids, streams bytes in and out, and never interprets what it
//! stores. Encryption and the meaning of objects live in `cloakbox_store`.
//!
//! ## Lifecycle
//!
//! Every provider starts `Uninitialized`. [`Provider::init`] makes a bounded
//! number of sequential attempts and reports the outcome as a
//! [`ProviderStatus`]; CRUD before `Initialized` fails fast.
//!
//! ## Available Providers
//!
//! - [`MemoryProvider`] - For testing and fault injection
//! - [`LocalProvider`] - Files under a storage root (USB disk, NAS mount)
//! - [`FtpProvider`] - A folder on an FTP account
//!
//! ## Example
//!
//! ```rust
//! use cloakbox_provider::{read_to_vec, stream_from_bytes, MemoryProvider, Provider};
//!
//! # tokio_test_block(async {
//! let provider = MemoryProvider::new("scratch");
//! provider.init(1).await;
//!
//! let id = provider.post(stream_from_bytes(&b"hello world"[..])).await.unwrap();
//! let data = read_to_vec(provider.get(&id).await.unwrap()).await.unwrap();
//! assert_eq!(&data, b"hello world");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod credentials;
mod error;
mod ftp;
mod id;
mod local;
mod memory;
mod provider;
mod status;

pub use credentials::Password;
pub use error::{ProviderError, ProviderResult};
pub use ftp::{
    FtpConfig, FtpConnector, FtpProvider, FtpSession, MemoryFtpServer, SuppaFtpConnector,
    DEFAULT_PORT,
};
pub use id::{ObjectId, ReservedId};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{read_to_vec, stream_from_bytes, ByteStream, IdStream, Provider, CHUNK_SIZE};
pub use status::{run_init, InitGuard, InitStart, ProviderStatus, StatusCell};
