//! Cryptographic primitives for Cloakbox.
//!
//! ## Security Model
//!
//! - The passphrase is stretched with Argon2id into a [`MasterKey`]
//! - The [`ContentKey`] is derived from it with HKDF-SHA256
//! - Every object is sealed with AES-256-GCM under a fresh random nonce
//! - File content is sealed in 64 KiB chunks (STREAM nonces), so it is
//!   never held in memory whole
//! - Keys are zeroized on drop and redacted from `Debug`

mod envelope;
mod key;
mod stream;

pub use envelope::{Cipher, FORMAT_VERSION, HEADER_SIZE, MAGIC, NONCE_SIZE, OVERHEAD, TAG_SIZE};
pub use stream::{
    SealedDigest, BLOB_CHUNK_SIZE, BLOB_FORMAT_VERSION, BLOB_HEADER_SIZE, NONCE_PREFIX_SIZE,
};
pub use key::{ContentKey, KdfParams, MasterKey, Salt, KEY_SIZE, SALT_SIZE};
