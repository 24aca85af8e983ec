//! Error types for the object store.

use cloakbox_provider::ProviderError;
use thiserror::Error;

/// Result type for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while storing or loading encrypted objects.
///
/// The variants keep three failure families apart: the provider could not
/// serve the bytes, the bytes could not be authenticated under the current
/// key, or the authenticated plaintext could not be decoded.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The provider failed (not found, transport, not initialized).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Authentication or decryption failed: wrong key, truncated or tampered data.
    #[error("cannot decrypt: {0}")]
    Crypto(String),

    /// Serialization or deserialization of the plaintext failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Reading or writing blob content failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The passphrase could not be stretched into a key.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl StoreError {
    /// Creates a crypto error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a key derivation error.
    pub fn key_derivation(message: impl Into<String>) -> Self {
        Self::KeyDerivation(message.into())
    }

    /// Returns true if the object does not exist on the provider.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Provider(e) if e.is_not_found())
    }

    /// Returns true if the data could not be authenticated or decrypted.
    pub fn is_crypto(&self) -> bool {
        matches!(self, StoreError::Crypto(_))
    }

    /// Returns true if the provider's connection failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Provider(e) if e.is_transport())
    }
}
