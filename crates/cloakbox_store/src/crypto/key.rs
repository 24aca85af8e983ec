//! Key material: passphrase stretching and content key derivation.

use crate::error::{StoreError, StoreResult};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the key-derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

/// HKDF info label for the content key.
const CONTENT_KEY_INFO: &[u8] = b"cloakbox-content-key-v1";

/// Random salt for passphrase stretching.
///
/// The salt is not secret. It is kept in the local configuration and must be
/// identical on every client that shares the same remotes. Its text form is
/// lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a fresh random salt.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw salt bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw salt bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

impl fmt::Display for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({self})")
    }
}

impl FromStr for Salt {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != SALT_SIZE * 2 || !s.is_ascii() {
            return Err(StoreError::key_derivation(format!(
                "salt must be {} hex characters",
                SALT_SIZE * 2
            )));
        }
        let mut bytes = [0u8; SALT_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| StoreError::key_derivation(format!("invalid hex in salt: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Salt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Argon2id cost parameters.
///
/// Every client sharing a set of remotes must use the same parameters, so
/// they are part of the local configuration alongside the [`Salt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Creates custom parameters.
    #[must_use]
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, 4 lanes.
    fn default() -> Self {
        Self::new(64 * 1024, 3, 4)
    }
}

/// Key stretched from the user's passphrase.
///
/// Never used to encrypt directly; see [`ContentKey::from_master`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Stretches `passphrase` with Argon2id.
    ///
    /// The caller should wipe its passphrase buffer once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyDerivation`] if the parameters are rejected.
    pub fn derive(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> StoreResult<Self> {
        let argon_params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| StoreError::key_derivation(format!("invalid argon2 parameters: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase, salt.as_bytes(), &mut bytes)
            .map_err(|e| StoreError::key_derivation(e.to_string()))?;
        Ok(Self { bytes })
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM key used for every encrypted object.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    /// Derives the content key from a master key using HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyDerivation`] if HKDF expansion fails.
    pub fn from_master(master: &MasterKey) -> StoreResult<Self> {
        let hk = Hkdf::<Sha256>::new(None, &master.bytes);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(CONTENT_KEY_INFO, &mut bytes)
            .map_err(|_| StoreError::key_derivation("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Stretches `passphrase` and derives the content key in one step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyDerivation`] on failure.
    pub fn from_passphrase(
        passphrase: &[u8],
        salt: &Salt,
        params: &KdfParams,
    ) -> StoreResult<Self> {
        let master = MasterKey::derive(passphrase, salt, params)?;
        Self::from_master(&master)
    }

    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            StoreError::key_derivation(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the key bytes.
    ///
    /// # Security
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters; the defaults take seconds in debug builds.
    fn fast() -> KdfParams {
        KdfParams::new(1024, 1, 1)
    }

    #[test]
    fn salt_hex_roundtrip() {
        let salt = Salt::generate();
        let text = salt.to_string();
        assert_eq!(text.len(), SALT_SIZE * 2);
        assert_eq!(text.parse::<Salt>().unwrap(), salt);

        assert!("abc".parse::<Salt>().is_err());
        assert!("zz".repeat(SALT_SIZE).parse::<Salt>().is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = Salt::from_bytes([7u8; SALT_SIZE]);
        let a = ContentKey::from_passphrase(b"correct horse", &salt, &fast()).unwrap();
        let b = ContentKey::from_passphrase(b"correct horse", &salt, &fast()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let other_pass = ContentKey::from_passphrase(b"battery staple", &salt, &fast()).unwrap();
        assert_ne!(a.as_bytes(), other_pass.as_bytes());

        let other_salt = Salt::from_bytes([8u8; SALT_SIZE]);
        let other = ContentKey::from_passphrase(b"correct horse", &other_salt, &fast()).unwrap();
        assert_ne!(a.as_bytes(), other.as_bytes());
    }

    #[test]
    fn content_key_differs_from_master() {
        let salt = Salt::generate();
        let master = MasterKey::derive(b"pw", &salt, &fast()).unwrap();
        let content = ContentKey::from_master(&master).unwrap();
        assert_ne!(&master.bytes, content.as_bytes());
    }

    #[test]
    fn rejects_bad_params() {
        let err = MasterKey::derive(b"pw", &Salt::generate(), &KdfParams::new(1, 1, 1)).unwrap_err();
        assert!(matches!(err, StoreError::KeyDerivation(_)));
    }

    #[test]
    fn keys_are_redacted() {
        let key = ContentKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
        assert!(ContentKey::from_bytes(&[0u8; 16]).is_err());
    }
}
