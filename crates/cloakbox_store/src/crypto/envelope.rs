//! AES-256-GCM envelope for manifests and other small objects.
//!
//! File content uses the chunked format in [`super::stream`]. Sealed
//! objects are self-describing:
//!
//! ```text
//! +-------+---------+-----------+---------------------+
//! | CLKB  | version | nonce(12) | ciphertext || tag   |
//! +-------+---------+-----------+---------------------+
//! ```
//!
//! The five header bytes are bound as associated data, so a blob with an
//! altered header fails authentication just like altered ciphertext.

use super::key::ContentKey;
use crate::error::{StoreError, StoreResult};
use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

/// Leading bytes of every sealed object.
pub const MAGIC: &[u8; 4] = b"CLKB";
/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 1;
/// Size of the magic and version header.
pub const HEADER_SIZE: usize = 5;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Bytes added to every plaintext.
pub const OVERHEAD: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

fn header() -> [u8; HEADER_SIZE] {
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], FORMAT_VERSION]
}

/// Seals and opens envelopes under one content key.
pub struct Cipher {
    pub(super) cipher: Aes256Gcm,
}

impl Cipher {
    /// Creates a cipher for `key`.
    #[must_use]
    pub fn new(key: &ContentKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let header = header();
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| StoreError::crypto("encryption error"))?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&header);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Authenticates and decrypts an envelope produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] for a wrong key, a truncated or
    /// tampered envelope, or an unknown format.
    pub fn open(&self, sealed: &[u8]) -> StoreResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < OVERHEAD {
            return Err(StoreError::crypto(format!(
                "envelope too short ({} bytes)",
                sealed.len()
            )));
        }
        let (header, rest) = sealed.split_at(HEADER_SIZE);
        if &header[..4] != MAGIC {
            return Err(StoreError::crypto("not a cloakbox object"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(StoreError::crypto(format!(
                "unsupported envelope version {}",
                header[4]
            )));
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| StoreError::crypto("authentication failed"))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_and_overhead() {
        let cipher = Cipher::new(&ContentKey::generate());
        let sealed = cipher.seal(b"hello").unwrap();
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(sealed[4], FORMAT_VERSION);
        assert_eq!(sealed.len(), 5 + OVERHEAD);
        assert_eq!(&cipher.open(&sealed).unwrap()[..], b"hello");
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = Cipher::new(&ContentKey::generate());
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = Cipher::new(&ContentKey::generate()).seal(b"secret").unwrap();
        let err = Cipher::new(&ContentKey::generate()).open(&sealed).unwrap_err();
        assert!(err.is_crypto());
    }

    #[test]
    fn header_is_authenticated() {
        let cipher = Cipher::new(&ContentKey::generate());
        let mut sealed = cipher.seal(b"secret").unwrap();
        sealed[0] = b'X';
        assert!(cipher.open(&sealed).unwrap_err().is_crypto());

        let mut sealed = cipher.seal(b"secret").unwrap();
        sealed[4] = 9;
        assert!(cipher.open(&sealed).unwrap_err().is_crypto());
    }

    #[test]
    fn truncated_fails() {
        let cipher = Cipher::new(&ContentKey::generate());
        let sealed = cipher.seal(b"").unwrap();
        assert_eq!(sealed.len(), OVERHEAD);
        assert!(cipher.open(&sealed[..OVERHEAD - 1]).is_err());
        assert!(cipher.open(&[]).is_err());
    }

    proptest! {
        #[test]
        fn any_single_bit_flip_is_detected(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let cipher = Cipher::new(&ContentKey::from_bytes(&[3u8; 32]).unwrap());
            let mut sealed = cipher.seal(&data).unwrap();
            let i = position.index(sealed.len());
            sealed[i] ^= 1 << bit;
            prop_assert!(cipher.open(&sealed).unwrap_err().is_crypto());
        }
    }
}
