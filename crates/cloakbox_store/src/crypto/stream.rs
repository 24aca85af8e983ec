//! Chunked AES-256-GCM envelope for file content.
//!
//! File content is sealed in fixed-size chunks so neither side ever holds a
//! whole file:
//!
//! ```text
//! +-------+---------+------------+----------------+-----+----------------+
//! | CLKB  | version | prefix(7)  | chunk 0 || tag | ... | last   || tag  |
//! +-------+---------+------------+----------------+-----+----------------+
//! ```
//!
//! Each chunk holds [`BLOB_CHUNK_SIZE`] plaintext bytes, except the last,
//! which holds the remainder (possibly nothing). Nonces follow the STREAM
//! construction: the random prefix, a big-endian chunk counter and a
//! last-chunk flag. Reordered, dropped or appended chunks therefore fail
//! authentication, and so does a blob cut at a chunk boundary. The twelve
//! header bytes are associated data of every chunk.

use super::envelope::{Cipher, HEADER_SIZE, MAGIC, TAG_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::{BlobDigest, Fingerprint};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::Payload;
use aes_gcm::Aes256Gcm;
use bytes::Bytes;
use cloakbox_provider::ByteStream;
use futures::stream;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use zeroize::Zeroizing;

/// Envelope version of chunked blobs.
pub const BLOB_FORMAT_VERSION: u8 = 2;
/// Plaintext bytes per chunk.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;
/// Size of the STREAM nonce prefix.
pub const NONCE_PREFIX_SIZE: usize = 7;
/// Size of the blob header: magic, version and nonce prefix.
pub const BLOB_HEADER_SIZE: usize = HEADER_SIZE + NONCE_PREFIX_SIZE;

const SEALED_CHUNK_SIZE: usize = BLOB_CHUNK_SIZE + TAG_SIZE;

/// Reads up to `len` bytes, stopping early only at end of input.
async fn read_chunk<R>(reader: &mut R, len: usize) -> io::Result<Zeroizing<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Zeroizing::new(vec![0u8; len]);
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Running SHA-256 and byte count over plaintext.
#[derive(Default)]
struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    fn finish(self) -> BlobDigest {
        BlobDigest {
            fingerprint: Fingerprint::from_digest(self.hasher.finalize().into()),
            size: self.size,
        }
    }
}

/// Where a sealing stream leaves the digest of what it consumed.
///
/// Empty until the stream has produced its last chunk.
#[derive(Debug, Clone, Default)]
pub struct SealedDigest(Arc<Mutex<Option<BlobDigest>>>);

impl SealedDigest {
    /// Returns the digest once the whole plaintext was sealed.
    #[must_use]
    pub fn get(&self) -> Option<BlobDigest> {
        *self.0.lock()
    }
}

struct Sealer<R> {
    reader: R,
    aad: [u8; BLOB_HEADER_SIZE],
    header_sent: bool,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    lookahead: Option<Zeroizing<Vec<u8>>>,
    digester: Digester,
    digest: SealedDigest,
}

impl<R: AsyncRead + Unpin> Sealer<R> {
    /// Produces the next piece of the sealed blob, `None` after the last.
    async fn next_piece(&mut self) -> io::Result<Option<Bytes>> {
        if !self.header_sent {
            self.header_sent = true;
            return Ok(Some(Bytes::copy_from_slice(&self.aad)));
        }
        let Some(mut encryptor) = self.encryptor.take() else {
            return Ok(None);
        };

        let current = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => read_chunk(&mut self.reader, BLOB_CHUNK_SIZE).await?,
        };
        let last = if current.len() < BLOB_CHUNK_SIZE {
            true
        } else {
            let next = read_chunk(&mut self.reader, BLOB_CHUNK_SIZE).await?;
            let end = next.is_empty();
            if !end {
                self.lookahead = Some(next);
            }
            end
        };

        self.digester.update(&current);
        let payload = Payload {
            msg: &current,
            aad: &self.aad,
        };
        let sealed = if last {
            let sealed = encryptor.encrypt_last(payload);
            let digester = std::mem::take(&mut self.digester);
            *self.digest.0.lock() = Some(digester.finish());
            sealed
        } else {
            let sealed = encryptor.encrypt_next(payload);
            self.encryptor = Some(encryptor);
            sealed
        };
        sealed
            .map(|chunk| Some(Bytes::from(chunk)))
            .map_err(|_| io::Error::other("encryption error"))
    }
}

impl Cipher {
    /// Seals `plaintext` chunk by chunk as it is read.
    ///
    /// Returns the sealed blob as a stream, plus a handle that yields the
    /// plaintext's fingerprint and size once the stream was read to its
    /// end. A read error on `plaintext` surfaces as an error of the stream.
    pub fn seal_stream<R>(&self, plaintext: R) -> (ByteStream, SealedDigest)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        let mut aad = [0u8; BLOB_HEADER_SIZE];
        aad[..4].copy_from_slice(MAGIC);
        aad[4] = BLOB_FORMAT_VERSION;
        aad[HEADER_SIZE..].copy_from_slice(&prefix);

        let digest = SealedDigest::default();
        let sealer = Sealer {
            reader: plaintext,
            aad,
            header_sent: false,
            encryptor: Some(EncryptorBE32::from_aead(
                self.cipher.clone(),
                GenericArray::from_slice(&prefix),
            )),
            lookahead: None,
            digester: Digester::default(),
            digest: digest.clone(),
        };

        let pieces = stream::try_unfold(sealer, |mut sealer| async move {
            let piece = sealer.next_piece().await?;
            Ok::<_, io::Error>(piece.map(|piece| (piece, sealer)))
        });
        (Box::pin(StreamReader::new(pieces)), digest)
    }

    /// Authenticates and decrypts a chunked blob from `sealed` into `out`.
    ///
    /// Plaintext is written chunk by chunk, each only after it has been
    /// authenticated. If an error is returned, what was already written
    /// must be discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] for a wrong key or a damaged blob,
    /// and [`StoreError::Io`] if reading or writing fails.
    pub async fn open_stream<R, W>(&self, mut sealed: R, out: &mut W) -> StoreResult<BlobDigest>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut aad = [0u8; BLOB_HEADER_SIZE];
        match sealed.read_exact(&mut aad).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(StoreError::crypto("blob too short"));
            }
            Err(e) => return Err(e.into()),
        }
        if &aad[..4] != MAGIC {
            return Err(StoreError::crypto("not a cloakbox object"));
        }
        if aad[4] != BLOB_FORMAT_VERSION {
            return Err(StoreError::crypto(format!(
                "unsupported blob version {}",
                aad[4]
            )));
        }

        let mut decryptor = DecryptorBE32::<Aes256Gcm>::from_aead(
            self.cipher.clone(),
            GenericArray::from_slice(&aad[HEADER_SIZE..]),
        );
        let mut digester = Digester::default();
        let mut current = read_chunk(&mut sealed, SEALED_CHUNK_SIZE).await?;
        loop {
            let next = if current.len() < SEALED_CHUNK_SIZE {
                None
            } else {
                Some(read_chunk(&mut sealed, SEALED_CHUNK_SIZE).await?).filter(|n| !n.is_empty())
            };
            let payload = Payload {
                msg: &current,
                aad: &aad,
            };
            let Some(next) = next else {
                let plain = Zeroizing::new(
                    decryptor
                        .decrypt_last(payload)
                        .map_err(|_| StoreError::crypto("authentication failed"))?,
                );
                out.write_all(&plain).await?;
                digester.update(&plain);
                break;
            };
            let plain = Zeroizing::new(
                decryptor
                    .decrypt_next(payload)
                    .map_err(|_| StoreError::crypto("authentication failed"))?,
            );
            out.write_all(&plain).await?;
            digester.update(&plain);
            current = next;
        }
        out.flush().await?;
        Ok(digester.finish())
    }
}
