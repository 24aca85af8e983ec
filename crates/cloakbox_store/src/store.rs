//! Encrypted object store over any provider.

use crate::crypto::{Cipher, ContentKey, SealedDigest};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::BlobDigest;
use cloakbox_provider::{read_to_vec, stream_from_bytes, ObjectId, Provider, ReservedId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;
use zeroize::Zeroizing;

/// Typed and raw access to encrypted objects.
///
/// The store holds only the content key. It never caches plaintext, and
/// every plaintext buffer it allocates is wiped when dropped. The provider
/// is passed per call, so one store serves every remote.
///
/// Objects are encoded as CBOR and sealed in one piece. Blobs (file
/// content) are streamed through the chunked envelope and never buffered
/// whole.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    cipher: Arc<Cipher>,
}

impl ObjectStore {
    /// Creates a store that seals objects under `key`.
    #[must_use]
    pub fn new(key: &ContentKey) -> Self {
        Self {
            cipher: Arc::new(Cipher::new(key)),
        }
    }

    fn encode<T: Serialize + ?Sized>(object: &T) -> StoreResult<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(Vec::new());
        ciborium::into_writer(object, &mut *buf).map_err(|e| StoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(plaintext: &[u8]) -> StoreResult<T> {
        ciborium::from_reader(plaintext).map_err(|e| StoreError::codec(e.to_string()))
    }

    async fn fetch(&self, provider: &dyn Provider, id: &ObjectId) -> StoreResult<Zeroizing<Vec<u8>>> {
        let sealed = read_to_vec(provider.get(id).await?).await?;
        trace!(provider = provider.name(), %id, bytes = sealed.len(), "fetched object");
        self.cipher.open(&sealed)
    }

    /// Serializes, encrypts and stores `object`.
    ///
    /// With `id`, the existing object is replaced in place; without, a new
    /// object is posted. Returns the object's id either way.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the object cannot be serialized, or `Provider`
    /// if the write fails (`NotFound` when `id` does not exist).
    pub async fn put_object<T>(
        &self,
        provider: &dyn Provider,
        object: &T,
        id: Option<&ObjectId>,
    ) -> StoreResult<ObjectId>
    where
        T: Serialize + Sync + ?Sized,
    {
        let sealed = {
            let plaintext = Self::encode(object)?;
            self.cipher.seal(&plaintext)?
        };
        self.store_sealed(provider, sealed, id).await
    }

    /// Loads, decrypts and deserializes the object at `id`.
    ///
    /// # Errors
    ///
    /// Returns `Provider` if the object cannot be read, `Crypto` if it
    /// does not authenticate under this key, or `Codec` if the plaintext
    /// is not a `T`.
    pub async fn get_object<T: DeserializeOwned>(
        &self,
        provider: &dyn Provider,
        id: &ObjectId,
    ) -> StoreResult<T> {
        let plaintext = self.fetch(provider, id).await?;
        Self::decode(&plaintext)
    }

    /// Stores `object` at a reserved id, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Provider(AlreadyExists)` if the reserved object is present.
    pub async fn create_object<T>(
        &self,
        provider: &dyn Provider,
        reserved: ReservedId,
        object: &T,
    ) -> StoreResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let sealed = {
            let plaintext = Self::encode(object)?;
            self.cipher.seal(&plaintext)?
        };
        provider
            .create(&ObjectId::reserved(reserved), stream_from_bytes(sealed))
            .await?;
        Ok(())
    }

    /// Encrypts `content` chunk by chunk and posts it as a new object.
    ///
    /// Returns the new id and the digest of the plaintext actually read,
    /// which callers compare with what they expected to upload.
    ///
    /// # Errors
    ///
    /// Returns `Provider` if the upload fails, including when reading
    /// `content` fails midway.
    pub async fn post_blob<R>(
        &self,
        provider: &dyn Provider,
        content: R,
    ) -> StoreResult<(ObjectId, BlobDigest)>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (sealed, digest) = self.cipher.seal_stream(content);
        let id = provider.post(sealed).await?;
        let digest = Self::sealed_digest(&digest)?;
        trace!(provider = provider.name(), %id, bytes = digest.size, "posted blob");
        Ok((id, digest))
    }

    /// Encrypts `content` chunk by chunk and replaces the object at `id`.
    ///
    /// # Errors
    ///
    /// Returns `Provider(NotFound)` if `id` does not exist.
    pub async fn put_blob<R>(
        &self,
        provider: &dyn Provider,
        id: &ObjectId,
        content: R,
    ) -> StoreResult<BlobDigest>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (sealed, digest) = self.cipher.seal_stream(content);
        provider.put(id, sealed).await?;
        let digest = Self::sealed_digest(&digest)?;
        trace!(provider = provider.name(), %id, bytes = digest.size, "replaced blob");
        Ok(digest)
    }

    fn sealed_digest(digest: &SealedDigest) -> StoreResult<BlobDigest> {
        digest.get().ok_or_else(|| {
            StoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "provider stopped reading before the end of the content",
            ))
        })
    }

    /// Downloads, authenticates and decrypts a blob into `out`.
    ///
    /// Returns the digest of the plaintext written. On error, `out` may
    /// hold a prefix of the content and must be discarded.
    ///
    /// # Errors
    ///
    /// Returns `Provider` or `Crypto` as for [`get_object`](Self::get_object),
    /// or `Io` if writing to `out` fails.
    pub async fn get_blob<W>(
        &self,
        provider: &dyn Provider,
        id: &ObjectId,
        out: &mut W,
    ) -> StoreResult<BlobDigest>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let sealed = provider.get(id).await?;
        let digest = self.cipher.open_stream(sealed, out).await?;
        trace!(provider = provider.name(), %id, bytes = digest.size, "fetched blob");
        Ok(digest)
    }

    async fn store_sealed(
        &self,
        provider: &dyn Provider,
        sealed: Vec<u8>,
        id: Option<&ObjectId>,
    ) -> StoreResult<ObjectId> {
        let bytes = sealed.len();
        let id = match id {
            Some(id) => {
                provider.put(id, stream_from_bytes(sealed)).await?;
                id.clone()
            }
            None => provider.post(stream_from_bytes(sealed)).await?,
        };
        trace!(provider = provider.name(), %id, bytes, "stored object");
        Ok(id)
    }
}
