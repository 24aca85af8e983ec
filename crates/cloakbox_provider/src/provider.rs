//! Provider trait definition.

use crate::error::ProviderResult;
use crate::id::ObjectId;
use crate::status::ProviderStatus;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io::Cursor;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Size of the buffer used to move content between a stream and a backend.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Readable object content.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Lazy, finite sequence of object ids.
pub type IdStream<'a> = BoxStream<'a, ProviderResult<ObjectId>>;

/// A remote endpoint exposing CRUD over an opaque key space.
///
/// Providers store **opaque bytes**. Encryption, framing and the meaning of
/// objects belong to the layers above; a provider never inspects content.
///
/// # Invariants
///
/// - CRUD before a successful `init` fails with `NotInitialized`
/// - `post` assigns a fresh id; a retried `post` yields a new id
/// - `post` and `put` never expose partially written content to `get`
/// - `put` keeps the id; a concurrent `get` sees old or new content in full
/// - `get` after `delete` fails with `NotFound`
///
/// # Implementors
///
/// - [`crate::MemoryProvider`] - For testing
/// - [`crate::LocalProvider`] - Files under a storage root
/// - [`crate::FtpProvider`] - A pooled FTP connection
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name, unique within one engine.
    fn name(&self) -> &str;

    /// Backend kind (`"local"`, `"ftp"`, `"memory"`).
    fn kind(&self) -> &'static str;

    /// Current lifecycle status.
    fn status(&self) -> ProviderStatus;

    /// Initializes the provider, making up to `retry_attempts` sequential
    /// attempts. Failure is reported through the returned status.
    async fn init(&self, retry_attempts: u32) -> ProviderStatus {
        self.init_cancellable(retry_attempts, &CancellationToken::new())
            .await
    }

    /// Like [`init`](Self::init), but stops early when `cancel` fires.
    ///
    /// A cancelled init releases any partially opened connection and leaves
    /// the provider `Uninitialized`.
    async fn init_cancellable(
        &self,
        retry_attempts: u32,
        cancel: &CancellationToken,
    ) -> ProviderStatus;

    /// Stores new content and returns its freshly assigned id.
    ///
    /// # Errors
    ///
    /// Returns a transport or I/O error if the write is interrupted.
    async fn post(&self, content: ByteStream) -> ProviderResult<ObjectId>;

    /// Opens the content stored at `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    async fn get(&self, id: &ObjectId) -> ProviderResult<ByteStream>;

    /// Replaces the content stored at an existing `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    async fn put(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()>;

    /// Removes the object at `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    async fn delete(&self, id: &ObjectId) -> ProviderResult<()>;

    /// Stores content at a reserved id chosen by the caller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` for non-reserved ids and `AlreadyExists` if the
    /// object is present.
    async fn create(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()>;

    /// Enumerates the ids of all committed objects, reserved ids included.
    fn list(&self) -> IdStream<'_>;

    /// Releases the connection and returns to `Uninitialized`.
    async fn close(&self) -> ProviderResult<()>;
}

/// Wraps in-memory bytes as a [`ByteStream`].
pub fn stream_from_bytes(bytes: impl Into<Bytes>) -> ByteStream {
    Box::pin(Cursor::new(bytes.into()))
}

/// Reads a stream to its end.
///
/// # Errors
///
/// Returns an I/O error if reading fails.
pub async fn read_to_vec(mut stream: ByteStream) -> ProviderResult<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_stream_roundtrip() {
        let data = vec![7u8; CHUNK_SIZE + 3];
        let stream = stream_from_bytes(data.clone());
        assert_eq!(read_to_vec(stream).await.unwrap(), data);
    }

    #[tokio::test]
    async fn empty_stream() {
        let stream = stream_from_bytes(Vec::new());
        assert!(read_to_vec(stream).await.unwrap().is_empty());
    }
}
