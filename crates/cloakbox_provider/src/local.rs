//! Local filesystem provider.

use crate::error::{ProviderError, ProviderResult};
use crate::id::ObjectId;
use crate::provider::{ByteStream, IdStream, Provider, CHUNK_SIZE};
use crate::status::{run_init, ProviderStatus, StatusCell};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Directory (inside the storage root) where writes are staged.
const STAGING_DIR: &str = ".staging";

/// A provider that stores objects as files under a private storage root.
///
/// Object files are named by their generated id, never by the original
/// path of the content, so unrelated content cannot clash.
///
/// # Durability
///
/// Every write is streamed into a staging file, synced with
/// `File::sync_all()`, then renamed into place. A reader therefore sees
/// either the previous content or the new content, never a partial file.
///
/// # Example
///
/// ```no_run
/// use cloakbox_provider::{LocalProvider, Provider, stream_from_bytes};
///
/// # async fn demo() -> cloakbox_provider::ProviderResult<()> {
/// let provider = LocalProvider::new("backup-disk", "/mnt/usb/cloakbox");
/// provider.init(1).await;
/// let id = provider.post(stream_from_bytes(&b"ciphertext"[..])).await?;
/// provider.delete(&id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    status: StatusCell,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`. Nothing touches the disk until `init`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            status: StatusCell::new(),
        }
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    async fn prepare_root(&self) -> ProviderResult<()> {
        fs::create_dir_all(&self.root).await?;
        if !fs::metadata(&self.root).await?.is_dir() {
            return Err(ProviderError::InvalidConfig(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }

        // Leftovers from interrupted writes are never reachable; drop them.
        let staging = self.staging_dir();
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;
        Ok(())
    }

    /// Streams `content` into a synced staging file and returns its path.
    async fn stage(&self, content: ByteStream) -> ProviderResult<PathBuf> {
        let path = self
            .staging_dir()
            .join(uuid::Uuid::new_v4().simple().to_string());

        match Self::write_file(&path, content).await {
            Ok(bytes) => {
                debug!(provider = %self.name, bytes, "staged object");
                Ok(path)
            }
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                Err(e.into())
            }
        }
    }

    async fn write_file(path: &Path, content: ByteStream) -> io::Result<u64> {
        let mut file = File::create(path).await?;
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, content);
        let written = tokio::io::copy_buf(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn commit(&self, staged: &Path, id: &ObjectId) -> ProviderResult<()> {
        if let Err(e) = fs::rename(staged, self.object_path(id)).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn exists(&self, id: &ObjectId) -> ProviderResult<bool> {
        Ok(fs::try_exists(self.object_path(id)).await?)
    }
}

fn map_not_found(err: io::Error, id: &ObjectId) -> ProviderError {
    if err.kind() == io::ErrorKind::NotFound {
        ProviderError::not_found(id)
    } else {
        ProviderError::Io(err)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn status(&self) -> ProviderStatus {
        self.status.get()
    }

    async fn init_cancellable(
        &self,
        retry_attempts: u32,
        cancel: &CancellationToken,
    ) -> ProviderStatus {
        run_init(&self.status, &self.name, retry_attempts, cancel, || {
            self.prepare_root()
        })
        .await
    }

    async fn post(&self, content: ByteStream) -> ProviderResult<ObjectId> {
        self.status.require_ready()?;
        let staged = self.stage(content).await?;
        let id = ObjectId::generate();
        self.commit(&staged, &id).await?;
        Ok(id)
    }

    async fn get(&self, id: &ObjectId) -> ProviderResult<ByteStream> {
        self.status.require_ready()?;
        let file = File::open(self.object_path(id))
            .await
            .map_err(|e| map_not_found(e, id))?;
        Ok(Box::pin(file))
    }

    async fn put(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        self.status.require_ready()?;
        if !self.exists(id).await? {
            return Err(ProviderError::not_found(id));
        }
        let staged = self.stage(content).await?;
        self.commit(&staged, id).await
    }

    async fn delete(&self, id: &ObjectId) -> ProviderResult<()> {
        self.status.require_ready()?;
        fs::remove_file(self.object_path(id))
            .await
            .map_err(|e| map_not_found(e, id))
    }

    async fn create(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        self.status.require_ready()?;
        if !id.is_reserved() {
            return Err(ProviderError::InvalidId(format!(
                "{id} is not a reserved id"
            )));
        }
        if self.exists(id).await? {
            return Err(ProviderError::AlreadyExists { id: id.to_string() });
        }
        let staged = self.stage(content).await?;
        self.commit(&staged, id).await
    }

    fn list(&self) -> IdStream<'_> {
        if let Err(e) = self.status.require_ready() {
            return Box::pin(stream::iter(vec![Err(e)]));
        }

        let root = self.root.clone();
        let entries = stream::once(async move { fs::read_dir(root).await });
        Box::pin(entries.flat_map(|dir| match dir {
            Ok(dir) => stream::unfold(dir, |mut dir| async move {
                loop {
                    match dir.next_entry().await {
                        Ok(Some(entry)) => {
                            let name = entry.file_name();
                            // Staging files and foreign entries are not objects.
                            if let Some(id) = name.to_str().and_then(|n| ObjectId::parse(n).ok())
                            {
                                return Some((Ok(id), dir));
                            }
                        }
                        Ok(None) => return None,
                        Err(e) => return Some((Err(ProviderError::Io(e)), dir)),
                    }
                }
            })
            .boxed(),
            Err(e) => stream::iter(vec![Err(ProviderError::Io(e))]).boxed(),
        }))
    }

    async fn close(&self) -> ProviderResult<()> {
        self.status.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{read_to_vec, stream_from_bytes};
    use futures::TryStreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("nested").join("store");

        let provider = LocalProvider::new("local", &root);
        assert_eq!(provider.status(), ProviderStatus::Uninitialized);
        assert_eq!(provider.init(1).await, ProviderStatus::Initialized);
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn init_fails_when_root_is_a_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("occupied");
        std::fs::write(&root, b"not a directory").unwrap();

        let provider = LocalProvider::new("local", &root);
        assert_eq!(provider.init(2).await, ProviderStatus::Error);
    }

    #[tokio::test]
    async fn objects_are_named_by_id() {
        let dir = tempdir().unwrap();
        let provider = LocalProvider::new("local", dir.path());
        provider.init(1).await;

        let id = provider
            .post(stream_from_bytes(&b"payload"[..]))
            .await
            .unwrap();
        let on_disk = std::fs::read(dir.path().join(id.as_str())).unwrap();
        assert_eq!(on_disk, b"payload");

        let staging: Vec<_> = std::fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(staging.is_empty());
    }

    #[tokio::test]
    async fn put_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let provider = LocalProvider::new("local", dir.path());
        provider.init(1).await;

        let err = provider
            .put(&ObjectId::generate(), stream_from_bytes(&b"x"[..]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = provider.delete(&ObjectId::generate()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_skips_staging() {
        let dir = tempdir().unwrap();
        let provider = LocalProvider::new("local", dir.path());
        provider.init(1).await;

        let a = provider.post(stream_from_bytes(&b"a"[..])).await.unwrap();
        let b = provider.post(stream_from_bytes(&b"b"[..])).await.unwrap();

        let mut ids: Vec<ObjectId> = provider.list().try_collect().await.unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn reopen_sees_existing_objects() {
        let dir = tempdir().unwrap();
        let id = {
            let provider = LocalProvider::new("local", dir.path());
            provider.init(1).await;
            provider
                .post(stream_from_bytes(&b"persistent"[..]))
                .await
                .unwrap()
        };

        let provider = LocalProvider::new("local", dir.path());
        provider.init(1).await;
        let data = read_to_vec(provider.get(&id).await.unwrap()).await.unwrap();
        assert_eq!(data, b"persistent");
    }
}
