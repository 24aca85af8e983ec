//! FTP provider.
//!
//! Objects are files in the configured folder of an FTP account, named by
//! their generated id. Uploads go to a `<id>.part` file that is renamed
//! into place once complete, so a reader never observes a partial object.
//! The suffix keeps staging files out of [`Provider::list`], and every new
//! session deletes the ones an interrupted upload left behind.
//!
//! ## Connection model
//!
//! A provider owns at most one control connection. Every operation locks
//! it for its whole command sequence, so two transfers never share the
//! connection; separate providers proceed in parallel. A transport failure
//! drops the session, and the next operation reconnects on demand.

mod memory_server;
mod session;

pub use memory_server::MemoryFtpServer;
pub use session::{FtpConnector, FtpSession, SuppaFtpConnector};

use crate::credentials::Password;
use crate::error::{ProviderError, ProviderResult};
use crate::id::ObjectId;
use crate::provider::{stream_from_bytes, ByteStream, IdStream, Provider, CHUNK_SIZE};
use crate::status::{run_init, ProviderStatus, StatusCell};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::io::{BufReader, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default FTP control port.
pub const DEFAULT_PORT: u16 = 21;

const STAGING_SUFFIX: &str = ".part";

fn staging_name(target: &str) -> String {
    format!("{target}{STAGING_SUFFIX}")
}

/// Deletes staging files left by uploads that never reached their rename.
fn sweep_staging(session: &mut dyn FtpSession) -> ProviderResult<()> {
    for name in session.list_names()? {
        if name.len() <= STAGING_SUFFIX.len() || !name.ends_with(STAGING_SUFFIX) {
            continue;
        }
        match session.remove(&name) {
            Ok(()) => debug!(name, "removed stale staging file"),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => debug!(name, error = %e, "stale staging file not removed"),
        }
    }
    Ok(())
}

/// Connection settings for an FTP account.
#[derive(Debug, Clone)]
pub struct FtpConfig {
    /// Server host name or address.
    pub host: String,
    /// Control port.
    pub port: u16,
    /// Account user name.
    pub username: String,
    /// Account password.
    pub password: Password,
    /// Folder that scopes all objects; created on first use.
    pub folder: Option<String>,
    /// Timeout for establishing the control connection.
    pub connect_timeout: Duration,
}

impl FtpConfig {
    /// Creates a configuration for the default port and the account root.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: Password) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password,
            folder: None,
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// Sets the control port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Scopes all objects to `folder`.
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        let folder = folder.into();
        self.folder = (!folder.trim_matches('/').is_empty()).then_some(folder);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

type SessionSlot = Arc<Mutex<Option<Box<dyn FtpSession>>>>;

/// A provider backed by one FTP connection.
pub struct FtpProvider {
    name: String,
    config: Arc<FtpConfig>,
    connector: Arc<dyn FtpConnector>,
    session: SessionSlot,
    status: StatusCell,
}

impl std::fmt::Debug for FtpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpProvider")
            .field("name", &self.name)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("folder", &self.config.folder)
            .field("status", &self.status.get())
            .finish()
    }
}

impl FtpProvider {
    /// Creates a provider that connects with the `suppaftp` client.
    pub fn new(name: impl Into<String>, config: FtpConfig) -> Self {
        Self::with_connector(name, config, Arc::new(SuppaFtpConnector))
    }

    /// Creates a provider that opens sessions through `connector`.
    pub fn with_connector(
        name: impl Into<String>,
        config: FtpConfig,
        connector: Arc<dyn FtpConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            connector,
            session: Arc::new(Mutex::new(None)),
            status: StatusCell::new(),
        }
    }

    /// Returns the connection settings.
    #[must_use]
    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    fn open_session(
        connector: &dyn FtpConnector,
        config: &FtpConfig,
    ) -> ProviderResult<Box<dyn FtpSession>> {
        let mut session = connector.connect(config)?;
        let prepared = match &config.folder {
            Some(folder) => session.enter_folder(folder),
            None => Ok(()),
        }
        .and_then(|()| sweep_staging(session.as_mut()));
        if let Err(e) = prepared {
            session.quit();
            return Err(e);
        }
        Ok(session)
    }

    /// One init attempt: open a session and park it in the slot.
    async fn connect(&self) -> ProviderResult<()> {
        let mut slot = Arc::clone(&self.session).lock_owned().await;
        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || {
            if let Some(mut old) = slot.take() {
                old.quit();
            }
            *slot = Some(Self::open_session(connector.as_ref(), &config)?);
            Ok(())
        })
        .await
        .map_err(|e| ProviderError::transport_fatal(format!("ftp worker failed: {e}")))?
    }

    /// Runs `op` on the session with exclusive use of the connection.
    ///
    /// Reconnects first if a previous failure dropped the session. A
    /// transport failure inside `op` drops the session again.
    async fn with_session<T, F>(&self, op: F) -> ProviderResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FtpSession) -> ProviderResult<T> + Send + 'static,
    {
        self.status.require_ready()?;
        let mut slot = Arc::clone(&self.session).lock_owned().await;
        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = match slot.take() {
                Some(session) => session,
                None => {
                    debug!(provider = %name, "reconnecting ftp session");
                    Self::open_session(connector.as_ref(), &config)?
                }
            };

            let result = op(session.as_mut());
            match &result {
                Err(e) if e.is_transport() => {
                    warn!(provider = %name, error = %e, "ftp session dropped");
                    session.quit();
                }
                _ => *slot = Some(session),
            }
            result
        })
        .await
        .map_err(|e| ProviderError::transport_fatal(format!("ftp worker failed: {e}")))?
    }

    /// Uploads `content` under a staging name, then renames it to `target`.
    async fn upload(&self, target: String, content: ByteStream, replace: bool) -> ProviderResult<()> {
        let reader = BufReader::with_capacity(CHUNK_SIZE, SyncIoBridge::new(content));
        self.with_session(move |session| {
            if replace && !session.exists(&target)? {
                return Err(ProviderError::NotFound { id: target });
            }
            let staging = staging_name(&target);
            let mut reader = reader;
            let result = session
                .store(&staging, &mut reader as &mut dyn Read)
                .and_then(|_| session.rename(&staging, &target));
            if let Err(e) = &result {
                if !e.is_transport() {
                    let _ = session.remove(&staging);
                }
            }
            result
        })
        .await
    }
}

#[async_trait]
impl Provider for FtpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "ftp"
    }

    fn status(&self) -> ProviderStatus {
        self.status.get()
    }

    async fn init_cancellable(
        &self,
        retry_attempts: u32,
        cancel: &CancellationToken,
    ) -> ProviderStatus {
        let status = run_init(&self.status, &self.name, retry_attempts, cancel, || {
            self.connect()
        })
        .await;

        if !status.is_ready() {
            // Release whatever a failed or cancelled attempt left behind.
            if let Some(mut session) = self.session.lock().await.take() {
                session.quit();
            }
        }
        status
    }

    async fn post(&self, content: ByteStream) -> ProviderResult<ObjectId> {
        let id = ObjectId::generate();
        self.upload(id.as_str().to_string(), content, false).await?;
        Ok(id)
    }

    async fn get(&self, id: &ObjectId) -> ProviderResult<ByteStream> {
        let name = id.as_str().to_string();
        let data = self
            .with_session(move |session| session.retrieve(&name))
            .await?;
        Ok(stream_from_bytes(data))
    }

    async fn put(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        self.upload(id.as_str().to_string(), content, true).await
    }

    async fn delete(&self, id: &ObjectId) -> ProviderResult<()> {
        let name = id.as_str().to_string();
        self.with_session(move |session| session.remove(&name))
            .await
    }

    async fn create(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        if !id.is_reserved() {
            return Err(ProviderError::InvalidId(format!(
                "{id} is not a reserved id"
            )));
        }
        let name = id.as_str().to_string();
        let target = name.clone();
        if self
            .with_session(move |session| session.exists(&target))
            .await?
        {
            return Err(ProviderError::AlreadyExists { id: name });
        }
        self.upload(name, content, false).await
    }

    fn list(&self) -> IdStream<'_> {
        let names = stream::once(self.with_session(|session| session.list_names()));
        Box::pin(names.flat_map(|result| {
            let items: Vec<ProviderResult<ObjectId>> = match result {
                Ok(names) => names
                    .iter()
                    .filter_map(|n| ObjectId::parse(n).ok())
                    .map(Ok)
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        }))
    }

    async fn close(&self) -> ProviderResult<()> {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            tokio::task::spawn_blocking(move || session.quit())
                .await
                .map_err(|e| ProviderError::transport_fatal(format!("ftp worker failed: {e}")))?;
        }
        self.status.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::read_to_vec;
    use futures::TryStreamExt;

    fn provider(server: &MemoryFtpServer, folder: Option<&str>) -> FtpProvider {
        let mut config = FtpConfig::new("ftp.test", "alice", Password::new("secret"));
        if let Some(folder) = folder {
            config = config.with_folder(folder);
        }
        FtpProvider::with_connector("ftp", config, Arc::new(server.clone()))
    }

    #[test]
    fn config_builder() {
        let config = FtpConfig::new("ftp.example.com", "bob", Password::new("pw"))
            .with_port(2121)
            .with_folder("/backups/laptop")
            .with_connect_timeout(Duration::from_secs(3));
        assert_eq!(config.port, 2121);
        assert_eq!(config.folder.as_deref(), Some("/backups/laptop"));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));

        let config = config.with_folder("/");
        assert!(config.folder.is_none());
    }

    #[tokio::test]
    async fn operations_before_init_fail_fast() {
        let server = MemoryFtpServer::new("alice", "secret");
        let provider = provider(&server, None);
        let err = provider.get(&ObjectId::generate()).await.err().unwrap();
        assert!(matches!(err, ProviderError::NotInitialized { .. }));
        assert_eq!(server.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn staging_files_are_never_listed() {
        let server = MemoryFtpServer::new("alice", "secret");
        let provider = provider(&server, Some("vault"));
        provider.init(1).await;

        let id = provider.post(stream_from_bytes(&b"abc"[..])).await.unwrap();
        assert_eq!(server.file_names("/vault"), vec![id.as_str().to_string()]);
        let data = read_to_vec(provider.get(&id).await.unwrap()).await.unwrap();
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn interrupted_upload_leaves_no_staging_file() {
        let server = MemoryFtpServer::new("alice", "secret");
        let provider = provider(&server, Some("vault"));
        provider.init(1).await;
        let kept = provider.post(stream_from_bytes(&b"kept"[..])).await.unwrap();

        // Two commands store the staging file; the rename never arrives.
        server.drop_connection_after(2);
        let err = provider
            .post(stream_from_bytes(&b"lost"[..]))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        let names = server.file_names("/vault");
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(".part")));

        // The reconnect sweeps it away; finished objects stay.
        let ids: Vec<ObjectId> = provider.list().try_collect().await.unwrap();
        assert_eq!(ids, vec![kept.clone()]);
        assert_eq!(server.file_names("/vault"), vec![kept.as_str().to_string()]);
        assert_eq!(server.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn close_releases_session() {
        let server = MemoryFtpServer::new("alice", "secret");
        let provider = provider(&server, None);
        assert_eq!(provider.init(1).await, ProviderStatus::Initialized);
        provider.close().await.unwrap();
        assert_eq!(provider.status(), ProviderStatus::Uninitialized);
        assert!(provider.session.lock().await.is_none());
    }
}
