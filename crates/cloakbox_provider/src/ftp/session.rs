//! FTP session abstraction and the `suppaftp` implementation.
//!
//! The provider talks to the server through [`FtpSession`], a blocking,
//! single-connection command interface. Sessions are created by an
//! [`FtpConnector`]; this keeps the provider's pooling, retry and
//! serialization logic independent of the wire client, and lets tests run
//! against [`super::MemoryFtpServer`].

use super::FtpConfig;
use crate::error::{ProviderError, ProviderResult};
use std::io::Read;
use std::net::ToSocketAddrs;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::debug;

/// One authenticated FTP control connection.
///
/// All names are relative to the session's working directory. Methods block
/// the calling thread; the provider runs them on the blocking pool.
pub trait FtpSession: Send {
    /// Uploads `reader` to `name`, replacing any existing file.
    fn store(&mut self, name: &str, reader: &mut dyn Read) -> ProviderResult<u64>;

    /// Downloads `name` in full.
    fn retrieve(&mut self, name: &str) -> ProviderResult<Vec<u8>>;

    /// Renames `from` to `to`, replacing `to` if present.
    fn rename(&mut self, from: &str, to: &str) -> ProviderResult<()>;

    /// Deletes `name`.
    fn remove(&mut self, name: &str) -> ProviderResult<()>;

    /// Returns true if `name` exists.
    fn exists(&mut self, name: &str) -> ProviderResult<bool>;

    /// Lists file names in the working directory.
    fn list_names(&mut self) -> ProviderResult<Vec<String>>;

    /// Changes into `folder`, creating each missing segment.
    fn enter_folder(&mut self, folder: &str) -> ProviderResult<()>;

    /// Politely ends the session. Errors are ignored.
    fn quit(&mut self);
}

/// Opens authenticated sessions.
pub trait FtpConnector: Send + Sync {
    /// Connects, logs in and switches to binary mode.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server is unreachable or rejects
    /// the credentials.
    fn connect(&self, config: &FtpConfig) -> ProviderResult<Box<dyn FtpSession>>;
}

/// Connector backed by the `suppaftp` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuppaFtpConnector;

impl FtpConnector for SuppaFtpConnector {
    fn connect(&self, config: &FtpConfig) -> ProviderResult<Box<dyn FtpSession>> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                ProviderError::transport_retryable(format!("cannot resolve {}: {e}", config.host))
            })?
            .next()
            .ok_or_else(|| {
                ProviderError::transport_fatal(format!("no address for {}", config.host))
            })?;

        let mut stream =
            FtpStream::connect_timeout(addr, config.connect_timeout).map_err(transport)?;
        stream
            .login(config.username.as_str(), config.password.expose())
            .map_err(transport)?;
        stream.transfer_type(FileType::Binary).map_err(transport)?;
        debug!(host = %config.host, port = config.port, "ftp session opened");

        Ok(Box::new(SuppaFtpSession { stream }))
    }
}

struct SuppaFtpSession {
    stream: FtpStream,
}

fn is_unavailable(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable)
}

fn transport(err: FtpError) -> ProviderError {
    match err {
        FtpError::ConnectionError(e) => ProviderError::transport_retryable(e.to_string()),
        other => ProviderError::transport_fatal(other.to_string()),
    }
}

fn missing_or_transport(err: FtpError, name: &str) -> ProviderError {
    if is_unavailable(&err) {
        ProviderError::NotFound {
            id: name.to_string(),
        }
    } else {
        transport(err)
    }
}

impl FtpSession for SuppaFtpSession {
    fn store(&mut self, name: &str, reader: &mut dyn Read) -> ProviderResult<u64> {
        let mut reader = reader;
        self.stream.put_file(name, &mut reader).map_err(transport)
    }

    fn retrieve(&mut self, name: &str) -> ProviderResult<Vec<u8>> {
        self.stream
            .retr_as_buffer(name)
            .map(|cursor| cursor.into_inner())
            .map_err(|e| missing_or_transport(e, name))
    }

    fn rename(&mut self, from: &str, to: &str) -> ProviderResult<()> {
        self.stream
            .rename(from, to)
            .map_err(|e| missing_or_transport(e, from))
    }

    fn remove(&mut self, name: &str) -> ProviderResult<()> {
        self.stream
            .rm(name)
            .map_err(|e| missing_or_transport(e, name))
    }

    fn exists(&mut self, name: &str) -> ProviderResult<bool> {
        match self.stream.size(name) {
            Ok(_) => Ok(true),
            Err(e) if is_unavailable(&e) => Ok(false),
            Err(e) => Err(transport(e)),
        }
    }

    fn list_names(&mut self) -> ProviderResult<Vec<String>> {
        match self.stream.nlst(None) {
            Ok(names) => Ok(names
                .into_iter()
                .map(|n| n.rsplit('/').next().unwrap_or_default().to_string())
                .collect()),
            // Some servers answer 550 for an empty directory.
            Err(e) if is_unavailable(&e) => Ok(Vec::new()),
            Err(e) => Err(transport(e)),
        }
    }

    fn enter_folder(&mut self, folder: &str) -> ProviderResult<()> {
        if folder.starts_with('/') {
            self.stream.cwd("/").map_err(transport)?;
        }
        for segment in folder.split('/').filter(|s| !s.is_empty()) {
            match self.stream.cwd(segment) {
                Ok(()) => {}
                Err(e) if is_unavailable(&e) => {
                    debug!(segment, "creating ftp folder");
                    self.stream.mkdir(segment).map_err(transport)?;
                    self.stream.cwd(segment).map_err(transport)?;
                }
                Err(e) => return Err(transport(e)),
            }
        }
        Ok(())
    }

    fn quit(&mut self) {
        let _ = self.stream.quit();
    }
}
