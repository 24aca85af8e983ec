//! In-process FTP server for testing.

use super::session::{FtpConnector, FtpSession};
use super::FtpConfig;
use crate::error::{ProviderError, ProviderResult};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;

/// An FTP server simulated in memory.
///
/// Implements [`FtpConnector`], so an [`super::FtpProvider`] can be built on
/// it without a network. Supports fault injection:
/// - [`refuse_next_logins`](Self::refuse_next_logins) makes connection
///   attempts fail as if the server were unreachable
/// - [`drop_connection_after`](Self::drop_connection_after) resets the
///   control connection after a number of commands
#[derive(Debug, Clone)]
pub struct MemoryFtpServer {
    state: Arc<Mutex<ServerState>>,
}

#[derive(Debug)]
struct ServerState {
    username: String,
    password: String,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    refuse_logins: u32,
    drop_after: Option<u32>,
    sessions_opened: u32,
}

impl MemoryFtpServer {
    /// Creates a server accepting exactly one user.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(ServerState {
                username: username.into(),
                password: password.into(),
                files: BTreeMap::new(),
                dirs,
                refuse_logins: 0,
                drop_after: None,
                sessions_opened: 0,
            })),
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_next_logins(&self, count: u32) {
        self.state.lock().refuse_logins = count;
    }

    /// Resets the connection once `commands` more commands have been served.
    pub fn drop_connection_after(&self, commands: u32) {
        self.state.lock().drop_after = Some(commands);
    }

    /// Returns how many sessions were successfully opened.
    #[must_use]
    pub fn sessions_opened(&self) -> u32 {
        self.state.lock().sessions_opened
    }

    /// Returns true if the absolute directory exists.
    #[must_use]
    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    /// Returns the names of files directly inside the absolute directory.
    #[must_use]
    pub fn file_names(&self, dir: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .files
            .keys()
            .filter_map(|path| {
                let (parent, name) = split_parent(path);
                (parent == dir).then(|| name.to_string())
            })
            .collect()
    }

    /// Returns the content of the file at the absolute path.
    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

impl FtpConnector for MemoryFtpServer {
    fn connect(&self, config: &FtpConfig) -> ProviderResult<Box<dyn FtpSession>> {
        let mut state = self.state.lock();
        if state.refuse_logins > 0 {
            state.refuse_logins -= 1;
            return Err(ProviderError::transport_retryable(
                "421 service not available",
            ));
        }
        if config.username != state.username || config.password.expose() != state.password {
            return Err(ProviderError::transport_fatal("530 login incorrect"));
        }
        state.sessions_opened += 1;
        drop(state);

        Ok(Box::new(MemoryFtpSession {
            state: Arc::clone(&self.state),
            cwd: "/".to_string(),
            alive: true,
        }))
    }
}

struct MemoryFtpSession {
    state: Arc<Mutex<ServerState>>,
    cwd: String,
    alive: bool,
}

impl MemoryFtpSession {
    /// Serves one command, applying any scheduled connection drop.
    fn command(&mut self) -> ProviderResult<MutexGuard<'_, ServerState>> {
        if !self.alive {
            return Err(ProviderError::transport_retryable("connection closed"));
        }
        let mut state = self.state.lock();
        match state.drop_after {
            Some(0) => {
                state.drop_after = None;
                self.alive = false;
                Err(ProviderError::transport_retryable(
                    "connection reset by peer",
                ))
            }
            Some(n) => {
                state.drop_after = Some(n - 1);
                Ok(state)
            }
            None => Ok(state),
        }
    }

    fn path(&self, name: &str) -> String {
        join(&self.cwd, name)
    }
}

impl FtpSession for MemoryFtpSession {
    fn store(&mut self, name: &str, reader: &mut dyn Read) -> ProviderResult<u64> {
        let path = self.path(name);
        drop(self.command()?);
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| ProviderError::transport_retryable(e.to_string()))?;
        let len = data.len() as u64;
        self.command()?.files.insert(path, data);
        Ok(len)
    }

    fn retrieve(&mut self, name: &str) -> ProviderResult<Vec<u8>> {
        let path = self.path(name);
        self.command()?
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                id: name.to_string(),
            })
    }

    fn rename(&mut self, from: &str, to: &str) -> ProviderResult<()> {
        let (from_path, to_path) = (self.path(from), self.path(to));
        let mut state = self.command()?;
        let data = state
            .files
            .remove(&from_path)
            .ok_or_else(|| ProviderError::NotFound {
                id: from.to_string(),
            })?;
        state.files.insert(to_path, data);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> ProviderResult<()> {
        let path = self.path(name);
        self.command()?
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound {
                id: name.to_string(),
            })
    }

    fn exists(&mut self, name: &str) -> ProviderResult<bool> {
        let path = self.path(name);
        Ok(self.command()?.files.contains_key(&path))
    }

    fn list_names(&mut self) -> ProviderResult<Vec<String>> {
        let cwd = self.cwd.clone();
        let state = self.command()?;
        Ok(state
            .files
            .keys()
            .filter_map(|path| {
                let (parent, name) = split_parent(path);
                (parent == cwd).then(|| name.to_string())
            })
            .collect())
    }

    fn enter_folder(&mut self, folder: &str) -> ProviderResult<()> {
        let mut cwd = if folder.starts_with('/') {
            "/".to_string()
        } else {
            self.cwd.clone()
        };
        for segment in folder.split('/').filter(|s| !s.is_empty()) {
            cwd = join(&cwd, segment);
            self.command()?.dirs.insert(cwd.clone());
        }
        self.cwd = cwd;
        Ok(())
    }

    fn quit(&mut self) {
        self.alive = false;
    }
}
