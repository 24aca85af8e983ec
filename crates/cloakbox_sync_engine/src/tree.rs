//! Local file tree.
//!
//! The tree is an arena: nodes live in one vector and refer to each other by
//! [`NodeId`], which stays valid for the lifetime of the tree. Folders only
//! group files; they have no identity on any remote.
//!
//! Relative paths use `/` as separator on every platform.

use crate::config::STATE_DIR_NAME;
use crate::error::SyncResult;
use cloakbox_provider::CHUNK_SIZE;
use cloakbox_store::Fingerprint;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stable index of a node in a [`LocalTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A regular file found in the local tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Path relative to the sync root.
    pub path: String,
    /// Fingerprint of the content at scan time.
    pub fingerprint: Fingerprint,
    /// Size in bytes at scan time.
    pub size: u64,
}

/// What a node is.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A folder and its children in name order.
    Folder {
        /// Child nodes.
        children: Vec<NodeId>,
    },
    /// A file.
    File(LocalFile),
}

/// One entry of the tree.
#[derive(Debug, Clone)]
pub struct Node {
    /// Base name (empty for the root).
    pub name: String,
    /// Parent folder, `None` for the root.
    pub parent: Option<NodeId>,
    /// Folder or file payload.
    pub kind: NodeKind,
}

/// A path the last scan could not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreadable {
    /// Path relative to the sync root; a folder covers its whole subtree.
    pub path: String,
    /// Rendered I/O error.
    pub error: String,
}

/// Snapshot of the synchronized directory.
#[derive(Debug, Clone)]
pub struct LocalTree {
    nodes: Vec<Node>,
    unreadable: Vec<Unreadable>,
}

impl Default for LocalTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTree {
    /// The root folder.
    pub const ROOT: NodeId = NodeId(0);

    /// Creates a tree holding only the root folder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                kind: NodeKind::Folder {
                    children: Vec::new(),
                },
            }],
            unreadable: Vec::new(),
        }
    }

    /// Scans `root` recursively, fingerprinting every regular file.
    ///
    /// The state directory and symbolic links are skipped, as are names that
    /// are not valid UTF-8. Folders and files below the root that cannot be
    /// read are listed in [`unreadable`](Self::unreadable) instead of failing
    /// the scan. This call blocks; run it off the async executor.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root itself cannot be read.
    pub fn scan(root: &Path) -> SyncResult<Self> {
        let mut tree = Self::new();
        tree.scan_dir(root, Self::ROOT, "")?;
        debug!(
            root = %root.display(),
            files = tree.file_count(),
            unreadable = tree.unreadable.len(),
            "scanned local tree"
        );
        Ok(tree)
    }

    fn scan_dir(&mut self, dir: &Path, parent: NodeId, prefix: &str) -> io::Result<()> {
        let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 name");
                continue;
            };
            if parent == Self::ROOT && name == STATE_DIR_NAME {
                continue;
            }
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    self.mark_unreadable(rel, &e);
                    continue;
                }
            };
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }

            if file_type.is_dir() {
                let folder = self.push(parent, name, NodeKind::Folder { children: Vec::new() });
                if let Err(e) = self.scan_dir(&entry.path(), folder, &rel) {
                    self.mark_unreadable(rel, &e);
                }
            } else if file_type.is_file() {
                match hash_file(&entry.path()) {
                    Ok((fingerprint, size)) => {
                        let file = LocalFile {
                            path: rel,
                            fingerprint,
                            size,
                        };
                        self.push(parent, name, NodeKind::File(file));
                    }
                    // Deleted while scanning.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => self.mark_unreadable(rel, &e),
                }
            }
        }
        Ok(())
    }

    fn mark_unreadable(&mut self, path: String, error: &io::Error) {
        warn!(path, %error, "cannot read, leaving it untouched");
        self.unreadable.push(Unreadable {
            path,
            error: error.to_string(),
        });
    }

    /// Paths the scan could not read.
    #[must_use]
    pub fn unreadable(&self) -> &[Unreadable] {
        &self.unreadable
    }

    /// Returns true if `path` is, or lies under, an unreadable path.
    ///
    /// Nothing is known about such files, so they must not be read as
    /// deleted.
    #[must_use]
    pub fn is_unreadable(&self, path: &str) -> bool {
        self.unreadable.iter().any(|u| {
            path.strip_prefix(u.path.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    fn push(&mut self, parent: NodeId, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name,
            parent: Some(parent),
            kind,
        });
        if let NodeKind::Folder { children } = &mut self.nodes[parent.0].kind {
            children.push(id);
        }
        id
    }

    /// Adds a file at `path`, creating missing folders.
    ///
    /// Returns `None` if a path segment is already taken by a file.
    pub fn insert_file(&mut self, path: &str, fingerprint: Fingerprint, size: u64) -> Option<NodeId> {
        let segments: Vec<&str> = path.split('/').collect();
        let (file_name, folders) = segments.split_last()?;

        let mut parent = Self::ROOT;
        for segment in folders {
            parent = match self.child(parent, segment) {
                Some(id) if matches!(self.nodes[id.0].kind, NodeKind::Folder { .. }) => id,
                Some(_) => return None,
                None => self.push(
                    parent,
                    (*segment).to_string(),
                    NodeKind::Folder { children: Vec::new() },
                ),
            };
        }
        if self.child(parent, file_name).is_some() {
            return None;
        }
        let file = LocalFile {
            path: path.to_string(),
            fingerprint,
            size,
        };
        Some(self.push(parent, (*file_name).to_string(), NodeKind::File(file)))
    }

    fn child(&self, folder: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[folder.0].kind {
            NodeKind::Folder { children } => children
                .iter()
                .copied()
                .find(|c| self.nodes[c.0].name == name),
            NodeKind::File(_) => None,
        }
    }

    /// Finds the file at `path`.
    ///
    /// Walks depth-first from the root, descending only into folders whose
    /// name matches the next path segment, so files that share a base name
    /// in other folders are never mistaken for the target.
    #[must_use]
    pub fn search_file(&self, path: &str) -> Option<NodeId> {
        let segments: Vec<&str> = path.split('/').collect();
        self.search_from(Self::ROOT, &segments, path)
    }

    fn search_from(&self, folder: NodeId, segments: &[&str], path: &str) -> Option<NodeId> {
        let (first, rest) = segments.split_first()?;
        let NodeKind::Folder { children } = &self.nodes[folder.0].kind else {
            return None;
        };

        for &child in children {
            let node = &self.nodes[child.0];
            if node.name != *first {
                continue;
            }
            match &node.kind {
                NodeKind::File(file) if rest.is_empty() && file.path == path => return Some(child),
                NodeKind::Folder { .. } if !rest.is_empty() => {
                    if let Some(found) = self.search_from(child, rest, path) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Returns the file stored at `id`, if it is a file.
    #[must_use]
    pub fn file(&self, id: NodeId) -> Option<&LocalFile> {
        match &self.get(id)?.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Folder { .. } => None,
        }
    }

    /// Iterates every file in depth-first order.
    pub fn files(&self) -> impl Iterator<Item = &LocalFile> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Folder { .. } => None,
        })
    }

    /// Number of files in the tree.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files().count()
    }
}

/// Streams a file through SHA-256.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn hash_file(path: &Path) -> io::Result<(Fingerprint, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
                size += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok((Fingerprint::from_digest(hasher.finalize().into()), size))
}

/// Returns true if `path` is a relative path that stays inside the root.
///
/// Paths read from a remote index are untrusted until checked here.
#[must_use]
pub fn is_safe_rel_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !path.contains('\0')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && path.split('/').next() != Some(STATE_DIR_NAME)
}

/// Resolves a relative path against the sync root.
#[must_use]
pub fn local_path(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::of(s.as_bytes())
    }

    #[test]
    fn search_finds_nested_file() {
        let mut tree = LocalTree::new();
        tree.insert_file("docs/2024/report.txt", fp("r"), 1).unwrap();
        tree.insert_file("notes.txt", fp("n"), 1).unwrap();

        let id = tree.search_file("docs/2024/report.txt").unwrap();
        assert_eq!(tree.file(id).unwrap().fingerprint, fp("r"));
        assert!(tree.search_file("docs/2024").is_none());
        assert!(tree.search_file("docs/report.txt").is_none());
    }

    #[test]
    fn decoy_before_match_is_skipped() {
        let mut tree = LocalTree::new();
        // Same base name, visited first.
        tree.insert_file("a/config.toml", fp("decoy"), 1).unwrap();
        tree.insert_file("b/config.toml", fp("target"), 1).unwrap();

        let id = tree.search_file("b/config.toml").unwrap();
        assert_eq!(tree.file(id).unwrap().fingerprint, fp("target"));
        let id = tree.search_file("a/config.toml").unwrap();
        assert_eq!(tree.file(id).unwrap().fingerprint, fp("decoy"));
    }

    #[test]
    fn insert_rejects_file_folder_clash() {
        let mut tree = LocalTree::new();
        tree.insert_file("a", fp("a"), 1).unwrap();
        assert!(tree.insert_file("a/b", fp("b"), 1).is_none());
        assert!(tree.insert_file("a", fp("again"), 1).is_none());
    }

    #[test]
    fn scan_skips_state_dir_and_fingerprints() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::create_dir_all(dir.path().join(STATE_DIR_NAME)).unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();
        fs::write(dir.path().join("sub/deeper/leaf.bin"), vec![1u8; 70_000]).unwrap();
        fs::write(dir.path().join(STATE_DIR_NAME).join("state.json"), b"{}").unwrap();

        let tree = LocalTree::scan(dir.path()).unwrap();
        let paths: Vec<&str> = tree.files().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["sub/deeper/leaf.bin", "top.txt"]);

        let leaf = tree.file(tree.search_file("sub/deeper/leaf.bin").unwrap()).unwrap();
        assert_eq!(leaf.size, 70_000);
        assert_eq!(leaf.fingerprint, Fingerprint::of(&vec![1u8; 70_000]));
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_symlinks() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let tree = LocalTree::scan(dir.path()).unwrap();
        assert_eq!(tree.file_count(), 1);
        assert!(tree.search_file("link.txt").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_folder_is_listed_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("locked")).unwrap();
        fs::write(dir.path().join("locked/inner.txt"), b"i").unwrap();
        fs::write(dir.path().join("open.txt"), b"o").unwrap();
        let locked = dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not bind this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let tree = LocalTree::scan(dir.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let tree = tree.unwrap();

        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.unreadable().len(), 1);
        assert_eq!(tree.unreadable()[0].path, "locked");
        assert!(tree.is_unreadable("locked/inner.txt"));
        assert!(tree.is_unreadable("locked"));
        assert!(!tree.is_unreadable("locked2/x.txt"));
        assert!(!tree.is_unreadable("open.txt"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(LocalTree::scan(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn rel_path_safety() {
        assert!(is_safe_rel_path("a/b.txt"));
        assert!(is_safe_rel_path(".hidden"));
        assert!(!is_safe_rel_path(""));
        assert!(!is_safe_rel_path("/etc/passwd"));
        assert!(!is_safe_rel_path("a/../../b"));
        assert!(!is_safe_rel_path("a//b"));
        assert!(!is_safe_rel_path(".cloakbox/state.json"));
        assert!(!is_safe_rel_path("a\\b"));
    }

    #[test]
    fn local_path_joins_segments() {
        let path = local_path(Path::new("/root"), "a/b/c.txt");
        assert_eq!(path, Path::new("/root").join("a").join("b").join("c.txt"));
    }
}
