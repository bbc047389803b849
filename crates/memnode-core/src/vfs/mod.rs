//! In-memory virtual filesystem with POSIX semantics.
//!
//! The tree lives behind a single mutex; every operation is synchronous and
//! atomic. Mutations are recorded while the lock is held and delivered to
//! watchers and listeners once it has been released.
//!
//! `Vfs` is a cheap handle: clones share the same tree.

mod error;
mod node;
pub mod path;
mod snapshot;
mod watch;

pub use error::{ErrorCode, VfsError};
pub use node::MAX_SYMLINK_HOPS;
pub use snapshot::{Snapshot, SnapshotEntry};
pub use watch::{
    EventListener, Subscription, VfsEvent, WatchCallback, WatchEvent, WatchEventKind, WatchHandle,
};

use node::{NodeKind, Tree};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use watch::{Mutation, WatchRegistry};

/// Type of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Metadata for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub mode: u32,
}

impl Stats {
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    #[must_use]
    pub fn is_symbolic_link(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Modification time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn mtime_ms(&self) -> u128 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

struct Shared {
    tree: Mutex<Tree>,
    watch: Arc<WatchRegistry>,
}

/// Handle to an in-memory filesystem.
#[derive(Clone)]
pub struct Vfs {
    shared: Arc<Shared>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("watchers", &self.shared.watch.watcher_count())
            .finish_non_exhaustive()
    }
}

impl Vfs {
    /// Create an empty filesystem containing only `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tree(Tree::new())
    }

    fn with_tree(tree: Tree) -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(tree),
                watch: Arc::new(WatchRegistry::default()),
            }),
        }
    }

    /// Build a filesystem from a snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, VfsError> {
        Ok(Self::with_tree(snapshot::rebuild(snapshot)?))
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.shared.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, mutations: &[Mutation]) {
        if !mutations.is_empty() {
            self.shared.watch.dispatch(mutations);
        }
    }

    // Reads

    /// Read a whole file, following symlinks.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let tree = self.tree();
        let resolved = tree.resolve(path, true, "open")?;
        match tree.get(resolved.id).map(|n| &n.kind) {
            Some(NodeKind::File(bytes)) => Ok(bytes.clone()),
            Some(NodeKind::Directory(_)) => Err(VfsError::eisdir("read", path)),
            _ => Err(VfsError::enoent("open", path)),
        }
    }

    /// Read a file as UTF-8 text. Invalid sequences are replaced.
    pub fn read_to_string(&self, path: &str) -> Result<String, VfsError> {
        let bytes = self.read_file(path)?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Whether `path` resolves to a node (following symlinks).
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.tree().resolve(path, true, "access").is_ok()
    }

    #[must_use]
    pub fn is_file(&self, path: &str) -> bool {
        self.stat(path).is_ok_and(|s| s.is_file())
    }

    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        self.stat(path).is_ok_and(|s| s.is_directory())
    }

    fn stats_for(&self, path: &str, follow: bool, syscall: &'static str) -> Result<Stats, VfsError> {
        let tree = self.tree();
        let resolved = tree.resolve(path, follow, syscall)?;
        let node = tree
            .get(resolved.id)
            .ok_or_else(|| VfsError::enoent(syscall, path))?;
        Ok(Stats {
            kind: node.file_kind(),
            size: node.size(),
            mtime: node.mtime,
            mode: node.mode,
        })
    }

    /// Metadata of the node `path` points at.
    pub fn stat(&self, path: &str) -> Result<Stats, VfsError> {
        self.stats_for(path, true, "stat")
    }

    /// Metadata of `path` itself, without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Stats, VfsError> {
        self.stats_for(path, false, "lstat")
    }

    /// Sorted names of a directory's children.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, VfsError> {
        Ok(self
            .read_dir_entries(path)?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Sorted children of a directory with their types.
    pub fn read_dir_entries(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        let tree = self.tree();
        let resolved = tree.resolve(path, true, "scandir")?;
        let children = tree
            .children(resolved.id)
            .ok_or_else(|| VfsError::enotdir("scandir", path))?;
        Ok(children
            .iter()
            .filter_map(|(name, id)| {
                tree.get(*id).map(|node| DirEntry {
                    name: name.clone(),
                    kind: node.file_kind(),
                })
            })
            .collect())
    }

    /// The target of a symlink.
    pub fn readlink(&self, path: &str) -> Result<String, VfsError> {
        let tree = self.tree();
        let resolved = tree.resolve(path, false, "readlink")?;
        match tree.get(resolved.id).map(|n| &n.kind) {
            Some(NodeKind::Symlink(target)) => Ok(target.clone()),
            _ => Err(VfsError::einval("readlink", path)),
        }
    }

    /// The canonical, symlink-free path of an existing node.
    pub fn realpath(&self, path: &str) -> Result<String, VfsError> {
        Ok(self.tree().resolve(path, true, "realpath")?.path)
    }

    /// Every regular file below `root`, without following symlinks.
    pub fn walk_files(&self, root: &str) -> Result<Vec<String>, VfsError> {
        let tree = self.tree();
        let start = tree.resolve(root, true, "scandir")?;
        if tree.children(start.id).is_none() {
            return Err(VfsError::enotdir("scandir", root));
        }
        let mut files: Vec<String> = tree
            .descendants(&start)
            .into_iter()
            .filter(|(_, id)| matches!(tree.get(*id).map(|n| &n.kind), Some(NodeKind::File(_))))
            .map(|(p, _)| p)
            .collect();
        files.sort();
        Ok(files)
    }

    // Mutations

    /// Create or truncate a file. The parent directory must exist.
    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<(), VfsError> {
        let mutation = self.tree().write(path, data.as_ref(), false)?;
        self.emit(&[mutation]);
        Ok(())
    }

    /// Append to a file, creating it if missing.
    pub fn append_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<(), VfsError> {
        let mutation = self.tree().write(path, data.as_ref(), true)?;
        self.emit(&[mutation]);
        Ok(())
    }

    pub fn mkdir(&self, path: &str, recursive: bool) -> Result<(), VfsError> {
        let mutations = self.tree().mkdir(path, recursive)?;
        self.emit(&mutations);
        Ok(())
    }

    /// `mkdir -p`.
    pub fn create_dir_all(&self, path: &str) -> Result<(), VfsError> {
        self.mkdir(path, true)
    }

    pub fn unlink(&self, path: &str) -> Result<(), VfsError> {
        let mutation = self.tree().unlink(path)?;
        self.emit(&[mutation]);
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<(), VfsError> {
        let mutation = self.tree().rmdir(path)?;
        self.emit(&[mutation]);
        Ok(())
    }

    /// Remove a file, symlink or directory (`rm`, optionally `-r`).
    pub fn remove(&self, path: &str, recursive: bool) -> Result<(), VfsError> {
        let mutation = self.tree().remove(path, recursive)?;
        self.emit(&[mutation]);
        Ok(())
    }

    /// Like [`Vfs::remove`] with `recursive`, but a missing path is not an error.
    pub fn remove_all(&self, path: &str) -> Result<(), VfsError> {
        match self.remove(path, true) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), VfsError> {
        let mutations = self.tree().rename(from, to)?;
        self.emit(&mutations);
        Ok(())
    }

    /// Create a symlink at `path` pointing to `target` (stored verbatim).
    pub fn symlink(&self, target: &str, path: &str) -> Result<(), VfsError> {
        let mutation = self.tree().symlink(target, path)?;
        self.emit(&[mutation]);
        Ok(())
    }

    /// Set the cosmetic mode bits of a node.
    pub fn set_mode(&self, path: &str, mode: u32) -> Result<(), VfsError> {
        let mut tree = self.tree();
        let resolved = tree.resolve(path, true, "chmod")?;
        let node = tree
            .get_mut(resolved.id)
            .ok_or_else(|| VfsError::enoent("chmod", path))?;
        node.mode = mode;
        Ok(())
    }

    pub fn copy_file(&self, src: &str, dst: &str) -> Result<(), VfsError> {
        let (data, mode) = {
            let tree = self.tree();
            let resolved = tree.resolve(src, true, "copyfile")?;
            let node = tree
                .get(resolved.id)
                .ok_or_else(|| VfsError::enoent("copyfile", src))?;
            match &node.kind {
                NodeKind::File(bytes) => (bytes.clone(), node.mode),
                _ => return Err(VfsError::eisdir("copyfile", src)),
            }
        };
        self.write_file(dst, data)?;
        self.set_mode(dst, mode)
    }

    /// Recursively copy a directory. Entries whose name matches `skip` are
    /// left out along with everything below them. Symlinks are copied as
    /// links.
    pub fn copy_dir(
        &self,
        src: &str,
        dst: &str,
        skip: &dyn Fn(&str) -> bool,
    ) -> Result<(), VfsError> {
        if !self.is_dir(src) {
            return Err(VfsError::enotdir("copyfile", src));
        }
        let src_real = self.realpath(src)?;
        let dst_norm = path::normalize(dst);
        if path::strip_ancestor(&dst_norm, &src_real).is_some() {
            return Err(VfsError::einval("copyfile", dst));
        }
        self.create_dir_all(dst)?;

        for entry in self.read_dir_entries(src)? {
            if skip(&entry.name) {
                continue;
            }
            let from = path::join(src, &entry.name);
            let to = path::join(dst, &entry.name);
            match entry.kind {
                FileKind::Directory => self.copy_dir(&from, &to, skip)?,
                FileKind::File => self.copy_file(&from, &to)?,
                FileKind::Symlink => {
                    let target = self.readlink(&from)?;
                    self.remove_all(&to)?;
                    self.symlink(&target, &to)?;
                }
            }
        }
        Ok(())
    }

    // Notification

    /// Watch a path. Events for the path itself carry its basename; events
    /// below a watched directory carry the path relative to it. Without
    /// `recursive` only direct children are reported.
    pub fn watch<F>(&self, path: &str, recursive: bool, callback: F) -> WatchHandle
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let watched = path::normalize(path);
        let id = self
            .shared
            .watch
            .add_watcher(watched.clone(), recursive, Arc::new(callback));
        WatchHandle {
            registry: Arc::downgrade(&self.shared.watch),
            path: watched,
            id,
        }
    }

    /// Receive a coarse event for every mutation anywhere in the tree.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&VfsEvent) + Send + Sync + 'static,
    {
        let id = self.shared.watch.add_listener(Arc::new(listener));
        Subscription {
            registry: Arc::downgrade(&self.shared.watch),
            id,
        }
    }

    // Snapshots

    /// Capture every node, parents before children.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        snapshot::capture(&self.tree())
    }

    /// Replace the whole tree with the contents of a snapshot.
    ///
    /// Listeners see a delete for every previous top-level entry followed by
    /// a change for every restored node.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), VfsError> {
        let rebuilt = snapshot::rebuild(snapshot)?;
        let mutations = {
            let mut tree = self.tree();
            let mut mutations: Vec<Mutation> = tree
                .children(node::ROOT)
                .map(|c| c.keys().map(|n| Mutation::removed(path::join("/", n))).collect())
                .unwrap_or_default();
            *tree = rebuilt;
            mutations.extend(
                snapshot
                    .entries
                    .iter()
                    .map(|e| Mutation::created(path::normalize(&e.path), e.kind)),
            );
            mutations
        };
        self.emit(&mutations);
        Ok(())
    }
}
