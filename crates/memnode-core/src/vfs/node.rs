//! Arena-backed directory tree.
//!
//! Nodes live in a slot vector addressed by [`NodeId`]; directories map child
//! names to handles. Removing a subtree frees its slots for reuse, so a stale
//! handle simply resolves to nothing.

use super::error::VfsError;
use super::path;
use super::watch::Mutation;
use super::FileKind;
use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

/// Maximum number of symlinks followed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 40;

pub(crate) const DEFAULT_FILE_MODE: u32 = 0o644;
pub(crate) const DEFAULT_DIR_MODE: u32 = 0o755;
pub(crate) const DEFAULT_LINK_MODE: u32 = 0o777;

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

pub(crate) const ROOT: NodeId = NodeId(0);

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    File(Vec<u8>),
    Directory(BTreeMap<String, NodeId>),
    Symlink(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub kind: NodeKind,
    pub mtime: SystemTime,
    pub mode: u32,
}

impl Node {
    pub fn file(data: Vec<u8>) -> Self {
        Self {
            kind: NodeKind::File(data),
            mtime: SystemTime::now(),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: NodeKind::Directory(BTreeMap::new()),
            mtime: SystemTime::now(),
            mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn symlink(target: String) -> Self {
        Self {
            kind: NodeKind::Symlink(target),
            mtime: SystemTime::now(),
            mode: DEFAULT_LINK_MODE,
        }
    }

    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            NodeKind::File(_) => FileKind::File,
            NodeKind::Directory(_) => FileKind::Directory,
            NodeKind::Symlink(_) => FileKind::Symlink,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Directory(_) => 0,
            NodeKind::Symlink(target) => target.len() as u64,
        }
    }
}

/// A path resolved to a node, with its canonical (symlink-free) path.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub id: NodeId,
    pub path: String,
}

/// The parent directory of a path plus the final segment.
#[derive(Debug, Clone)]
pub(crate) struct ParentRef {
    pub id: NodeId,
    pub path: String,
    pub name: String,
}

impl ParentRef {
    pub fn full_path(&self) -> String {
        path::join(&self.path, &self.name)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tree {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Node::directory())],
            free: Vec::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn children(&self, id: NodeId) -> Option<&BTreeMap<String, NodeId>> {
        match &self.get(id)?.kind {
            NodeKind::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)?.get(name).copied()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        }
    }

    /// Release a node and everything below it.
    pub fn free_subtree(&mut self, id: NodeId) {
        if id == ROOT {
            return;
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.slots.get_mut(current.0).and_then(Option::take) {
                if let NodeKind::Directory(children) = node.kind {
                    stack.extend(children.into_values());
                }
                self.free.push(current.0);
            }
        }
    }

    pub fn insert_child(&mut self, parent: NodeId, name: &str, node: Node) -> Option<NodeId> {
        let id = self.alloc(node);
        self.link_child(parent, name, id)?;
        Some(id)
    }

    fn link_child(&mut self, parent: NodeId, name: &str, child: NodeId) -> Option<()> {
        let node = self.get_mut(parent)?;
        match &mut node.kind {
            NodeKind::Directory(children) => {
                children.insert(name.to_string(), child);
                node.mtime = SystemTime::now();
                Some(())
            }
            _ => None,
        }
    }

    fn unlink_child(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        let node = self.get_mut(parent)?;
        match &mut node.kind {
            NodeKind::Directory(children) => {
                let removed = children.remove(name);
                node.mtime = SystemTime::now();
                removed
            }
            _ => None,
        }
    }

    /// Resolve a path to a node.
    ///
    /// Intermediate symlinks are always followed; the final one only when
    /// `follow_last` is set.
    pub fn resolve(
        &self,
        input: &str,
        follow_last: bool,
        syscall: &'static str,
    ) -> Result<Resolved, VfsError> {
        let mut pending: VecDeque<String> = path::segments(input)
            .into_iter()
            .map(String::from)
            .collect();
        let mut stack: Vec<(String, NodeId)> = Vec::new();
        let mut hops = 0usize;

        while let Some(segment) = pending.pop_front() {
            match segment.as_str() {
                "" | "." => continue,
                ".." => {
                    stack.pop();
                    continue;
                }
                _ => {}
            }

            let parent = stack.last().map_or(ROOT, |(_, id)| *id);
            let children = self
                .children(parent)
                .ok_or_else(|| VfsError::enotdir(syscall, input))?;
            let child = *children
                .get(&segment)
                .ok_or_else(|| VfsError::enoent(syscall, input))?;
            let node = self
                .get(child)
                .ok_or_else(|| VfsError::enoent(syscall, input))?;

            if let NodeKind::Symlink(target) = &node.kind {
                if !pending.is_empty() || follow_last {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(VfsError::eloop(syscall, input));
                    }
                    if target.starts_with('/') {
                        stack.clear();
                    }
                    for part in target.rsplit('/') {
                        if !part.is_empty() && part != "." {
                            pending.push_front(part.to_string());
                        }
                    }
                    continue;
                }
            }

            stack.push((segment, child));
        }

        let id = stack.last().map_or(ROOT, |(_, id)| *id);
        let mut resolved_path = String::new();
        for (name, _) in &stack {
            resolved_path.push('/');
            resolved_path.push_str(name);
        }
        if resolved_path.is_empty() {
            resolved_path.push('/');
        }
        Ok(Resolved {
            id,
            path: resolved_path,
        })
    }

    /// Resolve the parent directory of `input` (following symlinks).
    ///
    /// Fails with `EINVAL` for the root itself.
    pub fn resolve_parent(&self, input: &str, syscall: &'static str) -> Result<ParentRef, VfsError> {
        let normalized = path::normalize(input);
        if normalized == "/" {
            return Err(VfsError::einval(syscall, &normalized));
        }
        let name = path::basename(&normalized);
        let parent = self.resolve(&path::dirname(&normalized), true, syscall)
            .map_err(|e| VfsError::new(e.code, syscall, input))?;
        if self.children(parent.id).is_none() {
            return Err(VfsError::enotdir(syscall, input));
        }
        Ok(ParentRef {
            id: parent.id,
            path: parent.path,
            name,
        })
    }

    /// Find where a write to `input` lands, following a symlink at the final
    /// segment even when its target does not exist yet.
    fn resolve_for_write(
        &self,
        input: &str,
        syscall: &'static str,
    ) -> Result<(ParentRef, Option<NodeId>), VfsError> {
        let mut current = path::normalize(input);
        for _ in 0..=MAX_SYMLINK_HOPS {
            let parent = self.resolve_parent(&current, syscall)?;
            match self.lookup(parent.id, &parent.name) {
                Some(id) => {
                    if let Some(NodeKind::Symlink(target)) = self.get(id).map(|n| &n.kind) {
                        current = path::join(&parent.path, target);
                        continue;
                    }
                    return Ok((parent, Some(id)));
                }
                None => return Ok((parent, None)),
            }
        }
        Err(VfsError::eloop(syscall, input))
    }

    pub fn write(&mut self, input: &str, data: &[u8], append: bool) -> Result<Mutation, VfsError> {
        let (parent, existing) = self.resolve_for_write(input, "open")?;
        let full = parent.full_path();

        if let Some(id) = existing {
            let node = self
                .get_mut(id)
                .ok_or_else(|| VfsError::enoent("open", input))?;
            match &mut node.kind {
                NodeKind::File(bytes) => {
                    if append {
                        bytes.extend_from_slice(data);
                    } else {
                        *bytes = data.to_vec();
                    }
                    node.mtime = SystemTime::now();
                    Ok(Mutation::modified(full, FileKind::File))
                }
                NodeKind::Directory(_) => Err(VfsError::eisdir("open", input)),
                NodeKind::Symlink(_) => Err(VfsError::eloop("open", input)),
            }
        } else {
            self.insert_child(parent.id, &parent.name, Node::file(data.to_vec()))
                .ok_or_else(|| VfsError::enotdir("open", input))?;
            Ok(Mutation::created(full, FileKind::File))
        }
    }

    pub fn mkdir(&mut self, input: &str, recursive: bool) -> Result<Vec<Mutation>, VfsError> {
        let normalized = path::normalize(input);
        if normalized == "/" {
            return if recursive {
                Ok(Vec::new())
            } else {
                Err(VfsError::eexist("mkdir", &normalized))
            };
        }

        if !recursive {
            let parent = self.resolve_parent(&normalized, "mkdir")?;
            if self.lookup(parent.id, &parent.name).is_some() {
                return Err(VfsError::eexist("mkdir", input));
            }
            self.insert_child(parent.id, &parent.name, Node::directory())
                .ok_or_else(|| VfsError::enotdir("mkdir", input))?;
            return Ok(vec![Mutation::created(
                parent.full_path(),
                FileKind::Directory,
            )]);
        }

        let segments: Vec<String> = path::segments(&normalized)
            .into_iter()
            .map(String::from)
            .collect();
        let last = segments.len() - 1;
        let mut mutations = Vec::new();
        let mut current = ROOT;
        let mut current_path = String::new();

        for (idx, segment) in segments.iter().enumerate() {
            let candidate = format!("{current_path}/{segment}");
            match self.lookup(current, segment) {
                Some(_) => {
                    let resolved = self.resolve(&candidate, true, "mkdir")?;
                    if self.children(resolved.id).is_none() {
                        return Err(if idx == last {
                            VfsError::eexist("mkdir", input)
                        } else {
                            VfsError::enotdir("mkdir", input)
                        });
                    }
                    current = resolved.id;
                    current_path = if resolved.path == "/" {
                        String::new()
                    } else {
                        resolved.path
                    };
                }
                None => {
                    current = self
                        .insert_child(current, segment, Node::directory())
                        .ok_or_else(|| VfsError::enotdir("mkdir", input))?;
                    mutations.push(Mutation::created(candidate.clone(), FileKind::Directory));
                    current_path = candidate;
                }
            }
        }

        Ok(mutations)
    }

    pub fn unlink(&mut self, input: &str) -> Result<Mutation, VfsError> {
        let parent = self.resolve_parent(input, "unlink")?;
        let id = self
            .lookup(parent.id, &parent.name)
            .ok_or_else(|| VfsError::enoent("unlink", input))?;
        if self.children(id).is_some() {
            return Err(VfsError::eisdir("unlink", input));
        }
        self.unlink_child(parent.id, &parent.name);
        self.free_subtree(id);
        Ok(Mutation::removed(parent.full_path()))
    }

    pub fn rmdir(&mut self, input: &str) -> Result<Mutation, VfsError> {
        let parent = self.resolve_parent(input, "rmdir")?;
        let id = self
            .lookup(parent.id, &parent.name)
            .ok_or_else(|| VfsError::enoent("rmdir", input))?;
        match self.children(id) {
            None => return Err(VfsError::enotdir("rmdir", input)),
            Some(children) if !children.is_empty() => {
                return Err(VfsError::enotempty("rmdir", input));
            }
            Some(_) => {}
        }
        self.unlink_child(parent.id, &parent.name);
        self.free_subtree(id);
        Ok(Mutation::removed(parent.full_path()))
    }

    pub fn remove(&mut self, input: &str, recursive: bool) -> Result<Mutation, VfsError> {
        let parent = self.resolve_parent(input, "rm")?;
        let id = self
            .lookup(parent.id, &parent.name)
            .ok_or_else(|| VfsError::enoent("rm", input))?;
        if let Some(children) = self.children(id) {
            if !recursive && !children.is_empty() {
                return Err(VfsError::eisdir("rm", input));
            }
        }
        self.unlink_child(parent.id, &parent.name);
        self.free_subtree(id);
        Ok(Mutation::removed(parent.full_path()))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<Vec<Mutation>, VfsError> {
        let src_parent = self.resolve_parent(from, "rename")?;
        let src = self
            .lookup(src_parent.id, &src_parent.name)
            .ok_or_else(|| VfsError::enoent("rename", from))?;
        let dst_parent = self.resolve_parent(to, "rename")?;

        let src_full = src_parent.full_path();
        let dst_full = dst_parent.full_path();
        if src_full == dst_full {
            return Ok(Vec::new());
        }

        let src_is_dir = self.children(src).is_some();
        if src_is_dir && path::strip_ancestor(&dst_full, &src_full).is_some() {
            return Err(VfsError::einval("rename", to));
        }

        if let Some(dst) = self.lookup(dst_parent.id, &dst_parent.name) {
            match self.children(dst) {
                Some(children) => {
                    if !src_is_dir {
                        return Err(VfsError::eisdir("rename", to));
                    }
                    if !children.is_empty() {
                        return Err(VfsError::enotempty("rename", to));
                    }
                }
                None if src_is_dir => return Err(VfsError::enotdir("rename", to)),
                None => {}
            }
            self.unlink_child(dst_parent.id, &dst_parent.name);
            self.free_subtree(dst);
        }

        self.unlink_child(src_parent.id, &src_parent.name);
        self.link_child(dst_parent.id, &dst_parent.name, src)
            .ok_or_else(|| VfsError::enotdir("rename", to))?;

        let kind = self.get(src).map_or(FileKind::File, Node::file_kind);
        if let Some(node) = self.get_mut(src) {
            node.mtime = SystemTime::now();
        }
        Ok(vec![
            Mutation::removed(src_full),
            Mutation::created(dst_full, kind),
        ])
    }

    pub fn symlink(&mut self, target: &str, input: &str) -> Result<Mutation, VfsError> {
        let parent = self.resolve_parent(input, "symlink")?;
        if self.lookup(parent.id, &parent.name).is_some() {
            return Err(VfsError::eexist("symlink", input));
        }
        self.insert_child(parent.id, &parent.name, Node::symlink(target.to_string()))
            .ok_or_else(|| VfsError::enotdir("symlink", input))?;
        Ok(Mutation::created(parent.full_path(), FileKind::Symlink))
    }

    /// Every node below `start` with its path, parents before children.
    pub fn descendants(&self, start: &Resolved) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(start.path.clone(), start.id)]);
        while let Some((dir_path, id)) = queue.pop_front() {
            let Some(children) = self.children(id) else {
                continue;
            };
            for (name, child) in children {
                let child_path = path::join(&dir_path, name);
                queue.push_back((child_path.clone(), *child));
                out.push((child_path, *child));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::error::ErrorCode;

    #[test]
    fn test_freed_slots_are_reused() {
        let mut tree = Tree::new();
        tree.mkdir("/a", false).unwrap();
        tree.write("/a/f", b"x", false).unwrap();
        let before = tree.slots.len();
        tree.remove("/a", true).unwrap();
        tree.mkdir("/b", false).unwrap();
        assert_eq!(tree.slots.len(), before);
    }

    #[test]
    fn test_resolve_through_relative_symlink() {
        let mut tree = Tree::new();
        tree.mkdir("/pkg/lib", true).unwrap();
        tree.write("/pkg/lib/index.js", b"1", false).unwrap();
        tree.symlink("pkg/lib", "/link").unwrap();

        let resolved = tree.resolve("/link/index.js", true, "open").unwrap();
        assert_eq!(resolved.path, "/pkg/lib/index.js");
    }

    #[test]
    fn test_parent_dir_through_symlink_is_physical() {
        let mut tree = Tree::new();
        tree.mkdir("/real/inner", true).unwrap();
        tree.symlink("/real/inner", "/alias").unwrap();
        let resolved = tree.resolve("/alias", true, "stat").unwrap();
        assert_eq!(resolved.path, "/real/inner");
    }

    #[test]
    fn test_file_as_intermediate_is_enotdir() {
        let mut tree = Tree::new();
        tree.write("/file", b"x", false).unwrap();
        let err = tree.resolve("/file/child", true, "stat").unwrap_err();
        assert_eq!(err.code, ErrorCode::Enotdir);
    }
}
