//! Whole-tree snapshots.
//!
//! A snapshot lists every node as `(path, kind, content | target)` ordered by
//! ascending depth, so a restore can always create parents before children.
//! Snapshots serialize with serde (file content as base64) and are how a tree
//! crosses an execution-context boundary.

use super::error::VfsError;
use super::node::{NodeKind, Resolved, Tree, ROOT};
use super::path;
use super::FileKind;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One serialized node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub kind: FileKind,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub mode: u32,
    #[serde(default)]
    pub mtime_ms: u64,
}

/// A serialized filesystem tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Serialize to JSON bytes.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse from JSON bytes.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) fn capture(tree: &Tree) -> Snapshot {
    let root = Resolved {
        id: ROOT,
        path: "/".to_string(),
    };
    let mut entries: Vec<SnapshotEntry> = tree
        .descendants(&root)
        .into_iter()
        .filter_map(|(node_path, id)| {
            let node = tree.get(id)?;
            let (content, target) = match &node.kind {
                NodeKind::File(bytes) => (Some(bytes.clone()), None),
                NodeKind::Directory(_) => (None, None),
                NodeKind::Symlink(target) => (None, Some(target.clone())),
            };
            Some(SnapshotEntry {
                path: node_path,
                kind: node.file_kind(),
                content,
                target,
                mode: node.mode,
                mtime_ms: to_millis(node.mtime),
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        path::depth(&a.path)
            .cmp(&path::depth(&b.path))
            .then_with(|| a.path.cmp(&b.path))
    });
    Snapshot { entries }
}

pub(crate) fn rebuild(snapshot: &Snapshot) -> Result<Tree, VfsError> {
    let mut ordered: Vec<&SnapshotEntry> = snapshot.entries.iter().collect();
    ordered.sort_by_key(|e| path::depth(&e.path));

    let mut tree = Tree::new();
    for entry in ordered {
        if path::normalize(&entry.path) == "/" {
            continue;
        }
        match entry.kind {
            FileKind::Directory => {
                tree.mkdir(&entry.path, false)?;
            }
            FileKind::File => {
                let parent = tree.resolve_parent(&entry.path, "open")?;
                tree.insert_child(
                    parent.id,
                    &parent.name,
                    super::node::Node::file(entry.content.clone().unwrap_or_default()),
                )
                .ok_or_else(|| VfsError::enotdir("open", &entry.path))?;
            }
            FileKind::Symlink => {
                let target = entry
                    .target
                    .as_deref()
                    .ok_or_else(|| VfsError::einval("symlink", &entry.path))?;
                tree.symlink(target, &entry.path)?;
            }
        }

        let resolved = tree.resolve(&entry.path, false, "chmod")?;
        if let Some(node) = tree.get_mut(resolved.id) {
            node.mode = entry.mode;
            if entry.mtime_ms > 0 {
                node.mtime = UNIX_EPOCH + Duration::from_millis(entry.mtime_ms);
            }
        }
    }
    Ok(tree)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
