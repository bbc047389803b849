//! Foreign lockfile replay.
//!
//! npm (`package-lock.json` v1-v3, `npm-shrinkwrap.json`) and bun
//! (`bun.lock`) lockfiles are normalized into [`LockInstallEntry`] values
//! that the installer materializes in ascending nesting depth.

pub mod bun;
pub mod npm;

use super::platform::{allows_list, current_cpu, current_os};
use crate::vfs::{path as vpath, Vfs};
use std::fmt;
use tracing::{debug, warn};

/// Lockfile error codes.
pub mod codes {
    /// Lockfile is not valid JSON (or JSONC for bun).
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile parsed but its structure is unusable.
    pub const PKG_LOCK_INVALID: &str = "PKG_LOCK_INVALID";
    /// Lockfile version not understood.
    pub const PKG_LOCK_VERSION_UNSUPPORTED: &str = "PKG_LOCK_VERSION_UNSUPPORTED";
}

/// Lockfile error with a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}

/// Supported lockfile dialects, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockfileKind {
    PackageLock,
    Shrinkwrap,
    Bun,
}

impl LockfileKind {
    pub const ALL: [Self; 3] = [Self::PackageLock, Self::Shrinkwrap, Self::Bun];

    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PackageLock => "package-lock.json",
            Self::Shrinkwrap => "npm-shrinkwrap.json",
            Self::Bun => "bun.lock",
        }
    }
}

/// One package placement from a lockfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInstallEntry {
    /// Nesting key, e.g. `node_modules/app/node_modules/shared`.
    pub key: String,
    /// Absolute VFS directory the package lands in.
    pub install_path: String,
    /// Name the package is installed under.
    pub name: String,
    pub version: String,
    /// Registry name when installed under an alias.
    pub alias_for: Option<String>,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub dev: bool,
    pub optional: bool,
    /// Symlink to `local_source` instead of copying.
    pub link: bool,
    /// Absolute VFS directory for `file:`, `link:` and workspace entries.
    pub local_source: Option<String>,
    /// Declared `os` / `cpu` constraints.
    pub os: Vec<String>,
    pub cpu: Vec<String>,
}

impl LockInstallEntry {
    /// Number of `node_modules` levels in the key.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.key.split('/').filter(|s| *s == "node_modules").count()
    }

    /// Name to query the registry with.
    #[must_use]
    pub fn registry_name(&self) -> &str {
        self.alias_for.as_deref().unwrap_or(&self.name)
    }

    /// Whether the entry's platform constraints admit this host.
    #[must_use]
    pub fn supports_host(&self) -> bool {
        allows_list(&self.os, current_os()) && allows_list(&self.cpu, current_cpu())
    }
}

/// Parsed lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLockfile {
    pub kind: LockfileKind,
    pub path: String,
    pub entries: Vec<LockInstallEntry>,
}

impl ParsedLockfile {
    /// Entries grouped by depth, shallowest first.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<&LockInstallEntry>> {
        let mut levels: Vec<Vec<&LockInstallEntry>> = Vec::new();
        for entry in &self.entries {
            let depth = entry.depth();
            match levels.last_mut() {
                Some(level) if level.first().is_some_and(|e| e.depth() == depth) => {
                    level.push(entry);
                }
                _ => levels.push(vec![entry]),
            }
        }
        levels
    }
}

/// Stable sort by depth, then key.
pub(crate) fn sort_by_depth(entries: &mut [LockInstallEntry]) {
    entries.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.key.cmp(&b.key)));
}

/// `node_modules/a/node_modules/b` for the name chain `[a, b]`.
pub(crate) fn nesting_key<S: AsRef<str>>(chain: &[S]) -> String {
    chain
        .iter()
        .map(|name| format!("node_modules/{}", name.as_ref()))
        .collect::<Vec<_>>()
        .join("/")
}

/// Find the first lockfile present in `project_dir`.
#[must_use]
pub fn detect(vfs: &Vfs, project_dir: &str) -> Option<(LockfileKind, String)> {
    LockfileKind::ALL.into_iter().find_map(|kind| {
        let path = vpath::join(project_dir, kind.file_name());
        vfs.is_file(&path).then_some((kind, path))
    })
}

/// Parse lockfile `content` of the given dialect.
pub fn parse(
    kind: LockfileKind,
    content: &str,
    project_dir: &str,
) -> Result<Vec<LockInstallEntry>, LockfileError> {
    let mut entries = match kind {
        LockfileKind::PackageLock | LockfileKind::Shrinkwrap => npm::parse(content, project_dir)?,
        LockfileKind::Bun => bun::parse(content, project_dir)?,
    };
    sort_by_depth(&mut entries);
    Ok(entries)
}

/// Detect and parse the project's lockfile.
///
/// A malformed lockfile is logged and treated as absent.
#[must_use]
pub fn load(vfs: &Vfs, project_dir: &str) -> Option<ParsedLockfile> {
    let (kind, path) = detect(vfs, project_dir)?;
    let content = match vfs.read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path, error = %e, "failed to read lockfile");
            return None;
        }
    };
    match parse(kind, &content, project_dir) {
        Ok(entries) => {
            debug!(path = %path, entries = entries.len(), "loaded lockfile");
            Some(ParsedLockfile {
                kind,
                path,
                entries,
            })
        }
        Err(e) => {
            warn!(path = %path, error = %e, "ignoring unusable lockfile");
            None
        }
    }
}
