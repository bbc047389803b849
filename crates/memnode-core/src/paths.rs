use crate::config::Channel;
use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Find the project root by walking up from `cwd` looking for `package.json` or `.git`.
///
/// Returns the first directory containing either marker, or `None` if neither is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() || current.join(".git").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the cache directory for memnode.
///
/// - Linux: `$XDG_CACHE_HOME/memnode/v{N}/{channel}` or `~/.cache/memnode/v{N}/{channel}`
/// - macOS: `~/Library/Caches/memnode/v{N}/{channel}`
/// - Windows: `%LOCALAPPDATA%\memnode\v{N}\{channel}`
#[must_use]
pub fn cache_dir(channel: Channel) -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".memnode-cache"),
                |p| p.join(".cache").join("memnode"),
            )
        },
        |p| p.join("memnode"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
        .join(channel.as_str())
}

/// Directory of the persistent archive store.
#[must_use]
pub fn archive_cache_dir(channel: Channel) -> PathBuf {
    cache_dir(channel).join("archives")
}
