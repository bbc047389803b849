use std::fmt::Write;

/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for cache directories and archive cache keys.
/// Bump this when changing formats that would break compatibility.
pub const SCHEMA_VERSION: u32 = 1;

/// Returns a formatted version string including build metadata if available.
#[must_use]
pub fn version_string() -> String {
    let mut s = format!("memnode {VERSION}");

    if let Some(hash) = option_env!("MEMNODE_BUILD_GIT_HASH") {
        let _ = write!(s, " ({hash})");
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_version() {
        let vs = version_string();
        assert!(vs.contains(VERSION));
        assert!(vs.starts_with("memnode "));
    }

    #[test]
    fn test_schema_version_appears_in_cache_paths() {
        let dir = crate::paths::cache_dir(crate::config::Channel::Dev);
        assert!(dir.to_string_lossy().contains(&format!("v{SCHEMA_VERSION}")));
    }
}
