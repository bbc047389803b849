//! POSIX path helpers for the virtual filesystem.
//!
//! VFS paths are always `/`-separated and absolute once normalized. Relative
//! inputs are interpreted against the root.

/// Normalize a path: collapse duplicate separators, resolve `.` and `..`.
///
/// `..` never climbs above the root.
#[must_use]
pub fn normalize(path: &str) -> String {
    let segments = segments(path);
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Split a path into normalized segments (no empty, `.` or `..` entries).
#[must_use]
pub fn segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Join `rel` onto `base`. An absolute `rel` replaces `base`.
#[must_use]
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        normalize(rel)
    } else {
        normalize(&format!("{base}/{rel}"))
    }
}

/// The parent directory of a normalized path (`/` for top-level entries).
#[must_use]
pub fn dirname(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// The final segment of a path (empty for the root).
#[must_use]
pub fn basename(path: &str) -> String {
    segments(path).last().map(|s| (*s).to_string()).unwrap_or_default()
}

/// Number of segments below the root.
#[must_use]
pub fn depth(path: &str) -> usize {
    segments(path).len()
}

/// If `path` lies strictly below `ancestor`, return the relative remainder.
#[must_use]
pub fn strip_ancestor<'a>(path: &'a str, ancestor: &str) -> Option<&'a str> {
    if ancestor == "/" {
        return path.strip_prefix('/').filter(|rest| !rest.is_empty());
    }
    path.strip_prefix(ancestor)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

/// Compute a relative path from directory `from` to `to`.
#[must_use]
pub fn relative(from: &str, to: &str) -> String {
    let from_segments = segments(from);
    let to_segments = segments(to);
    let common = from_segments
        .iter()
        .zip(&to_segments)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = vec![".."; from_segments.len() - common];
    parts.extend(&to_segments[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
