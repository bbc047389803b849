//! `os` / `cpu` constraints in Node's naming.

use serde_json::Value;

/// The host OS as Node names it (`process.platform`).
#[must_use]
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// The host CPU as Node names it (`process.arch`).
#[must_use]
pub fn current_cpu() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// Whether a constraint list admits `current`.
///
/// Accepts a string or an array; `!name` entries exclude. Without positive
/// entries everything not excluded is allowed.
#[must_use]
pub fn allows(constraint: Option<&Value>, current: &str) -> bool {
    let list: Vec<&str> = match constraint {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => return true,
    };
    allows_list(&list, current)
}

/// Entries of a string-or-array constraint.
#[must_use]
pub fn constraint_list(constraint: Option<&Value>) -> Vec<String> {
    match constraint {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// [`allows`] over already-extracted entries.
#[must_use]
pub fn allows_list<S: AsRef<str>>(list: &[S], current: &str) -> bool {
    let mut has_positive = false;
    for entry in list {
        let entry = entry.as_ref();
        if let Some(excluded) = entry.strip_prefix('!') {
            if excluded == current {
                return false;
            }
        } else {
            has_positive = true;
            if entry == current {
                return true;
            }
        }
    }
    !has_positive
}
