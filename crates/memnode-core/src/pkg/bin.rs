//! `node_modules/.bin` shims and entry-point checks.

use super::error::PkgError;
use super::manifest::{bin_entries, PackageJson};
use crate::vfs::{path as vpath, FileKind, Vfs};
use regex_lite::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Extensions tried, in order, when a module path has none.
const RESOLVE_EXTENSIONS: [&str; 5] = ["", ".js", ".cjs", ".mjs", ".json"];

/// Mode given to shims.
pub const SHIM_MODE: u32 = 0o755;

/// Resolve a module path the way Node does for files: exact match, then
/// known extensions, then `index.js` inside a directory.
#[must_use]
pub fn resolve_module_file(vfs: &Vfs, base: &str) -> Option<String> {
    let base = vpath::normalize(base);
    RESOLVE_EXTENSIONS
        .iter()
        .map(|ext| format!("{base}{ext}"))
        .chain(std::iter::once(vpath::join(&base, "index.js")))
        .find(|candidate| vfs.is_file(candidate))
}

fn relative_import_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:require\s*\(\s*|import\s*\(\s*|from\s+|import\s+)["'](\.\.?/[^"']+)["']"#)
            .ok()
    })
    .as_ref()
}

/// Relative `require`/`import` specifiers in `file` that do not resolve.
#[must_use]
pub fn missing_relative_imports(vfs: &Vfs, file: &str) -> Vec<String> {
    let Ok(source) = vfs.read_to_string(file) else {
        return Vec::new();
    };
    let Some(re) = relative_import_re() else {
        return Vec::new();
    };
    let dir = vpath::dirname(file);
    let mut missing: Vec<String> = re
        .captures_iter(&source)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|spec| resolve_module_file(vfs, &vpath::join(&dir, spec)).is_none())
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Declared files of the package in `dir` that are absent: entry points
/// that don't resolve, and sources that bin scripts import but that were
/// never built.
#[must_use]
pub fn missing_artifacts(vfs: &Vfs, dir: &str, manifest: &PackageJson) -> Vec<String> {
    let mut missing = Vec::new();
    for entry in manifest.declared_entry_points() {
        if resolve_module_file(vfs, &vpath::join(dir, &entry)).is_none() {
            missing.push(entry);
        }
    }
    for script in manifest.bin_entries().into_values() {
        let path = vpath::join(dir, &script);
        if vfs.is_file(&path) {
            missing.extend(missing_relative_imports(vfs, &path));
        }
    }
    missing
}

fn valid_command(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Shim body forwarding to an absolute entry file.
#[must_use]
pub fn shim_source(target: &str) -> String {
    let quoted = serde_json::to_string(target).unwrap_or_else(|_| format!("\"{target}\""));
    format!("#!/usr/bin/env node\nrequire({quoted});\n")
}

/// Package directories directly under `node_modules` (scoped ones included).
fn top_level_packages(vfs: &Vfs, node_modules: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Ok(entries) = vfs.read_dir_entries(node_modules) else {
        return out;
    };
    for entry in entries {
        if entry.name.starts_with('.') || entry.kind == FileKind::File {
            continue;
        }
        let dir = vpath::join(node_modules, &entry.name);
        if entry.name.starts_with('@') {
            for scoped in vfs.read_dir_entries(&dir).unwrap_or_default() {
                if scoped.kind != FileKind::File {
                    out.push((
                        format!("{}/{}", entry.name, scoped.name),
                        vpath::join(&dir, &scoped.name),
                    ));
                }
            }
        } else {
            out.push((entry.name, dir));
        }
    }
    out
}

/// Write `.bin/<cmd>` shims for every top-level package exposing `bin`.
///
/// Returns the command names written, sorted.
pub fn link_bins(vfs: &Vfs, node_modules: &str) -> Result<Vec<String>, PkgError> {
    let bin_dir = vpath::join(node_modules, ".bin");
    let mut commands = Vec::new();

    for (name, dir) in top_level_packages(vfs, node_modules) {
        let Ok(manifest) = PackageJson::read(vfs, &dir) else {
            continue;
        };
        let pkg_name = manifest.name.clone().unwrap_or(name);
        for (command, script) in bin_entries(&pkg_name, manifest.bin.as_ref()) {
            if !valid_command(&command) {
                warn!(package = %pkg_name, command = %command, "ignoring invalid bin name");
                continue;
            }
            let Some(target) = resolve_module_file(vfs, &vpath::join(&dir, &script)) else {
                debug!(package = %pkg_name, script = %script, "bin target missing; no shim");
                continue;
            };
            let shim = vpath::join(&bin_dir, &command);
            vfs.create_dir_all(&bin_dir)?;
            vfs.remove_all(&shim)?;
            vfs.write_file(&shim, shim_source(&target))?;
            vfs.set_mode(&shim, SHIM_MODE)?;
            commands.push(command);
        }
    }

    commands.sort();
    commands.dedup();
    if !commands.is_empty() {
        debug!(dir = %bin_dir, count = commands.len(), "linked bins");
    }
    Ok(commands)
}
