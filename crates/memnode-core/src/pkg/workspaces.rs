//! Workspace support for monorepos.
//!
//! Patterns come from `package.json#workspaces` (array or `{ packages }`)
//! and from `pnpm-workspace.yaml`. A leading `!` excludes.

use super::manifest::PackageJson;
use crate::vfs::{path as vpath, FileKind, Vfs};
use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Traversal depth used when a pattern contains `**`.
const MAX_GLOBSTAR_DEPTH: usize = 8;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// A discovered workspace package.
#[derive(Debug, Clone)]
pub struct WorkspacePackage {
    /// Package name from package.json
    pub name: String,
    /// Version from package.json
    pub version: String,
    /// Absolute VFS directory
    pub dir: String,
    pub manifest: PackageJson,
}

#[derive(Debug, Default, Deserialize)]
struct PnpmWorkspace {
    #[serde(default)]
    packages: Vec<String>,
}

/// Compiled include/exclude patterns relative to a root.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePatterns {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    max_depth: usize,
}

impl WorkspacePatterns {
    /// Compile raw patterns; invalid ones are logged and dropped.
    #[must_use]
    pub fn new<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut out = Self::default();
        for pattern in raw {
            let pattern = pattern.as_ref().trim();
            let (negated, body) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            let body = body.trim_start_matches("./").trim_end_matches('/');
            if body.is_empty() {
                continue;
            }
            let Ok(compiled) = Pattern::new(body) else {
                debug!(pattern, "ignoring invalid workspace pattern");
                continue;
            };
            if negated {
                out.exclude.push(compiled);
            } else {
                let depth = if body.contains("**") {
                    MAX_GLOBSTAR_DEPTH
                } else {
                    body.split('/').count()
                };
                out.max_depth = out.max_depth.max(depth);
                out.include.push(compiled);
            }
        }
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Whether a root-relative directory path is a member location.
    #[must_use]
    pub fn matches(&self, relative: &str) -> bool {
        self.include
            .iter()
            .any(|p| p.matches_with(relative, MATCH_OPTIONS))
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }
}

/// Workspace root with its discovered members.
#[derive(Debug, Clone)]
pub struct Workspaces {
    pub root: String,
    pub patterns: WorkspacePatterns,
    /// Members by declared name.
    pub packages: BTreeMap<String, WorkspacePackage>,
}

impl Workspaces {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkspacePackage> {
        self.packages.get(name)
    }

    #[must_use]
    pub fn is_workspace_package(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Whether `dir` is covered by this root's patterns.
    #[must_use]
    pub fn covers(&self, dir: &str) -> bool {
        let dir = vpath::normalize(dir);
        vpath::strip_ancestor(&dir, &self.root).is_some_and(|rel| self.patterns.matches(rel))
    }
}

/// Raw workspace patterns declared in `dir`.
#[must_use]
pub fn workspace_patterns(vfs: &Vfs, dir: &str) -> Vec<String> {
    let mut patterns = PackageJson::read(vfs, dir)
        .map(|m| m.workspace_patterns())
        .unwrap_or_default();
    if let Ok(text) = vfs.read_to_string(&vpath::join(dir, "pnpm-workspace.yaml")) {
        match serde_yaml::from_str::<PnpmWorkspace>(&text) {
            Ok(pnpm) => patterns.extend(pnpm.packages),
            Err(e) => debug!(dir, error = %e, "ignoring malformed pnpm-workspace.yaml"),
        }
    }
    patterns
}

/// Discover workspace members below `root`.
///
/// Returns `None` when `root` declares no workspace patterns.
#[must_use]
pub fn discover(vfs: &Vfs, root: &str) -> Option<Workspaces> {
    let root = vpath::normalize(root);
    let patterns = WorkspacePatterns::new(&workspace_patterns(vfs, &root));
    if patterns.is_empty() {
        return None;
    }

    let mut packages = BTreeMap::new();
    let mut dirs = Vec::new();
    collect_dirs(vfs, &root, "", patterns.max_depth, &mut dirs);

    for rel in dirs {
        if !patterns.matches(&rel) {
            continue;
        }
        let dir = vpath::join(&root, &rel);
        let Ok(manifest) = PackageJson::read(vfs, &dir) else {
            continue;
        };
        let Some(name) = manifest.name.clone().filter(|n| !n.is_empty()) else {
            debug!(dir = %dir, "workspace member without a name");
            continue;
        };
        if packages.contains_key(&name) {
            debug!(name = %name, dir = %dir, "duplicate workspace name; keeping first");
            continue;
        }
        packages.insert(
            name.clone(),
            WorkspacePackage {
                version: manifest.version_or_default().to_string(),
                name,
                dir,
                manifest,
            },
        );
    }

    Some(Workspaces {
        root,
        patterns,
        packages,
    })
}

/// Root-relative directories up to `depth` levels, skipping `node_modules`
/// and dot directories. Sorted traversal keeps "first match" stable.
fn collect_dirs(vfs: &Vfs, root: &str, rel: &str, depth: usize, out: &mut Vec<String>) {
    if depth == 0 {
        return;
    }
    let Ok(entries) = vfs.read_dir_entries(&vpath::join(root, rel)) else {
        return;
    };
    for entry in entries {
        if entry.kind != FileKind::Directory
            || entry.name == "node_modules"
            || entry.name.starts_with('.')
        {
            continue;
        }
        let child = if rel.is_empty() {
            entry.name.clone()
        } else {
            format!("{rel}/{}", entry.name)
        };
        out.push(child.clone());
        collect_dirs(vfs, root, &child, depth - 1, out);
    }
}

/// The workspace a project belongs to.
///
/// A project declaring patterns is its own root. Otherwise the nearest
/// ancestor declaring patterns is used, but only if those patterns cover
/// the project.
#[must_use]
pub fn find_workspace_root(vfs: &Vfs, project_dir: &str) -> Option<Workspaces> {
    let project_dir = vpath::normalize(project_dir);
    if let Some(own) = discover(vfs, &project_dir) {
        return Some(own);
    }

    let mut dir = project_dir.clone();
    while dir != "/" {
        dir = vpath::dirname(&dir);
        if workspace_patterns(vfs, &dir).is_empty() {
            continue;
        }
        let workspaces = discover(vfs, &dir)?;
        return workspaces.covers(&project_dir).then_some(workspaces);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pkg(vfs: &Vfs, dir: &str, json: &str) {
        vfs.create_dir_all(dir).unwrap();
        vfs.write_file(&vpath::join(dir, "package.json"), json).unwrap();
    }

    fn monorepo() -> Vfs {
        let vfs = Vfs::new();
        write_pkg(
            &vfs,
            "/repo",
            r#"{"name": "monorepo", "workspaces": ["packages/*", "!packages/skipped"]}"#,
        );
        write_pkg(&vfs, "/repo/packages/my-lib", r#"{"name": "@myorg/my-lib", "version": "1.0.0"}"#);
        write_pkg(&vfs, "/repo/packages/skipped", r#"{"name": "skipped"}"#);
        write_pkg(&vfs, "/repo/packages/my-lib/nested", r#"{"name": "too-deep"}"#);
        write_pkg(&vfs, "/repo/packages/node_modules", r#"{"name": "not-a-member"}"#);
        write_pkg(&vfs, "/repo/tools/cli", r#"{"name": "cli"}"#);
        vfs
    }

    #[test]
    fn test_discover_array_format_with_exclusion() {
        let vfs = monorepo();
        let ws = discover(&vfs, "/repo").unwrap();
        assert!(ws.is_workspace_package("@myorg/my-lib"));
        assert_eq!(ws.get("@myorg/my-lib").unwrap().dir, "/repo/packages/my-lib");
        assert!(!ws.is_workspace_package("skipped"));
        assert!(!ws.is_workspace_package("too-deep"));
        assert!(!ws.is_workspace_package("not-a-member"));
        assert_eq!(ws.packages.len(), 1);
    }

    #[test]
    fn test_object_format_and_globstar() {
        let vfs = Vfs::new();
        write_pkg(&vfs, "/r", r#"{"workspaces": {"packages": ["apps/**"]}}"#);
        write_pkg(&vfs, "/r/apps/web", r#"{"name": "web"}"#);
        write_pkg(&vfs, "/r/apps/group/admin", r#"{"name": "admin", "version": "2.0.0"}"#);
        write_pkg(&vfs, "/r/apps/.hidden", r#"{"name": "hidden"}"#);

        let ws = discover(&vfs, "/r").unwrap();
        assert!(ws.is_workspace_package("web"));
        assert_eq!(ws.get("admin").unwrap().version, "2.0.0");
        assert!(!ws.is_workspace_package("hidden"));
    }

    #[test]
    fn test_pnpm_workspace_yaml() {
        let vfs = Vfs::new();
        write_pkg(&vfs, "/p", r#"{"name": "root"}"#);
        vfs.write_file("/p/pnpm-workspace.yaml", "packages:\n  - 'libs/*'\n")
            .unwrap();
        write_pkg(&vfs, "/p/libs/a", r#"{"name": "a"}"#);

        let ws = discover(&vfs, "/p").unwrap();
        assert!(ws.is_workspace_package("a"));
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let vfs = Vfs::new();
        write_pkg(&vfs, "/d", r#"{"workspaces": ["pkgs/*"]}"#);
        write_pkg(&vfs, "/d/pkgs/a", r#"{"name": "dup", "version": "1.0.0"}"#);
        write_pkg(&vfs, "/d/pkgs/b", r#"{"name": "dup", "version": "2.0.0"}"#);

        let ws = discover(&vfs, "/d").unwrap();
        assert_eq!(ws.get("dup").unwrap().dir, "/d/pkgs/a");
    }

    #[test]
    fn test_no_workspaces() {
        let vfs = Vfs::new();
        write_pkg(&vfs, "/plain", r#"{"name": "regular-project"}"#);
        assert!(discover(&vfs, "/plain").is_none());
    }

    #[test]
    fn test_find_workspace_root_requires_match() {
        let vfs = monorepo();
        let found = find_workspace_root(&vfs, "/repo/packages/my-lib").unwrap();
        assert_eq!(found.root, "/repo");

        // tools/cli is below the root but not covered by its patterns
        assert!(find_workspace_root(&vfs, "/repo/tools/cli").is_none());
    }
}
