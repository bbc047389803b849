//! `bun.lock` (text lockfile, JSON with trailing commas).
//!
//! Packages are keyed by dependency chains (`parent/child`). Which entries
//! get installed is computed by walking from the root workspace's roots; the
//! same lookup order as Node's module resolution picks the node for each
//! edge.

use super::{codes, nesting_key, LockInstallEntry, LockfileError};
use crate::pkg::manifest::DepMap;
use crate::pkg::platform;
use crate::pkg::spec::{parse_dependency_spec, DepProtocol};
use crate::vfs::path as vpath;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BunLock {
    lockfile_version: Option<u64>,
    workspaces: BTreeMap<String, WorkspaceEntry>,
    packages: Map<String, Value>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkspaceEntry {
    name: Option<String>,
    version: Option<String>,
    dependencies: DepMap,
    dev_dependencies: DepMap,
    optional_dependencies: DepMap,
    peer_dependencies: DepMap,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PackageMeta {
    dependencies: DepMap,
    optional_dependencies: DepMap,
    peer_dependencies: DepMap,
    optional_peers: Vec<String>,
    os: Option<Value>,
    cpu: Option<Value>,
}

/// One `packages` value: `[ident, registry?, meta?, integrity?]`.
#[derive(Debug, Default)]
struct PackageNode {
    name: String,
    /// The part of the identifier after `name@`.
    spec: String,
    registry: Option<String>,
    meta: PackageMeta,
    integrity: Option<String>,
}

impl PackageNode {
    fn parse(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let ident = items.first()?.as_str()?;
        let at = ident.get(1..)?.find('@')? + 1;
        let mut node = Self {
            name: ident[..at].to_string(),
            spec: ident[at + 1..].to_string(),
            ..Self::default()
        };

        let mut strings = Vec::new();
        let mut meta_seen = false;
        for item in &items[1..] {
            match item {
                Value::Object(_) if !meta_seen => {
                    node.meta = serde_json::from_value(item.clone()).unwrap_or_default();
                    meta_seen = true;
                }
                Value::String(s) => strings.push(s.as_str()),
                _ => {}
            }
        }
        node.integrity = strings
            .iter()
            .find(|s| s.starts_with("sha512-") || s.starts_with("sha256-") || s.starts_with("sha1-"))
            .map(|s| (*s).to_string());
        if let Some(first) = strings.first() {
            if !first.is_empty() && node.integrity.as_deref() != Some(*first) {
                node.registry = Some((*first).to_string());
            }
        }
        Some(node)
    }

    fn edges(&self) -> impl Iterator<Item = (&String, &String)> {
        let optional_peers: HashSet<&str> =
            self.meta.optional_peers.iter().map(String::as_str).collect();
        self.meta
            .dependencies
            .iter()
            .chain(&self.meta.optional_dependencies)
            .chain(
                self.meta
                    .peer_dependencies
                    .iter()
                    .filter(move |(name, _)| !optional_peers.contains(name.as_str())),
            )
    }

    fn supported_here(&self) -> bool {
        platform::allows(self.meta.os.as_ref(), platform::current_os())
            && platform::allows(self.meta.cpu.as_ref(), platform::current_cpu())
    }
}

/// Rewrite `input` outside string literals. `f` sees each such char by
/// index, pushes whatever should be kept and returns how many chars it
/// consumed.
fn scan_code(input: &str, mut f: impl FnMut(&[char], usize, &mut String) -> usize) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        i += f(&chars, i, &mut out).max(1);
    }
    out
}

/// Remove `//` and `/* */` comments, then trailing commas, outside strings.
pub(crate) fn strip_jsonc(input: &str) -> String {
    let without_comments = scan_code(input, |chars, i, out| {
        match (chars[i], chars.get(i + 1)) {
            ('/', Some('/')) => chars[i..].iter().take_while(|c| **c != '\n').count(),
            ('/', Some('*')) => chars[i + 2..]
                .windows(2)
                .position(|w| w == ['*', '/'])
                .map_or(chars.len() - i, |end| end + 4),
            (c, _) => {
                out.push(c);
                1
            }
        }
    });
    scan_code(&without_comments, |chars, i, out| {
        let c = chars[i];
        if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                return 1;
            }
        }
        out.push(c);
        1
    })
}

/// Split a chain key into package names (`@scope/name` stays together).
fn split_chain(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut parts = key.split('/').filter(|p| !p.is_empty());
    while let Some(part) = parts.next() {
        if part.starts_with('@') {
            match parts.next() {
                Some(name) => out.push(format!("{part}/{name}")),
                None => out.push(part.to_string()),
            }
        } else {
            out.push(part.to_string());
        }
    }
    out
}

/// Node-style lookup: `parent/child`, then shorter ancestor chains, then
/// the top-level key.
fn lookup_edge(packages: &BTreeMap<String, PackageNode>, parent: &[String], dep: &str) -> Option<String> {
    for len in (0..=parent.len()).rev() {
        let mut chain: Vec<&str> = parent[..len].iter().map(String::as_str).collect();
        chain.push(dep);
        let key = chain.join("/");
        if packages.contains_key(&key) {
            return Some(key);
        }
    }
    None
}

struct Graph<'a> {
    lock: &'a BunLock,
    packages: &'a BTreeMap<String, PackageNode>,
    /// Workspace path by member name.
    members: BTreeMap<String, String>,
}

impl Graph<'_> {
    /// Dependency edges of a package key; workspace members use their
    /// workspace entry.
    fn edges_of(&self, key: &str) -> Vec<(String, String)> {
        let Some(node) = self.packages.get(key) else {
            return Vec::new();
        };
        if node.spec.starts_with("workspace:") {
            let Some(ws) = self.members.get(&node.name).and_then(|p| self.lock.workspaces.get(p)) else {
                return Vec::new();
            };
            return ws
                .dependencies
                .iter()
                .chain(&ws.optional_dependencies)
                .chain(&ws.peer_dependencies)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        node.edges().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn reach(&self, roots: &[String]) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = roots
            .iter()
            .filter_map(|name| lookup_edge(self.packages, &[], name))
            .collect();
        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let chain = split_chain(&key);
            for (dep, _) in self.edges_of(&key) {
                if let Some(target) = lookup_edge(self.packages, &chain, &dep) {
                    if !seen.contains(&target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        seen
    }
}

pub(super) fn parse(content: &str, project_dir: &str) -> Result<Vec<LockInstallEntry>, LockfileError> {
    let lock: BunLock = serde_json::from_str(&strip_jsonc(content))
        .map_err(|e| LockfileError::new(codes::PKG_LOCK_INVALID_JSON, e.to_string()))?;
    if let Some(version) = lock.lockfile_version {
        if version > 1 {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_UNSUPPORTED,
                format!("Unsupported bun lockfileVersion {version}"),
            ));
        }
    }
    let root = lock.workspaces.get("").cloned().ok_or_else(|| {
        LockfileError::new(codes::PKG_LOCK_INVALID, "bun.lock has no root workspace")
    })?;

    let packages: BTreeMap<String, PackageNode> = lock
        .packages
        .iter()
        .filter_map(|(key, value)| PackageNode::parse(value).map(|node| (key.clone(), node)))
        .collect();
    let members: BTreeMap<String, String> = lock
        .workspaces
        .iter()
        .filter(|(path, _)| !path.is_empty())
        .filter_map(|(path, ws)| ws.name.clone().map(|name| (name, path.clone())))
        .collect();
    let graph = Graph {
        lock: &lock,
        packages: &packages,
        members,
    };

    let mut prod_roots: Vec<String> = root
        .dependencies
        .keys()
        .chain(root.optional_dependencies.keys())
        .chain(root.peer_dependencies.keys())
        .cloned()
        .collect();
    prod_roots.extend(graph.members.keys().cloned());
    let mut dev_roots: Vec<String> = root.dev_dependencies.keys().cloned().collect();
    for path in graph.members.values() {
        if let Some(ws) = lock.workspaces.get(path) {
            dev_roots.extend(ws.dev_dependencies.keys().cloned());
        }
    }

    let prod = graph.reach(&prod_roots);
    let dev = graph.reach(&dev_roots);

    let mut out = Vec::new();
    for (key, node) in &packages {
        let in_prod = prod.contains(key);
        if !in_prod && !dev.contains(key) {
            continue;
        }
        let chain = split_chain(key);
        let Some(install_name) = chain.last().cloned() else {
            continue;
        };
        let nested = nesting_key(&chain);
        let mut entry = LockInstallEntry {
            install_path: vpath::join(project_dir, &nested),
            key: nested,
            alias_for: (node.name != install_name).then(|| node.name.clone()),
            name: install_name,
            integrity: node.integrity.clone(),
            dev: !in_prod,
            optional: !node.supported_here(),
            os: platform::constraint_list(node.meta.os.as_ref()),
            cpu: platform::constraint_list(node.meta.cpu.as_ref()),
            ..LockInstallEntry::default()
        };

        if let Some(path) = node.spec.strip_prefix("workspace:") {
            entry.link = true;
            entry.local_source = Some(vpath::join(project_dir, path));
            entry.version = lock
                .workspaces
                .get(path)
                .and_then(|ws| ws.version.clone())
                .unwrap_or_default();
            entry.alias_for = None;
        } else {
            apply_source(&mut entry, node, project_dir);
        }
        out.push(entry);
    }
    Ok(out)
}

/// Fill version and source fields from the identifier's spec part.
fn apply_source(entry: &mut LockInstallEntry, node: &PackageNode, project_dir: &str) {
    let parsed = parse_dependency_spec(&node.name, &node.spec).ok();
    match parsed.as_ref().map(|p| p.protocol) {
        Some(DepProtocol::File | DepProtocol::Link) => {
            let target = parsed.and_then(|p| p.target).unwrap_or_default();
            entry.link = node.spec.starts_with("link:");
            entry.local_source = Some(vpath::join(project_dir, &target));
            entry.alias_for = None;
        }
        Some(DepProtocol::Tarball) => {
            entry.resolved = Some(node.spec.clone());
        }
        Some(DepProtocol::Github) => {
            entry.resolved = parsed.and_then(|p| p.github).map(|g| g.tarball_url());
        }
        _ => {
            entry.version = node.spec.clone();
            entry.resolved = node
                .registry
                .as_deref()
                .filter(|r| r.ends_with(".tgz"))
                .map(String::from);
        }
    }
}
