//! `package-lock.json` / `npm-shrinkwrap.json`.
//!
//! Version 2 and 3 lockfiles carry a flat `packages` map keyed by install
//! path; version 1 only has the nested `dependencies` tree.

use super::{codes, LockInstallEntry, LockfileError};
use crate::pkg::platform::constraint_list;
use crate::vfs::path as vpath;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PackageLock {
    lockfile_version: Option<u64>,
    packages: Option<Map<String, Value>>,
    dependencies: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PackageEntry {
    name: Option<String>,
    version: Option<String>,
    resolved: Option<String>,
    integrity: Option<String>,
    dev: bool,
    optional: bool,
    dev_optional: bool,
    link: bool,
    in_bundle: bool,
    os: Option<Value>,
    cpu: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct V1Entry {
    version: Option<String>,
    resolved: Option<String>,
    integrity: Option<String>,
    dev: bool,
    optional: bool,
    bundled: bool,
    dependencies: Option<Map<String, Value>>,
}

/// Package name from an install key: everything after the last
/// `node_modules/`, where a scope takes two segments.
fn name_from_key(key: &str) -> Option<String> {
    let rest = match key.rfind("node_modules/") {
        Some(idx) => &key[idx + "node_modules/".len()..],
        None => return None,
    };
    let mut parts = rest.split('/');
    let first = parts.next().filter(|s| !s.is_empty())?;
    if first.starts_with('@') {
        let second = parts.next().filter(|s| !s.is_empty())?;
        Some(format!("{first}/{second}"))
    } else {
        Some(first.to_string())
    }
}

/// Split `npm:<name>@<version>` into its parts.
fn unwrap_alias(version: &str) -> Option<(String, String)> {
    let rest = version.strip_prefix("npm:")?;
    let at = rest.rfind('@').filter(|&i| i > 0)?;
    Some((rest[..at].to_string(), rest[at + 1..].to_string()))
}

pub(super) fn parse(content: &str, project_dir: &str) -> Result<Vec<LockInstallEntry>, LockfileError> {
    let lock: PackageLock = serde_json::from_str(content)
        .map_err(|e| LockfileError::new(codes::PKG_LOCK_INVALID_JSON, e.to_string()))?;

    let version = lock.lockfile_version.unwrap_or(1);
    if !(1..=3).contains(&version) {
        return Err(LockfileError::new(
            codes::PKG_LOCK_VERSION_UNSUPPORTED,
            format!("Unsupported lockfileVersion {version}"),
        ));
    }

    if let Some(packages) = &lock.packages {
        return Ok(parse_packages(packages, project_dir));
    }
    if let Some(deps) = &lock.dependencies {
        let mut out = Vec::new();
        walk_v1(deps, "", project_dir, &mut out);
        return Ok(out);
    }
    Err(LockfileError::new(
        codes::PKG_LOCK_INVALID,
        "Lockfile has neither packages nor dependencies",
    ))
}

fn parse_packages(packages: &Map<String, Value>, project_dir: &str) -> Vec<LockInstallEntry> {
    let mut out = Vec::new();

    for (key, value) in packages {
        if key.is_empty() || !key.contains("node_modules/") {
            continue;
        }
        let entry: PackageEntry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key, error = %e, "skipping malformed lockfile entry");
                continue;
            }
        };
        if entry.in_bundle {
            continue;
        }
        let Some(name) = name_from_key(key) else {
            continue;
        };

        let mut install = LockInstallEntry {
            key: key.clone(),
            install_path: vpath::join(project_dir, key),
            alias_for: entry.name.clone().filter(|real| *real != name),
            name,
            version: entry.version.clone().unwrap_or_default(),
            integrity: entry.integrity.clone(),
            dev: entry.dev,
            optional: entry.optional || entry.dev_optional,
            os: constraint_list(entry.os.as_ref()),
            cpu: constraint_list(entry.cpu.as_ref()),
            ..LockInstallEntry::default()
        };

        match entry.resolved.as_deref() {
            Some(target) if entry.link => {
                let source = vpath::join(project_dir, target.strip_prefix("file:").unwrap_or(target));
                if install.version.is_empty() {
                    if let Some(linked) = packages.get(target).and_then(|v| v.get("version")) {
                        install.version = linked.as_str().unwrap_or_default().to_string();
                    }
                }
                install.link = true;
                install.local_source = Some(source);
            }
            Some(target) if target.starts_with("file:") => {
                install.local_source = Some(vpath::join(project_dir, &target["file:".len()..]));
            }
            resolved => install.resolved = resolved.map(String::from),
        }

        out.push(install);
    }

    out
}

fn walk_v1(
    deps: &Map<String, Value>,
    parent_key: &str,
    project_dir: &str,
    out: &mut Vec<LockInstallEntry>,
) {
    for (name, value) in deps {
        let entry: V1Entry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(name = %name, error = %e, "skipping malformed lockfile entry");
                continue;
            }
        };
        // Bundled dependencies ship inside their parent's tarball
        if entry.bundled {
            continue;
        }

        let key = if parent_key.is_empty() {
            format!("node_modules/{name}")
        } else {
            format!("{parent_key}/node_modules/{name}")
        };
        let raw_version = entry.version.unwrap_or_default();

        let mut install = LockInstallEntry {
            key: key.clone(),
            install_path: vpath::join(project_dir, &key),
            name: name.clone(),
            integrity: entry.integrity,
            dev: entry.dev,
            optional: entry.optional,
            ..LockInstallEntry::default()
        };

        if let Some((real, version)) = unwrap_alias(&raw_version) {
            install.alias_for = Some(real);
            install.version = version;
            install.resolved = entry.resolved;
        } else if let Some(path) = raw_version.strip_prefix("file:") {
            install.local_source = Some(vpath::join(project_dir, path));
        } else {
            install.version = raw_version;
            install.resolved = entry.resolved;
        }

        out.push(install);

        if let Some(children) = &entry.dependencies {
            walk_v1(children, &key, project_dir, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V3: &str = r#"{
        "name": "app",
        "lockfileVersion": 3,
        "packages": {
            "": { "name": "app", "dependencies": { "shared": "^1.0.0" } },
            "packages/ui": { "name": "@acme/ui", "version": "0.3.0" },
            "node_modules/@acme/ui": { "resolved": "packages/ui", "link": true },
            "node_modules/shared": {
                "version": "1.2.0",
                "resolved": "https://registry.npmjs.org/shared/-/shared-1.2.0.tgz",
                "integrity": "sha512-abc"
            },
            "node_modules/app-helper": { "version": "2.0.0", "resolved": "https://registry.npmjs.org/app-helper/-/app-helper-2.0.0.tgz" },
            "node_modules/app-helper/node_modules/shared": {
                "version": "2.0.0",
                "resolved": "https://registry.npmjs.org/shared/-/shared-2.0.0.tgz",
                "dev": true
            },
            "node_modules/local-thing": { "version": "1.0.0", "resolved": "file:../local-thing" },
            "node_modules/old-react": { "name": "react", "version": "17.0.2", "resolved": "https://registry.npmjs.org/react/-/react-17.0.2.tgz" },
            "node_modules/fsevents": { "version": "2.3.3", "optional": true, "os": ["darwin"] },
            "node_modules/app-helper/node_modules/inner": { "version": "1.0.0", "inBundle": true }
        }
    }"#;

    fn find<'a>(entries: &'a [LockInstallEntry], key: &str) -> &'a LockInstallEntry {
        entries.iter().find(|e| e.key == key).unwrap()
    }

    #[test]
    fn test_v3_packages() {
        let entries = parse(V3, "/app").unwrap();
        assert_eq!(entries.len(), 7);

        let shared = find(&entries, "node_modules/shared");
        assert_eq!(shared.name, "shared");
        assert_eq!(shared.version, "1.2.0");
        assert_eq!(shared.install_path, "/app/node_modules/shared");
        assert_eq!(shared.integrity.as_deref(), Some("sha512-abc"));

        let nested = find(&entries, "node_modules/app-helper/node_modules/shared");
        assert_eq!(nested.install_path, "/app/node_modules/app-helper/node_modules/shared");
        assert!(nested.dev);
        assert_eq!(nested.depth(), 2);

        let optional = find(&entries, "node_modules/fsevents");
        assert!(optional.optional);
        assert!(optional.resolved.is_none());
        assert_eq!(optional.os, vec!["darwin"]);
        assert!(optional.cpu.is_empty());
        assert!(shared.supports_host());
    }

    #[test]
    fn test_v3_links_and_local_copies() {
        let entries = parse(V3, "/app").unwrap();

        let ui = find(&entries, "node_modules/@acme/ui");
        assert_eq!(ui.name, "@acme/ui");
        assert!(ui.link);
        assert_eq!(ui.local_source.as_deref(), Some("/app/packages/ui"));
        assert_eq!(ui.version, "0.3.0");

        let local = find(&entries, "node_modules/local-thing");
        assert!(!local.link);
        assert_eq!(local.local_source.as_deref(), Some("/local-thing"));
    }

    #[test]
    fn test_v3_alias_name() {
        let entries = parse(V3, "/app").unwrap();
        let alias = find(&entries, "node_modules/old-react");
        assert_eq!(alias.name, "old-react");
        assert_eq!(alias.registry_name(), "react");
    }

    #[test]
    fn test_v1_nested_dependencies() {
        let v1 = r#"{
            "lockfileVersion": 1,
            "dependencies": {
                "app": {
                    "version": "1.0.0",
                    "resolved": "https://registry.npmjs.org/app/-/app-1.0.0.tgz",
                    "dependencies": {
                        "shared": { "version": "2.0.0", "resolved": "https://registry.npmjs.org/shared/-/shared-2.0.0.tgz" },
                        "vendored": { "version": "1.0.0", "bundled": true }
                    }
                },
                "react17": { "version": "npm:react@17.0.2", "resolved": "https://registry.npmjs.org/react/-/react-17.0.2.tgz" },
                "shared": { "version": "1.0.0", "dev": true }
            }
        }"#;
        let entries = parse(v1, "/").unwrap();
        assert_eq!(entries.len(), 4);

        let nested = find(&entries, "node_modules/app/node_modules/shared");
        assert_eq!(nested.version, "2.0.0");
        assert_eq!(nested.install_path, "/node_modules/app/node_modules/shared");
        assert!(!entries.iter().any(|e| e.name == "vendored"));

        let alias = find(&entries, "node_modules/react17");
        assert_eq!(alias.version, "17.0.2");
        assert_eq!(alias.alias_for.as_deref(), Some("react"));

        assert!(find(&entries, "node_modules/shared").dev);
    }

    #[test]
    fn test_invalid_json_and_version() {
        assert_eq!(
            parse("nope", "/").unwrap_err().code(),
            codes::PKG_LOCK_INVALID_JSON
        );
        assert_eq!(
            parse(r#"{"lockfileVersion": 9}"#, "/").unwrap_err().code(),
            codes::PKG_LOCK_VERSION_UNSUPPORTED
        );
    }

    #[test]
    fn test_name_from_key() {
        assert_eq!(name_from_key("node_modules/a/node_modules/@s/b").as_deref(), Some("@s/b"));
        assert_eq!(name_from_key("packages/ui"), None);
    }
}
