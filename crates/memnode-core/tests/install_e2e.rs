//! End-to-end installs into the VFS against an in-memory registry.
//!
//! Every published version gets a real `.tgz` built with `tar` + `flate2`,
//! so these tests exercise resolution, fetching, integrity checks,
//! extraction, bin shims and `.package-lock.json` together.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use memnode_core::pkg::{
    compute_integrity, pkg_codes, ArchiveCache, DiskStore, InstallOptions, InstallSource,
    PackageJson, PackageManager, PackageManifest, PkgError, Registry, SourceTransformer,
    TarballFetcher,
};
use memnode_core::Vfs;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const PROJECT: &str = "/proj";

fn tgz(files: &[(String, String)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(format!("package/{path}")).unwrap();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, body.as_bytes()).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn tarball_url(name: &str, version: &str) -> String {
    format!("https://registry.test/{name}/-/{name}-{version}.tgz")
}

#[derive(Default)]
struct Fixture {
    versions: BTreeMap<String, serde_json::Map<String, Value>>,
    latest: HashMap<String, String>,
    archives: HashMap<String, Bytes>,
}

impl Fixture {
    fn publish(&mut self, name: &str, version: &str, deps: Value) {
        self.publish_with(name, version, deps, json!({}), &[]);
    }

    fn publish_with(
        &mut self,
        name: &str,
        version: &str,
        deps: Value,
        extra: Value,
        files: &[(&str, &str)],
    ) {
        let mut manifest = json!({ "name": name, "version": version, "dependencies": deps });
        if let (Some(target), Value::Object(extra)) = (manifest.as_object_mut(), extra) {
            target.extend(extra);
        }

        let mut entries = vec![
            ("package.json".to_string(), manifest.to_string()),
            (
                "index.js".to_string(),
                format!("module.exports = '{name}@{version}';\n"),
            ),
        ];
        entries.extend(files.iter().map(|(p, b)| ((*p).to_string(), (*b).to_string())));
        let archive = tgz(&entries);

        let url = tarball_url(name, version);
        manifest["dist"] = json!({ "tarball": url, "integrity": compute_integrity(&archive) });
        self.versions
            .entry(name.to_string())
            .or_default()
            .insert(version.to_string(), manifest);
        self.latest.insert(name.to_string(), version.to_string());
        self.archives.insert(url, Bytes::from(archive));
    }

    fn integrity(&self, name: &str, version: &str) -> String {
        self.versions[name][version]["dist"]["integrity"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn set_integrity(&mut self, name: &str, version: &str, integrity: &str) {
        let entry = self
            .versions
            .get_mut(name)
            .and_then(|v| v.get_mut(version))
            .unwrap();
        entry["dist"]["integrity"] = json!(integrity);
    }

    fn registry(&self) -> Arc<MockRegistry> {
        let manifests = self
            .versions
            .iter()
            .map(|(name, versions)| {
                let manifest: PackageManifest = serde_json::from_value(json!({
                    "name": name,
                    "dist-tags": { "latest": self.latest[name] },
                    "versions": versions
                }))
                .unwrap();
                (name.clone(), manifest)
            })
            .collect();
        Arc::new(MockRegistry { manifests })
    }

    fn fetcher(&self) -> Arc<MockFetcher> {
        Arc::new(MockFetcher {
            archives: self.archives.clone(),
            calls: AtomicUsize::new(0),
        })
    }

    fn manager(&self, vfs: &Vfs) -> (PackageManager, Arc<MockFetcher>) {
        let fetcher = self.fetcher();
        let archives = Arc::new(ArchiveCache::new(fetcher.clone()));
        (
            PackageManager::new(vfs.clone(), self.registry(), archives),
            fetcher,
        )
    }
}

struct MockRegistry {
    manifests: HashMap<String, PackageManifest>,
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_manifest(&self, name: &str) -> Result<PackageManifest, PkgError> {
        self.manifests
            .get(name)
            .cloned()
            .ok_or_else(|| PkgError::not_found(name))
    }
}

struct MockFetcher {
    archives: HashMap<String, Bytes>,
    calls: AtomicUsize,
}

#[async_trait]
impl TarballFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, PkgError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.archives
            .get(url)
            .cloned()
            .ok_or_else(|| PkgError::download_failed(format!("404 for {url}")))
    }
}

fn write(vfs: &Vfs, path: &str, content: &str) {
    let parent = path.rsplit_once('/').map_or("/", |(p, _)| if p.is_empty() { "/" } else { p });
    vfs.create_dir_all(parent).unwrap();
    vfs.write_file(path, content).unwrap();
}

fn project(vfs: &Vfs, manifest: &Value) {
    write(vfs, &format!("{PROJECT}/package.json"), &manifest.to_string());
}

fn installed_version(vfs: &Vfs, dir: &str) -> String {
    PackageJson::read(vfs, dir)
        .unwrap()
        .version
        .unwrap_or_default()
}

#[tokio::test]
async fn test_transitive_dependency_gets_highest_match() {
    let mut fixture = Fixture::default();
    fixture.publish("app", "1.0.0", json!({ "shared": "^1.0.0" }));
    fixture.publish("shared", "1.0.0", json!({}));
    fixture.publish("shared", "1.4.0", json!({}));
    fixture.publish("shared", "2.0.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "name": "root", "dependencies": { "app": "^1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);

    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(installed_version(&vfs, "/proj/node_modules/app"), "1.0.0");
    assert_eq!(installed_version(&vfs, "/proj/node_modules/shared"), "1.4.0");
    assert_eq!(result.installed.len(), 2);
    assert!(result.lockfile.is_none());

    let lock: Value = serde_json::from_str(
        &vfs.read_to_string("/proj/node_modules/.package-lock.json")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(lock["shared"]["version"], "1.4.0");
    assert_eq!(lock["shared"]["resolved"], tarball_url("shared", "1.4.0"));
}

#[tokio::test]
async fn test_root_range_overrides_transitive_pick() {
    let mut fixture = Fixture::default();
    fixture.publish("ui-kit", "1.0.0", json!({ "react-dom": "^18.0.0" }));
    fixture.publish("react-dom", "18.2.0", json!({}));
    fixture.publish("react-dom", "18.3.1", json!({}));
    fixture.publish("react-dom", "19.0.0", json!({}));

    let vfs = Vfs::new();
    project(
        &vfs,
        &json!({ "dependencies": { "ui-kit": "^1.0.0", "react-dom": "~18.2.0" } }),
    );
    let (pm, _) = fixture.manager(&vfs);
    pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(installed_version(&vfs, "/proj/node_modules/react-dom"), "18.2.0");
}

#[tokio::test]
async fn test_dependency_cycle_terminates() {
    let mut fixture = Fixture::default();
    fixture.publish("a", "1.0.0", json!({ "b": "^1.0.0" }));
    fixture.publish("b", "1.0.0", json!({ "a": "^1.0.0" }));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "a": "^1.0.0" } }));
    let (pm, fetcher) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    let names: Vec<&str> = result.installed.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bins_are_linked_after_install() {
    let mut fixture = Fixture::default();
    fixture.publish_with(
        "tool",
        "1.0.0",
        json!({}),
        json!({ "bin": { "tool": "bin/tool.js" } }),
        &[("bin/tool.js", "require('../index.js');\n")],
    );

    let vfs = Vfs::new();
    project(&vfs, &json!({ "devDependencies": { "tool": "^1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(result.bins, vec!["tool".to_string()]);
    let shim = vfs.read_to_string("/proj/node_modules/.bin/tool").unwrap();
    assert!(shim.contains("/proj/node_modules/tool/bin/tool.js"));
}

#[tokio::test]
async fn test_lockfile_replay_nests_packages() {
    let mut fixture = Fixture::default();
    fixture.publish("app", "1.0.0", json!({ "shared": "^2.0.0" }));
    fixture.publish("shared", "1.4.0", json!({}));
    fixture.publish("shared", "2.0.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "app": "^1.0.0", "shared": "^1.0.0" } }));
    let lock = json!({
        "name": "root",
        "lockfileVersion": 3,
        "packages": {
            "": { "dependencies": { "app": "^1.0.0", "shared": "^1.0.0" } },
            "node_modules/app": {
                "version": "1.0.0",
                "resolved": tarball_url("app", "1.0.0"),
                "integrity": fixture.integrity("app", "1.0.0")
            },
            "node_modules/app/node_modules/shared": {
                "version": "2.0.0",
                "resolved": tarball_url("shared", "2.0.0"),
                "integrity": fixture.integrity("shared", "2.0.0")
            },
            "node_modules/shared": {
                "version": "1.4.0",
                "resolved": tarball_url("shared", "1.4.0")
            }
        }
    });
    write(&vfs, "/proj/package-lock.json", &lock.to_string());

    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(result.lockfile.as_deref(), Some("/proj/package-lock.json"));
    assert_eq!(installed_version(&vfs, "/proj/node_modules/shared"), "1.4.0");
    assert_eq!(
        installed_version(&vfs, "/proj/node_modules/app/node_modules/shared"),
        "2.0.0"
    );
    assert!(result
        .installed
        .iter()
        .all(|p| p.source == InstallSource::Lockfile));
}

#[tokio::test]
async fn test_npm_link_entries_become_symlinks() {
    let fixture = Fixture::default();
    let vfs = Vfs::new();
    project(&vfs, &json!({ "name": "root", "workspaces": ["packages/*"] }));
    write(
        &vfs,
        "/proj/packages/lib/package.json",
        r#"{"name": "lib", "version": "0.1.0"}"#,
    );
    let lock = json!({
        "lockfileVersion": 2,
        "packages": {
            "": { "workspaces": ["packages/*"] },
            "node_modules/lib": { "resolved": "packages/lib", "link": true },
            "packages/lib": { "name": "lib", "version": "0.1.0" }
        }
    });
    write(&vfs, "/proj/package-lock.json", &lock.to_string());

    let (pm, _) = fixture.manager(&vfs);
    pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert!(vfs
        .lstat("/proj/node_modules/lib")
        .unwrap()
        .is_symbolic_link());
    assert_eq!(vfs.readlink("/proj/node_modules/lib").unwrap(), "/proj/packages/lib");
    assert_eq!(installed_version(&vfs, "/proj/node_modules/lib"), "0.1.0");
}

#[tokio::test]
async fn test_malformed_lockfile_falls_back_to_resolution() {
    let mut fixture = Fixture::default();
    fixture.publish("left-pad", "1.3.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "left-pad": "^1.0.0" } }));
    write(&vfs, "/proj/package-lock.json", "{ not json");

    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();
    assert!(result.lockfile.is_none());
    assert_eq!(installed_version(&vfs, "/proj/node_modules/left-pad"), "1.3.0");
}

#[tokio::test]
async fn test_integrity_mismatch_fails_package() {
    let mut fixture = Fixture::default();
    fixture.publish("tampered", "1.0.0", json!({}));
    fixture.set_integrity("tampered", "1.0.0", &compute_integrity(b"something else"));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "tampered": "1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);

    let err = pm.install(PROJECT, &InstallOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), pkg_codes::PKG_INTEGRITY_MISMATCH);
    assert!(!vfs.exists("/proj/node_modules/tampered/package.json"));
}

#[tokio::test]
async fn test_git_dependency_is_rejected_before_writes() {
    let fixture = Fixture::default();
    let vfs = Vfs::new();
    project(
        &vfs,
        &json!({ "dependencies": { "tool": "git+https://github.com/acme/tool.git" } }),
    );
    let (pm, _) = fixture.manager(&vfs);

    let err = pm.install(PROJECT, &InstallOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), pkg_codes::PKG_UNSUPPORTED_PROTOCOL);
    assert!(!vfs.exists("/proj/node_modules"));
}

#[tokio::test]
async fn test_missing_package_json() {
    let fixture = Fixture::default();
    let vfs = Vfs::new();
    vfs.create_dir_all(PROJECT).unwrap();
    let (pm, _) = fixture.manager(&vfs);

    let err = pm.install(PROJECT, &InstallOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), pkg_codes::PKG_PACKAGE_JSON_NOT_FOUND);
}

#[tokio::test]
async fn test_local_file_dependency_pulls_registry_deps() {
    let mut fixture = Fixture::default();
    fixture.publish("shared", "1.2.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "local-lib": "file:../local-lib" } }));
    write(
        &vfs,
        "/local-lib/package.json",
        r#"{"name": "local-lib", "version": "0.3.0", "dependencies": {"shared": "^1.0.0"}}"#,
    );
    write(&vfs, "/local-lib/index.js", "module.exports = 1;");
    write(&vfs, "/local-lib/node_modules/junk/index.js", "");

    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert!(vfs.is_file("/proj/node_modules/local-lib/index.js"));
    assert!(!vfs.exists("/proj/node_modules/local-lib/node_modules"));
    assert_eq!(installed_version(&vfs, "/proj/node_modules/shared"), "1.2.0");
    let local = result
        .installed
        .iter()
        .find(|p| p.name == "local-lib")
        .unwrap();
    assert_eq!(local.source, InstallSource::File);
}

#[tokio::test]
async fn test_missing_file_target_is_an_error() {
    let fixture = Fixture::default();
    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "gone": "file:./vendor/gone" } }));
    let (pm, _) = fixture.manager(&vfs);

    let err = pm.install(PROJECT, &InstallOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), pkg_codes::PKG_LOCAL_NOT_FOUND);
}

fn monorepo(vfs: &Vfs) {
    write(vfs, "/mono/package.json", r#"{"name": "mono", "workspaces": ["packages/*"]}"#);
    write(
        vfs,
        "/mono/packages/ui/package.json",
        r#"{"name": "ui", "version": "2.1.0", "main": "dist/index.js"}"#,
    );
    write(vfs, "/mono/packages/ui/src/index.ts", "export {}");
    write(
        vfs,
        "/mono/packages/app/package.json",
        r#"{"name": "app", "dependencies": {"ui": "workspace:*"}}"#,
    );
}

#[tokio::test]
async fn test_workspace_dependency_is_copied() {
    let fixture = Fixture::default();
    let vfs = Vfs::new();
    monorepo(&vfs);
    let (pm, _) = fixture.manager(&vfs);

    let result = pm
        .install("/mono/packages/app", &InstallOptions::default())
        .await
        .unwrap();
    assert!(vfs.is_file("/mono/packages/app/node_modules/ui/src/index.ts"));
    assert_eq!(result.installed[0].source, InstallSource::Workspace);
}

#[tokio::test]
async fn test_prefer_published_substitutes_unbuilt_workspace_package() {
    let mut fixture = Fixture::default();
    fixture.publish_with("ui", "2.1.0", json!({}), json!({ "main": "index.js" }), &[]);
    fixture.publish_with("ui", "2.3.0", json!({}), json!({ "main": "index.js" }), &[]);
    fixture.publish_with("ui", "3.0.0", json!({}), json!({ "main": "index.js" }), &[]);

    let vfs = Vfs::new();
    monorepo(&vfs);
    let (pm, _) = fixture.manager(&vfs);
    let options = InstallOptions {
        prefer_published: true,
        ..InstallOptions::default()
    };

    let result = pm.install("/mono/packages/app", &options).await.unwrap();
    assert_eq!(
        installed_version(&vfs, "/mono/packages/app/node_modules/ui"),
        "2.3.0"
    );
    assert_eq!(result.installed[0].source, InstallSource::Registry);
    assert!(vfs.is_file("/mono/packages/app/node_modules/ui/index.js"));
}

struct FailingTransformer;

#[async_trait]
impl SourceTransformer for FailingTransformer {
    async fn transform(&self, _vfs: &Vfs, package_dir: &str) -> Result<(), PkgError> {
        Err(PkgError::new("TRANSFORM_FAILED", format!("cannot transform {package_dir}")))
    }
}

#[tokio::test]
async fn test_transform_failure_is_a_warning() {
    let mut fixture = Fixture::default();
    fixture.publish("esm-only", "1.0.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "esm-only": "^1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);
    let pm = pm.with_transformer(Arc::new(FailingTransformer));

    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();
    assert_eq!(result.warnings.len(), 1);
    assert!(vfs.is_file("/proj/node_modules/esm-only/index.js"));
}

#[tokio::test]
async fn test_optional_dependency_failure_is_a_warning() {
    let mut fixture = Fixture::default();
    fixture.publish("core", "1.0.0", json!({}));

    let vfs = Vfs::new();
    project(
        &vfs,
        &json!({
            "dependencies": { "core": "^1.0.0" },
            "optionalDependencies": { "not-published": "^1.0.0" }
        }),
    );
    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(result.warnings.len(), 1);
    assert!(vfs.is_dir("/proj/node_modules/core"));
}

#[tokio::test]
async fn test_add_records_caret_range() {
    let mut fixture = Fixture::default();
    fixture.publish("dayjs", "1.11.0", json!({}));
    fixture.publish("dayjs", "1.11.10", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "name": "root" }));
    let (pm, _) = fixture.manager(&vfs);

    pm.add(PROJECT, "dayjs", false, &InstallOptions::default())
        .await
        .unwrap();

    let manifest = PackageJson::read(&vfs, PROJECT).unwrap();
    assert_eq!(manifest.dependencies["dayjs"], "^1.11.10");
    assert_eq!(installed_version(&vfs, "/proj/node_modules/dayjs"), "1.11.10");
}

#[tokio::test]
async fn test_install_package_merges_package_lock() {
    let mut fixture = Fixture::default();
    fixture.publish("first", "1.0.0", json!({}));
    fixture.publish("second", "2.0.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "first": "^1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);
    pm.install(PROJECT, &InstallOptions::default()).await.unwrap();
    pm.install_package(PROJECT, "second", "^2.0.0", &InstallOptions::default())
        .await
        .unwrap();

    let lock: Value = serde_json::from_str(
        &vfs.read_to_string("/proj/node_modules/.package-lock.json")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(lock["first"]["version"], "1.0.0");
    assert_eq!(lock["second"]["version"], "2.0.0");
    let manifest = PackageJson::read(&vfs, PROJECT).unwrap();
    assert!(!manifest.dependencies.contains_key("second"));
}

#[tokio::test]
async fn test_corrupt_disk_cache_falls_through_to_fetch() {
    let mut fixture = Fixture::default();
    fixture.publish("cached", "1.0.0", json!({}));
    let dir = tempdir().unwrap();
    let store = Arc::new(DiskStore::new(dir.path().to_path_buf()));

    let install = |vfs: Vfs| {
        let fetcher = fixture.fetcher();
        let archives = ArchiveCache::new(fetcher.clone()).with_store(store.clone());
        let pm = PackageManager::new(vfs, fixture.registry(), Arc::new(archives));
        (pm, fetcher)
    };

    let first_vfs = Vfs::new();
    project(&first_vfs, &json!({ "dependencies": { "cached": "1.0.0" } }));
    let (pm, fetcher) = install(first_vfs);
    pm.install(PROJECT, &InstallOptions::default()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    for entry in walkdir::WalkDir::new(dir.path()) {
        let entry = entry.unwrap();
        if entry.path().extension().is_some_and(|e| e == "bin") {
            let mut raw = std::fs::read(entry.path()).unwrap();
            let last = raw.len() - 1;
            raw[last] ^= 0xff;
            std::fs::write(entry.path(), raw).unwrap();
        }
    }

    let second_vfs = Vfs::new();
    project(&second_vfs, &json!({ "dependencies": { "cached": "1.0.0" } }));
    let (pm, fetcher) = install(second_vfs.clone());
    pm.install(PROJECT, &InstallOptions::default()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(installed_version(&second_vfs, "/proj/node_modules/cached"), "1.0.0");
}

#[tokio::test]
async fn test_non_registry_deps_of_registry_packages_install_at_top_level() {
    let mut fixture = Fixture::default();
    fixture.publish("shared", "1.1.0", json!({}));
    fixture.publish("t", "1.0.0", json!({ "shared": "^1.0.0" }));
    fixture.publish(
        "app",
        "1.0.0",
        json!({
            "t": tarball_url("t", "1.0.0"),
            "tool": "git+ssh://git@example.com/tool.git"
        }),
    );

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "app": "^1.0.0" } }));
    let (pm, _) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert_eq!(installed_version(&vfs, "/proj/node_modules/app"), "1.0.0");
    assert_eq!(installed_version(&vfs, "/proj/node_modules/t"), "1.0.0");
    assert_eq!(installed_version(&vfs, "/proj/node_modules/shared"), "1.1.0");
    let t = result.installed.iter().find(|p| p.name == "t").unwrap();
    assert_eq!(t.source, InstallSource::Tarball);
    assert_eq!(t.resolved, Some(tarball_url("t", "1.0.0")));

    assert!(!vfs.exists("/proj/node_modules/tool"));
    assert!(
        result.warnings.iter().any(|w| w.starts_with("tool:")),
        "{:?}",
        result.warnings
    );
}

#[tokio::test]
async fn test_lockfile_replay_skips_other_platforms() {
    let mut fixture = Fixture::default();
    fixture.publish("app", "1.0.0", json!({}));

    let vfs = Vfs::new();
    project(&vfs, &json!({ "dependencies": { "app": "^1.0.0" } }));
    let lock = json!({
        "lockfileVersion": 3,
        "packages": {
            "": { "dependencies": { "app": "^1.0.0" } },
            "node_modules/app": {
                "version": "1.0.0",
                "resolved": tarball_url("app", "1.0.0"),
                "integrity": fixture.integrity("app", "1.0.0")
            },
            "node_modules/@esbuild/none-such-os": {
                "version": "0.20.0",
                "resolved": "https://registry.test/@esbuild/none-such-os/-/none-such-os-0.20.0.tgz",
                "optional": true,
                "os": ["none-such-os"],
                "cpu": ["none-such-cpu"]
            }
        }
    });
    write(&vfs, "/proj/package-lock.json", &lock.to_string());

    let (pm, fetcher) = fixture.manager(&vfs);
    let result = pm.install(PROJECT, &InstallOptions::default()).await.unwrap();

    assert!(vfs.is_dir("/proj/node_modules/app"));
    assert!(!vfs.exists("/proj/node_modules/@esbuild/none-such-os"));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
}
