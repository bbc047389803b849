//! Install orchestration.
//!
//! [`PackageManager`] turns a project's `package.json` into a populated
//! `node_modules` inside the VFS. A usable lockfile is replayed entry by
//! entry; otherwise dependencies are classified by protocol, local sources
//! are materialized through a worklist, registry dependencies are resolved
//! flat and extracted. Bin shims and `node_modules/.package-lock.json` are
//! written once every package is in place.

use super::bin::{link_bins, missing_artifacts};
use super::cache::{ArchiveCache, CacheKey, DiskStore};
use super::cancel::CancellationToken;
use super::error::PkgError;
use super::fetch::HttpFetcher;
use super::integrity::verify_integrity;
use super::lockfile::{self, LockInstallEntry, ParsedLockfile};
use super::manifest::{write_dependency, DepMap, PackageJson};
use super::npmrc::Npmrc;
use super::platform::{allows_list, current_cpu, current_os};
use super::registry::{Registry, RegistryClient};
use super::resolve::{ResolveOptions, ResolvedPackage, Resolver};
use super::spec::{parse_dependency_spec, DepProtocol, PackageSpec};
use super::tarball::{extract_subdir_to_vfs, extract_to_vfs};
use super::version::resolve_version;
use super::workspaces::{find_workspace_root, Workspaces};
use crate::config::Config;
use crate::vfs::{path as vpath, Vfs};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Maximum concurrent package installs.
pub const INSTALL_CONCURRENCY: usize = 6;

/// Introspection file written below `node_modules`.
pub const PACKAGE_LOCK_FILE: &str = ".package-lock.json";

/// Post-install source rewriting hook (e.g. ESM to CommonJS).
#[async_trait]
pub trait SourceTransformer: Send + Sync {
    /// Rewrite the installed package in `package_dir` in place.
    async fn transform(&self, vfs: &Vfs, package_dir: &str) -> Result<(), PkgError>;
}

/// Options for an install run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Install root `devDependencies`.
    pub include_dev: bool,
    /// Install `optionalDependencies`.
    pub include_optional: bool,
    /// Substitute the published package for workspace members whose build
    /// artifacts are missing.
    pub prefer_published: bool,
    /// Replay a lockfile when one is present.
    pub use_lockfile: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            include_dev: true,
            include_optional: true,
            prefer_published: false,
            use_lockfile: true,
        }
    }
}

/// Where an installed package came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallSource {
    Registry,
    Lockfile,
    Workspace,
    File,
    Link,
    Tarball,
    Github,
}

/// One package placed in `node_modules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    /// VFS directory of the package.
    pub path: String,
    pub source: InstallSource,
    /// Archive URL for fetched packages.
    pub resolved: Option<String>,
}

/// Outcome of an install.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallResult {
    /// Installed packages, sorted by path.
    pub installed: Vec<InstalledPackage>,
    /// `.bin` commands written.
    pub bins: Vec<String>,
    /// Non-fatal problems (optional packages, transforms).
    pub warnings: Vec<String>,
    /// Lockfile that was replayed, if any.
    pub lockfile: Option<String>,
}

/// One `.package-lock.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageLockRecord {
    version: String,
    resolved: Option<String>,
}

/// Where a non-registry dependency is materialized from.
#[derive(Debug, Clone)]
enum LocalSource {
    /// Recursive copy of a VFS directory.
    Copy { dir: String, kind: InstallSource },
    /// Symlink to a VFS directory.
    Link { dir: String },
    /// Archive inside the VFS (`file:` pointing at a `.tgz`).
    LocalArchive { path: String },
    /// Remote archive; `subdir` re-roots a monorepo checkout.
    Remote {
        url: String,
        subdir: Option<String>,
        kind: InstallSource,
    },
}

#[derive(Debug, Clone)]
struct WorkItem {
    name: String,
    source: LocalSource,
}

/// Result of classifying one dependency value.
enum Classified {
    /// Hand to the resolver with this spec.
    Registry(String),
    Local(WorkItem),
}

/// `workspace:` range to request from the registry for a member at `version`.
fn published_range(range: &str, version: &str) -> String {
    match range {
        "" | "*" | "^" => format!("^{version}"),
        "~" => format!("~{version}"),
        other => other.to_string(),
    }
}

fn is_archive_path(path: &str) -> bool {
    path.ends_with(".tgz") || path.ends_with(".tar.gz")
}

/// Dist tags look like identifiers (`latest`, `next`), never like ranges.
fn is_dist_tag(range: &str) -> bool {
    range.starts_with(|c: char| c.is_ascii_alphabetic())
        && range
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn skip_copied(name: &str) -> bool {
    name == "node_modules" || name == ".git"
}

/// The package manager over one VFS.
pub struct PackageManager {
    vfs: Vfs,
    registry: Arc<dyn Registry>,
    archives: Arc<ArchiveCache>,
    transformer: Option<Arc<dyn SourceTransformer>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageManager")
            .field("archives", &self.archives)
            .field("transformer", &self.transformer.is_some())
            .finish_non_exhaustive()
    }
}

impl PackageManager {
    #[must_use]
    pub fn new(vfs: Vfs, registry: Arc<dyn Registry>, archives: Arc<ArchiveCache>) -> Self {
        Self {
            vfs,
            registry,
            archives,
            transformer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// HTTP registry and fetcher configured from `.npmrc` in the project,
    /// with the host-disk archive store for the configured channel.
    pub fn from_config(vfs: Vfs, project_dir: &str, config: &Config) -> Result<Self, PkgError> {
        let npmrc = Npmrc::load(&vfs, project_dir);
        let registry =
            RegistryClient::configured(config.registry_override().as_deref(), npmrc.clone())?;
        let fetcher = HttpFetcher::with_client(registry.http().clone(), npmrc);
        let archives = ArchiveCache::new(Arc::new(fetcher))
            .with_store(Arc::new(DiskStore::for_channel(config.channel)));
        debug!(registry = %registry.base_url(), "package manager configured");
        Ok(Self::new(vfs, Arc::new(registry), Arc::new(archives)))
    }

    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn SourceTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    #[must_use]
    pub fn archives(&self) -> &ArchiveCache {
        &self.archives
    }

    /// Install every dependency of the project in `project_dir`.
    pub async fn install(
        &self,
        project_dir: &str,
        options: &InstallOptions,
    ) -> Result<InstallResult, PkgError> {
        let session = Session::new(self, project_dir, options.clone());
        let manifest = PackageJson::read(&self.vfs, &session.project_dir)?;
        self.cancel.check()?;

        if options.use_lockfile {
            if let Some(lock) = lockfile::load(&self.vfs, &session.project_dir) {
                info!(
                    lockfile = %lock.path,
                    entries = lock.entries.len(),
                    "replaying lockfile"
                );
                session.replay(&lock).await?;
                return session.finish(Some(lock.path), false);
            }
        }

        let (deps, optional) = root_dependencies(&manifest, options);
        info!(
            project = %session.project_dir,
            dependencies = deps.len(),
            "installing from package.json"
        );
        session.install_dependencies(&deps, &optional).await?;
        session.finish(None, false)
    }

    /// Record `request` (`name[@spec]`) in `package.json`, then install.
    ///
    /// Without a spec, or with a dist tag, the resolved version is recorded
    /// as a caret range.
    pub async fn add(
        &self,
        project_dir: &str,
        request: &str,
        dev: bool,
        options: &InstallOptions,
    ) -> Result<InstallResult, PkgError> {
        let requested = PackageSpec::parse(request)?;
        let spec = self.recorded_spec(&requested).await?;
        let section = if dev { "devDependencies" } else { "dependencies" };
        write_dependency(&self.vfs, project_dir, &requested.name, &spec, section)?;
        info!(name = %requested.name, spec = %spec, section, "added dependency");

        // the lockfile predates the new dependency
        let options = InstallOptions {
            use_lockfile: false,
            include_dev: options.include_dev || dev,
            ..options.clone()
        };
        self.install(project_dir, &options).await
    }

    /// Install a single dependency into the project without touching its
    /// `package.json`.
    pub async fn install_package(
        &self,
        project_dir: &str,
        name: &str,
        spec: &str,
        options: &InstallOptions,
    ) -> Result<InstallResult, PkgError> {
        let session = Session::new(self, project_dir, options.clone());
        let deps = DepMap::from([(name.to_string(), spec.to_string())]);
        session.install_dependencies(&deps, &HashSet::new()).await?;
        session.finish(None, true)
    }

    async fn recorded_spec(&self, requested: &PackageSpec) -> Result<String, PkgError> {
        let range = match requested.range.as_deref() {
            Some(range) => {
                parse_dependency_spec(&requested.name, range)?.ensure_supported()?;
                if !is_dist_tag(range) {
                    return Ok(range.to_string());
                }
                range
            }
            None => "latest",
        };
        let manifest = self.registry.get_manifest(&requested.name).await?;
        let version = resolve_version(&manifest, range)?;
        Ok(format!("^{version}"))
    }
}

/// Root dependency map for `options`, plus the names that are optional.
///
/// `dependencies` win over `optionalDependencies`, which win over
/// `devDependencies`.
fn root_dependencies(manifest: &PackageJson, options: &InstallOptions) -> (DepMap, HashSet<String>) {
    let mut deps = DepMap::new();
    if options.include_dev {
        deps.extend(manifest.dev_dependencies.clone());
    }
    let mut optional = HashSet::new();
    if options.include_optional {
        for (name, spec) in &manifest.optional_dependencies {
            if !manifest.dependencies.contains_key(name) {
                optional.insert(name.clone());
            }
            deps.insert(name.clone(), spec.clone());
        }
    }
    deps.extend(manifest.dependencies.clone());
    (deps, optional)
}

/// State of one install run.
struct Session<'a> {
    pm: &'a PackageManager,
    project_dir: String,
    node_modules: String,
    options: InstallOptions,
    installed: Mutex<Vec<InstalledPackage>>,
    warnings: Mutex<Vec<String>>,
}

impl<'a> Session<'a> {
    fn new(pm: &'a PackageManager, project_dir: &str, options: InstallOptions) -> Self {
        let project_dir = vpath::normalize(project_dir);
        Self {
            pm,
            node_modules: vpath::join(&project_dir, "node_modules"),
            project_dir,
            options,
            installed: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    fn vfs(&self) -> &Vfs {
        &self.pm.vfs
    }

    fn record(&self, package: InstalledPackage) {
        debug!(name = %package.name, version = %package.version, path = %package.path, "installed");
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(package);
    }

    fn add_warning(&self, message: String) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn package_dir(&self, name: &str) -> String {
        vpath::join(&self.node_modules, name)
    }

    // Classification

    fn classify(
        &self,
        name: &str,
        raw: &str,
        base_dir: &str,
        workspaces: Option<&Workspaces>,
    ) -> Result<Classified, PkgError> {
        let parsed = parse_dependency_spec(name, raw)?;
        parsed.ensure_supported()?;

        let source = match parsed.protocol {
            DepProtocol::Registry | DepProtocol::NpmAlias => {
                return Ok(Classified::Registry(raw.to_string()));
            }
            DepProtocol::Workspace => {
                let member = workspaces
                    .and_then(|ws| ws.get(name))
                    .ok_or_else(|| PkgError::workspace_not_found(name))?;
                if self.options.prefer_published {
                    let missing = missing_artifacts(self.vfs(), &member.dir, &member.manifest);
                    if !missing.is_empty() {
                        let range = published_range(
                            parsed.range.as_deref().unwrap_or("*"),
                            &member.version,
                        );
                        info!(
                            name,
                            range = %range,
                            missing = ?missing,
                            "workspace package lacks build output; using published package"
                        );
                        return Ok(Classified::Registry(range));
                    }
                }
                LocalSource::Copy {
                    dir: member.dir.clone(),
                    kind: InstallSource::Workspace,
                }
            }
            DepProtocol::File => {
                let path = vpath::join(base_dir, parsed.target.as_deref().unwrap_or("."));
                if self.vfs().is_dir(&path) {
                    LocalSource::Copy {
                        dir: path,
                        kind: InstallSource::File,
                    }
                } else if self.vfs().is_file(&path) && is_archive_path(&path) {
                    LocalSource::LocalArchive { path }
                } else {
                    return Err(PkgError::local_not_found(name, &path));
                }
            }
            DepProtocol::Link => {
                let path = vpath::join(base_dir, parsed.target.as_deref().unwrap_or("."));
                if !self.vfs().is_dir(&path) {
                    return Err(PkgError::local_not_found(name, &path));
                }
                LocalSource::Link { dir: path }
            }
            DepProtocol::Tarball => LocalSource::Remote {
                url: parsed.target.clone().unwrap_or_default(),
                subdir: None,
                kind: InstallSource::Tarball,
            },
            DepProtocol::Github => {
                let github = parsed
                    .github
                    .as_ref()
                    .ok_or_else(|| PkgError::spec_invalid(format!("Invalid GitHub spec for {name}: {raw}")))?;
                LocalSource::Remote {
                    url: github.tarball_url(),
                    subdir: github.subdir.clone(),
                    kind: InstallSource::Github,
                }
            }
            DepProtocol::Git => return Err(PkgError::unsupported_protocol(name, raw)),
        };
        Ok(Classified::Local(WorkItem {
            name: name.to_string(),
            source,
        }))
    }

    // Manifest-driven install

    async fn install_dependencies(
        &self,
        deps: &DepMap,
        optional: &HashSet<String>,
    ) -> Result<(), PkgError> {
        let workspaces = find_workspace_root(self.vfs(), &self.project_dir);

        // classify everything first so bad local targets fail before any write
        let mut required_roots = DepMap::new();
        let mut optional_roots = DepMap::new();
        let mut worklist = VecDeque::new();
        for (name, raw) in deps {
            match self.classify(name, raw, &self.project_dir, workspaces.as_ref())? {
                Classified::Registry(spec) if optional.contains(name) => {
                    optional_roots.insert(name.clone(), spec);
                }
                Classified::Registry(spec) => {
                    required_roots.insert(name.clone(), spec);
                }
                Classified::Local(item) => worklist.push_back(item),
            }
        }

        let resolver = Resolver::new(
            Arc::clone(&self.pm.registry),
            ResolveOptions {
                include_dev: self.options.include_dev,
                include_optional: self.options.include_optional,
            },
        )
        .with_cancellation(self.pm.cancel.clone());

        let mut claimed: HashSet<String> = HashSet::new();
        let transitive = self
            .drain_worklist(&mut worklist, &mut claimed, deps, workspaces.as_ref())
            .await?;

        resolver.resolve_dependencies(&required_roots).await?;
        for (name, spec) in &optional_roots {
            if let Err(e) = resolver.resolve_root(name, spec).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(name = %name, error = %e, "optional dependency failed to resolve");
                self.add_warning(format!("{name}: {e}"));
            }
        }
        for (name, spec) in &transitive {
            resolver.resolve_transitive(name, spec).await?;
        }

        // non-registry deps of registry packages land in this project's
        // node_modules; their own deps may add more of both kinds
        let mut deferred: HashSet<String> = HashSet::new();
        loop {
            for (name, raw) in resolver.external_dependencies() {
                if claimed.contains(&name) || deps.contains_key(&name) || !deferred.insert(name.clone()) {
                    continue;
                }
                match self.classify(&name, &raw, &self.project_dir, workspaces.as_ref()) {
                    Ok(Classified::Local(item)) => worklist.push_back(item),
                    Ok(Classified::Registry(spec)) => resolver.resolve_transitive(&name, &spec).await?,
                    Err(e) => {
                        warn!(name = %name, spec = %raw, error = %e, "transitive dependency cannot be installed");
                        self.add_warning(format!("{name}: {e}"));
                    }
                }
            }
            if worklist.is_empty() {
                break;
            }
            let transitive = self
                .drain_worklist(&mut worklist, &mut claimed, deps, workspaces.as_ref())
                .await?;
            for (name, spec) in &transitive {
                resolver.resolve_transitive(name, spec).await?;
            }
        }
        debug!(
            packages = resolver.resolved().len(),
            manifests = resolver.manifest_fetches(),
            "resolution complete"
        );

        let packages: Vec<ResolvedPackage> = resolver
            .into_resolved()
            .into_values()
            .filter(|pkg| !claimed.contains(&pkg.name))
            .filter(|pkg| {
                let supported =
                    allows_list(&pkg.os, current_os()) && allows_list(&pkg.cpu, current_cpu());
                if !supported {
                    debug!(name = %pkg.name, version = %pkg.version, "skipping package for another platform");
                }
                supported
            })
            .collect();

        let results: Vec<(&ResolvedPackage, Result<(), PkgError>)> = stream::iter(packages.iter())
            .map(|pkg| async move { (pkg, self.install_resolved(pkg).await) })
            .buffer_unordered(INSTALL_CONCURRENCY)
            .collect()
            .await;

        let mut first_error = None;
        for (pkg, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if optional.contains(&pkg.name) && !e.is_cancelled() => {
                    warn!(name = %pkg.name, error = %e, "optional dependency failed to install");
                    self.add_warning(format!("{}: {e}", pkg.name));
                }
                Err(e) => {
                    warn!(name = %pkg.name, version = %pkg.version, error = %e, "package failed to install");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Install queued local sources. Their local deps join the queue; their
    /// registry deps are returned as transitive requests.
    async fn drain_worklist(
        &self,
        worklist: &mut VecDeque<WorkItem>,
        claimed: &mut HashSet<String>,
        roots: &DepMap,
        workspaces: Option<&Workspaces>,
    ) -> Result<Vec<(String, String)>, PkgError> {
        let mut transitive: Vec<(String, String)> = Vec::new();
        while let Some(item) = worklist.pop_front() {
            self.pm.cancel.check()?;
            if !claimed.insert(item.name.clone()) {
                continue;
            }
            let (dest, base_dir) = self.install_local(&item).await?;
            let Ok(manifest) = PackageJson::read(self.vfs(), &dest) else {
                continue;
            };
            for (dep, raw) in &manifest.dependencies {
                if claimed.contains(dep) || roots.contains_key(dep) {
                    continue;
                }
                match self.classify(dep, raw, &base_dir, workspaces)? {
                    Classified::Registry(spec) => transitive.push((dep.clone(), spec)),
                    Classified::Local(next) => worklist.push_back(next),
                }
            }
        }
        Ok(transitive)
    }

    /// Materialize a local source. Returns the installed directory and the
    /// directory its own relative specs resolve against.
    async fn install_local(&self, item: &WorkItem) -> Result<(String, String), PkgError> {
        let dest = self.package_dir(&item.name);
        let vfs = self.vfs();
        vfs.remove_all(&dest)?;

        match &item.source {
            LocalSource::Copy { dir, kind } => {
                vfs.copy_dir(dir, &dest, &skip_copied)?;
                self.transform(&item.name, &dest).await;
                self.record_local(&item.name, &dest, *kind, None);
                Ok((dest, dir.clone()))
            }
            LocalSource::Link { dir } => {
                vfs.create_dir_all(&vpath::dirname(&dest))?;
                vfs.symlink(dir, &dest)?;
                self.record_local(&item.name, &dest, InstallSource::Link, None);
                Ok((dest, dir.clone()))
            }
            LocalSource::LocalArchive { path } => {
                let bytes = vfs.read_file(path)?;
                extract_to_vfs(vfs, &bytes, &dest, 1, None)?;
                self.transform(&item.name, &dest).await;
                self.record_local(&item.name, &dest, InstallSource::File, None);
                Ok((dest.clone(), dest))
            }
            LocalSource::Remote { url, subdir, kind } => {
                self.install_archive(&item.name, url, None, &dest, subdir.as_deref())
                    .await?;
                self.record_local(&item.name, &dest, *kind, Some(url.clone()));
                Ok((dest.clone(), dest))
            }
        }
    }

    fn record_local(&self, name: &str, dest: &str, source: InstallSource, resolved: Option<String>) {
        let version = PackageJson::read(self.vfs(), dest)
            .map(|m| m.version_or_default().to_string())
            .unwrap_or_else(|_| "0.0.0".to_string());
        self.record(InstalledPackage {
            name: name.to_string(),
            version,
            path: dest.to_string(),
            source,
            resolved,
        });
    }

    async fn install_resolved(&self, pkg: &ResolvedPackage) -> Result<(), PkgError> {
        let dest = self.package_dir(&pkg.name);
        self.install_archive(&pkg.name, &pkg.tarball_url, pkg.integrity.as_deref(), &dest, None)
            .await?;
        self.record(InstalledPackage {
            name: pkg.name.clone(),
            version: pkg.version.clone(),
            path: dest,
            source: InstallSource::Registry,
            resolved: Some(pkg.tarball_url.clone()),
        });
        Ok(())
    }

    /// Fetch through the archive cache, verify, recreate `dest` and extract.
    async fn install_archive(
        &self,
        name: &str,
        url: &str,
        integrity: Option<&str>,
        dest: &str,
        subdir: Option<&str>,
    ) -> Result<(), PkgError> {
        self.pm.cancel.check()?;
        if url.is_empty() {
            return Err(PkgError::download_failed(format!("No tarball URL for {name}")));
        }
        let key = CacheKey::archive(url);
        let bytes = self.pm.archives.get_or_fetch(&key, url).await?;

        if let Some(expected) = integrity {
            match verify_integrity(&bytes, expected) {
                Some(true) => {}
                Some(false) => {
                    self.pm.archives.invalidate(&key).await;
                    return Err(PkgError::integrity_mismatch(name, expected));
                }
                None => debug!(name, integrity = expected, "unsupported integrity format; not verified"),
            }
        }

        let vfs = self.vfs();
        vfs.remove_all(dest)?;
        match subdir {
            Some(subdir) => extract_subdir_to_vfs(vfs, &bytes, dest, subdir)?,
            None => extract_to_vfs(vfs, &bytes, dest, 1, None)?,
        };
        self.transform(name, dest).await;
        Ok(())
    }

    async fn transform(&self, name: &str, dir: &str) {
        let Some(transformer) = &self.pm.transformer else {
            return;
        };
        if let Err(e) = transformer.transform(self.vfs(), dir).await {
            warn!(name, error = %e, "source transform failed; keeping original sources");
            self.add_warning(format!("{name}: transform failed: {e}"));
        }
    }

    // Lockfile replay

    async fn replay(&self, lock: &ParsedLockfile) -> Result<(), PkgError> {
        for level in lock.levels() {
            self.pm.cancel.check()?;
            let wanted: Vec<&LockInstallEntry> = level
                .into_iter()
                .filter(|e| self.options.include_dev || !e.dev)
                .filter(|e| self.options.include_optional || !e.optional)
                .filter(|e| {
                    let supported = e.supports_host();
                    if !supported {
                        debug!(key = %e.key, version = %e.version, "skipping lockfile entry for another platform");
                    }
                    supported
                })
                .collect();

            let results: Vec<(&LockInstallEntry, Result<(), PkgError>)> = stream::iter(wanted)
                .map(|entry| async move { (entry, self.replay_entry(entry).await) })
                .buffer_unordered(INSTALL_CONCURRENCY)
                .collect()
                .await;

            let mut first_error = None;
            for (entry, result) in results {
                match result {
                    Ok(()) => {}
                    Err(e) if entry.optional && !e.is_cancelled() => {
                        warn!(key = %entry.key, error = %e, "optional lockfile entry failed");
                        self.add_warning(format!("{}: {e}", entry.key));
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn replay_entry(&self, entry: &LockInstallEntry) -> Result<(), PkgError> {
        let dest = entry.install_path.clone();
        let vfs = self.vfs();

        if let Some(source) = &entry.local_source {
            if !vfs.is_dir(source) {
                return Err(PkgError::local_not_found(&entry.name, source));
            }
            vfs.remove_all(&dest)?;
            let kind = if entry.link {
                vfs.create_dir_all(&vpath::dirname(&dest))?;
                vfs.symlink(source, &dest)?;
                InstallSource::Link
            } else {
                vfs.copy_dir(source, &dest, &skip_copied)?;
                self.transform(&entry.name, &dest).await;
                InstallSource::File
            };
            self.record(InstalledPackage {
                name: entry.name.clone(),
                version: entry.version.clone(),
                path: dest,
                source: kind,
                resolved: None,
            });
            return Ok(());
        }

        let fetchable = entry
            .resolved
            .as_deref()
            .filter(|url| url.starts_with("https://") || url.starts_with("http://"));
        let (url, integrity) = match fetchable {
            Some(url) => (url.to_string(), entry.integrity.clone()),
            None => {
                let name = entry.registry_name();
                let manifest = self.pm.registry.get_manifest(name).await?;
                let meta = manifest
                    .versions
                    .get(&entry.version)
                    .ok_or_else(|| PkgError::version_not_found(name, &entry.version))?;
                (
                    meta.dist.tarball.clone(),
                    entry
                        .integrity
                        .clone()
                        .or_else(|| meta.dist.integrity.clone()),
                )
            }
        };

        self.install_archive(&entry.name, &url, integrity.as_deref(), &dest, None)
            .await?;
        self.record(InstalledPackage {
            name: entry.name.clone(),
            version: entry.version.clone(),
            path: dest,
            source: InstallSource::Lockfile,
            resolved: Some(url),
        });
        Ok(())
    }

    // Completion

    /// Write bin shims and `.package-lock.json`, then assemble the result.
    /// With `merge`, existing `.package-lock.json` records are kept.
    fn finish(self, lockfile: Option<String>, merge: bool) -> Result<InstallResult, PkgError> {
        let pm = self.pm;
        let vfs = &pm.vfs;
        let bins = link_bins(vfs, &self.node_modules)?;

        let mut installed = self
            .installed
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        installed.sort_by(|a, b| a.path.cmp(&b.path));

        let lock_path = vpath::join(&self.node_modules, PACKAGE_LOCK_FILE);
        let mut records: BTreeMap<String, PackageLockRecord> = if merge {
            vfs.read_file(&lock_path)
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        for package in &installed {
            let top_level = vpath::join(&self.node_modules, &package.name);
            if package.path == top_level {
                records.insert(
                    package.name.clone(),
                    PackageLockRecord {
                        version: package.version.clone(),
                        resolved: package.resolved.clone(),
                    },
                );
            }
        }
        vfs.create_dir_all(&self.node_modules)?;
        let mut encoded = serde_json::to_string_pretty(&records)
            .map_err(|e| PkgError::cache_error(format!("Failed to encode {PACKAGE_LOCK_FILE}: {e}")))?;
        encoded.push('\n');
        vfs.write_file(&lock_path, encoded)?;

        let warnings = self
            .warnings
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            installed = installed.len(),
            bins = bins.len(),
            warnings = warnings.len(),
            "install complete"
        );
        Ok(InstallResult {
            installed,
            bins,
            warnings,
            lockfile,
        })
    }
}
