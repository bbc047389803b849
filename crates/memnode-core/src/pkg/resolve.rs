//! Dependency resolution against a [`Registry`].
//!
//! Resolution is flat: one version per package name. A root-level request
//! whose range the current pick does not satisfy replaces it; a transitive
//! request keeps whatever was picked first. Manifests are fetched once per
//! run and fan-out is bounded.
//!
//! Edges with non-registry protocols (`file:`, GitHub, archive URLs) are not
//! resolved here; they are collected for the installer, which places them in
//! the project's own `node_modules`.

use super::cancel::CancellationToken;
use super::error::PkgError;
use super::manifest::DepMap;
use super::registry::{PackageManifest, Registry};
use super::spec::{parse_dependency_spec, DepProtocol};
use super::version::{resolve_version, satisfies};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Maximum concurrent resolutions per fan-out.
pub const RESOLVE_CONCURRENCY: usize = 8;

/// A package picked by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// Name the package is installed under.
    pub name: String,
    pub version: String,
    pub tarball_url: String,
    /// Declared dependency ranges of the picked version.
    pub dependencies: DepMap,
    pub integrity: Option<String>,
    /// Registry name when requested through an `npm:` alias.
    pub alias_for: Option<String>,
    pub os: Vec<String>,
    pub cpu: Vec<String>,
}

impl ResolvedPackage {
    /// Name to fetch from the registry.
    #[must_use]
    pub fn registry_name(&self) -> &str {
        self.alias_for.as_deref().unwrap_or(&self.name)
    }
}

/// Options for dependency resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Include devDependencies of the root manifest.
    pub include_dev: bool,
    /// Follow optionalDependencies.
    pub include_optional: bool,
}

#[derive(Debug, Default)]
struct ResolveState {
    resolved: BTreeMap<String, ResolvedPackage>,
    in_flight: HashSet<String>,
    /// Non-registry edges by name; the first declaration wins.
    external: DepMap,
}

/// Recursive resolver. One instance is one resolution run.
pub struct Resolver {
    registry: Arc<dyn Registry>,
    options: ResolveOptions,
    cancel: CancellationToken,
    state: Mutex<ResolveState>,
    manifests: Mutex<HashMap<String, Arc<PackageManifest>>>,
    manifest_fetches: AtomicUsize,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("options", &self.options)
            .field("resolved", &self.state().resolved.len())
            .finish_non_exhaustive()
    }
}

/// What to do with a request given the current pick.
enum Decision {
    Skip,
    Resolve,
}

impl Resolver {
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, options: ResolveOptions) -> Self {
        Self {
            registry,
            options,
            cancel: CancellationToken::new(),
            state: Mutex::new(ResolveState::default()),
            manifests: Mutex::new(HashMap::new()),
            manifest_fetches: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn state(&self) -> MutexGuard<'_, ResolveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of manifests fetched from the registry so far.
    #[must_use]
    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::Relaxed)
    }

    /// Snapshot of the current picks, keyed by install name.
    #[must_use]
    pub fn resolved(&self) -> BTreeMap<String, ResolvedPackage> {
        self.state().resolved.clone()
    }

    /// Non-registry dependencies met so far, keyed by name, with their
    /// declared spec.
    #[must_use]
    pub fn external_dependencies(&self) -> DepMap {
        self.state().external.clone()
    }

    #[must_use]
    pub fn into_resolved(self) -> BTreeMap<String, ResolvedPackage> {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .resolved
    }

    /// Resolve one root-level request.
    pub async fn resolve_root(&self, name: &str, range: &str) -> Result<(), PkgError> {
        self.resolve(name, range, true).await
    }

    /// Resolve one transitive request.
    pub async fn resolve_transitive(&self, name: &str, range: &str) -> Result<(), PkgError> {
        self.resolve(name, range, false).await
    }

    /// Resolve a root dependency map concurrently.
    pub async fn resolve_dependencies(&self, deps: &DepMap) -> Result<(), PkgError> {
        let results: Vec<Result<(), PkgError>> = stream::iter(deps.iter())
            .map(|(name, range)| self.resolve(name, range, true))
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn manifest(&self, name: &str) -> Result<Arc<PackageManifest>, PkgError> {
        let cached = self
            .manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some(manifest) = cached {
            return Ok(manifest);
        }

        let manifest = Arc::new(self.registry.get_manifest(name).await?);
        self.manifest_fetches.fetch_add(1, Ordering::Relaxed);
        self.manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&manifest));
        Ok(manifest)
    }

    fn decide(&self, name: &str, range: &str, key: &str, is_root: bool) -> Decision {
        let mut state = self.state();
        if state.in_flight.contains(key) {
            return Decision::Skip;
        }
        if let Some(existing) = state.resolved.get(name) {
            if satisfies(&existing.version, range) {
                return Decision::Skip;
            }
            if !is_root {
                debug!(
                    name,
                    range,
                    kept = %existing.version,
                    "transitive range unsatisfied; keeping first pick"
                );
                return Decision::Skip;
            }
            debug!(name, range, replaced = %existing.version, "root range overrides pick");
            state.resolved.remove(name);
        }
        state.in_flight.insert(key.to_string());
        Decision::Resolve
    }

    fn resolve<'a>(
        &'a self,
        name: &'a str,
        range: &'a str,
        is_root: bool,
    ) -> BoxFuture<'a, Result<(), PkgError>> {
        async move {
            self.cancel.check()?;

            let parsed = parse_dependency_spec(name, range)?;
            if !parsed.is_registry_backed() {
                debug!(name, spec = range, protocol = %parsed.protocol, "deferring non-registry dependency");
                self.state()
                    .external
                    .entry(name.to_string())
                    .or_insert_with(|| range.to_string());
                return Ok(());
            }
            let (registry_name, target_range) = match parsed.protocol {
                DepProtocol::NpmAlias => (
                    parsed.target.clone().unwrap_or_else(|| name.to_string()),
                    parsed.range.clone().unwrap_or_else(|| "*".to_string()),
                ),
                _ => (
                    name.to_string(),
                    parsed.range.clone().unwrap_or_else(|| "*".to_string()),
                ),
            };

            let key = format!("{name}@{range}");
            if matches!(self.decide(name, &target_range, &key, is_root), Decision::Skip) {
                return Ok(());
            }

            let result = self
                .resolve_picked(name, &registry_name, &target_range, is_root)
                .await;
            self.state().in_flight.remove(&key);
            result
        }
        .boxed()
    }

    async fn resolve_picked(
        &self,
        name: &str,
        registry_name: &str,
        range: &str,
        is_root: bool,
    ) -> Result<(), PkgError> {
        let manifest = self.manifest(registry_name).await?;
        self.cancel.check()?;

        let version = resolve_version(&manifest, range)?;
        let meta = manifest
            .versions
            .get(&version)
            .ok_or_else(|| PkgError::version_not_found(registry_name, range))?;

        let picked = ResolvedPackage {
            name: name.to_string(),
            version: version.clone(),
            tarball_url: meta.dist.tarball.clone(),
            dependencies: meta.dependencies.clone(),
            integrity: meta.dist.integrity.clone().or_else(|| meta.dist.shasum.clone()),
            alias_for: (registry_name != name).then(|| registry_name.to_string()),
            os: meta.os.clone(),
            cpu: meta.cpu.clone(),
        };

        {
            let mut state = self.state();
            if let Some(existing) = state.resolved.get(name) {
                if !is_root {
                    // another request placed this name while we were fetching
                    return Ok(());
                }
                if existing.version == version {
                    return Ok(());
                }
            }
            state.resolved.insert(name.to_string(), picked);
        }
        debug!(name, version = %version, "resolved");

        let edges = meta.edges(self.options.include_optional);
        let optional: HashSet<&str> = meta
            .optional_dependencies
            .keys()
            .filter(|k| !meta.dependencies.contains_key(*k))
            .map(String::as_str)
            .collect();

        let results: Vec<(String, Result<(), PkgError>)> = stream::iter(edges)
            .map(|(dep, dep_range)| async move {
                let result = self.resolve(&dep, &dep_range, false).await;
                (dep, result)
            })
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .collect()
            .await;

        for (dep, result) in results {
            match result {
                Err(e) if optional.contains(dep.as_str()) && !e.is_cancelled() => {
                    warn!(package = name, dependency = %dep, error = %e, "optional dependency failed to resolve");
                }
                other => other?,
            }
        }
        Ok(())
    }
}

/// Resolve a root dependency map with a fresh [`Resolver`].
pub async fn resolve_dependencies(
    registry: Arc<dyn Registry>,
    deps: &DepMap,
    options: ResolveOptions,
) -> Result<BTreeMap<String, ResolvedPackage>, PkgError> {
    let resolver = Resolver::new(registry, options);
    resolver.resolve_dependencies(deps).await?;
    Ok(resolver.into_resolved())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct MockRegistry {
        manifests: HashMap<String, PackageManifest>,
        calls: AtomicUsize,
    }

    impl MockRegistry {
        /// `versions` maps version to its dependency object.
        fn add(&mut self, name: &str, versions: &[(&str, Value)]) {
            let mut map = serde_json::Map::new();
            for (version, deps) in versions {
                map.insert(
                    (*version).to_string(),
                    json!({
                        "version": version,
                        "dependencies": deps,
                        "dist": {
                            "tarball": format!("https://registry.test/{name}/-/{name}-{version}.tgz"),
                            "integrity": format!("sha512-{name}{version}")
                        }
                    }),
                );
            }
            let latest = versions.last().map(|(v, _)| *v).unwrap_or("0.0.0");
            let manifest: PackageManifest = serde_json::from_value(json!({
                "name": name,
                "dist-tags": { "latest": latest },
                "versions": map
            }))
            .unwrap();
            self.manifests.insert(name.to_string(), manifest);
        }
    }

    #[async_trait]
    impl Registry for MockRegistry {
        async fn get_manifest(&self, name: &str) -> Result<PackageManifest, PkgError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.manifests
                .get(name)
                .cloned()
                .ok_or_else(|| PkgError::not_found(name))
        }
    }

    fn deps(pairs: &[(&str, &str)]) -> DepMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_transitive_picks_highest_match() {
        let mut registry = MockRegistry::default();
        registry.add("app", &[("1.0.0", json!({ "shared": "^1.0.0" }))]);
        registry.add(
            "shared",
            &[("1.0.0", json!({})), ("1.5.0", json!({})), ("2.0.0", json!({}))],
        );

        let resolved = resolve_dependencies(
            Arc::new(registry),
            &deps(&[("app", "^1.0.0")]),
            ResolveOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(resolved["app"].version, "1.0.0");
        assert_eq!(resolved["shared"].version, "1.5.0");
        assert_eq!(
            resolved["shared"].tarball_url,
            "https://registry.test/shared/-/shared-1.5.0.tgz"
        );
        assert_eq!(resolved["shared"].integrity.as_deref(), Some("sha512-shared1.5.0"));
    }

    #[tokio::test]
    async fn test_root_range_overrides_transitive_pick() {
        let mut registry = MockRegistry::default();
        registry.add("lib", &[("1.0.0", json!({ "react-dom": "^18.0.0" }))]);
        registry.add("react-dom", &[("18.2.0", json!({})), ("18.3.1", json!({}))]);
        let resolver = Resolver::new(Arc::new(registry), ResolveOptions::default());

        resolver.resolve_root("lib", "^1.0.0").await.unwrap();
        assert_eq!(resolver.resolved()["react-dom"].version, "18.3.1");

        resolver.resolve_root("react-dom", "~18.2.0").await.unwrap();
        assert_eq!(resolver.resolved()["react-dom"].version, "18.2.0");
    }

    #[tokio::test]
    async fn test_transitive_conflict_keeps_first_pick() {
        let mut registry = MockRegistry::default();
        registry.add("z", &[("1.0.0", json!({})), ("2.0.0", json!({}))]);
        let resolver = Resolver::new(Arc::new(registry), ResolveOptions::default());

        resolver.resolve_transitive("z", "^1.0.0").await.unwrap();
        resolver.resolve_transitive("z", "^2.0.0").await.unwrap();
        assert_eq!(resolver.resolved()["z"].version, "1.0.0");
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let mut registry = MockRegistry::default();
        registry.add("a", &[("1.0.0", json!({ "b": "^1.0.0" }))]);
        registry.add("b", &[("1.0.0", json!({ "a": "^1.0.0" }))]);

        let resolved = resolve_dependencies(
            Arc::new(registry),
            &deps(&[("a", "^1.0.0")]),
            ResolveOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[tokio::test]
    async fn test_alias_records_registry_name() {
        let mut registry = MockRegistry::default();
        registry.add("react", &[("17.0.2", json!({})), ("18.2.0", json!({}))]);

        let resolved = resolve_dependencies(
            Arc::new(registry),
            &deps(&[("react17", "npm:react@^17.0.0")]),
            ResolveOptions::default(),
        )
        .await
        .unwrap();

        let alias = &resolved["react17"];
        assert_eq!(alias.version, "17.0.2");
        assert_eq!(alias.registry_name(), "react");
        assert!(!resolved.contains_key("react"));
    }

    #[tokio::test]
    async fn test_non_registry_edges_are_collected() {
        let mut registry = MockRegistry::default();
        registry.add(
            "app",
            &[(
                "1.0.0",
                json!({ "local": "file:../local", "gh": "github:acme/gh", "ok": "1.0.0" }),
            )],
        );
        registry.add("ok", &[("1.0.0", json!({}))]);

        let resolver = Resolver::new(Arc::new(registry), ResolveOptions::default());
        resolver.resolve_root("app", "1.0.0").await.unwrap();

        assert_eq!(
            resolver.resolved().keys().cloned().collect::<Vec<_>>(),
            vec!["app".to_string(), "ok".to_string()]
        );
        let external = resolver.external_dependencies();
        assert_eq!(external.len(), 2);
        assert_eq!(external["local"], "file:../local");
        assert_eq!(external["gh"], "github:acme/gh");
    }

    #[tokio::test]
    async fn test_manifests_fetched_once() {
        let mut registry = MockRegistry::default();
        registry.add("x", &[("1.0.0", json!({ "shared": "^1.0.0" }))]);
        registry.add("y", &[("1.0.0", json!({ "shared": "^1.0.0" }))]);
        registry.add("shared", &[("1.0.0", json!({}))]);
        let registry = Arc::new(registry);

        let resolver = Resolver::new(registry.clone(), ResolveOptions::default());
        resolver
            .resolve_dependencies(&deps(&[("x", "1.0.0"), ("y", "1.0.0"), ("shared", "^1.0.0")]))
            .await
            .unwrap();
        assert_eq!(resolver.resolved().len(), 3);
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_package_and_version() {
        let mut registry = MockRegistry::default();
        registry.add("x", &[("1.0.0", json!({}))]);
        let registry: Arc<dyn Registry> = Arc::new(registry);

        let err = resolve_dependencies(registry.clone(), &deps(&[("nope", "1.0.0")]), ResolveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_NOT_FOUND);

        let err = resolve_dependencies(registry, &deps(&[("x", "^9.0.0")]), ResolveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_VERSION_NOT_FOUND);
        assert!(err.message().contains("^9.0.0"));
    }

    #[tokio::test]
    async fn test_optional_failures_are_tolerated() {
        let mut registry = MockRegistry::default();
        let manifest: PackageManifest = serde_json::from_value(json!({
            "name": "app",
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": {
                "version": "1.0.0",
                "dist": { "tarball": "https://registry.test/app.tgz" },
                "optionalDependencies": { "missing-native": "^1.0.0" }
            } }
        }))
        .unwrap();
        registry.manifests.insert("app".into(), manifest);

        let options = ResolveOptions {
            include_optional: true,
            ..ResolveOptions::default()
        };
        let resolved = resolve_dependencies(Arc::new(registry), &deps(&[("app", "1.0.0")]), options)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let mut registry = MockRegistry::default();
        registry.add("x", &[("1.0.0", json!({}))]);
        let token = CancellationToken::new();
        token.cancel();
        let resolver =
            Resolver::new(Arc::new(registry), ResolveOptions::default()).with_cancellation(token);

        let err = resolver.resolve_root("x", "1.0.0").await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
