//! npm registry client.
//!
//! The resolver only needs [`Registry::get_manifest`]; [`RegistryClient`] is
//! the HTTP implementation. Any conformant source (a mock, a mirror, a
//! pre-fetched bundle) may be substituted.

use super::error::PkgError;
use super::manifest::{lenient, lenient_deps, string_or_list, DepMap, PeerMeta};
use super::npmrc::Npmrc;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// `dist` block of a published version.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Dist {
    #[serde(deserialize_with = "lenient")]
    pub tarball: String,
    #[serde(deserialize_with = "lenient")]
    pub integrity: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub shasum: Option<String>,
}

/// One entry of a packument's `versions` map.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionManifest {
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub version: String,
    #[serde(deserialize_with = "lenient")]
    pub dist: Dist,
    #[serde(deserialize_with = "lenient_deps")]
    pub dependencies: DepMap,
    #[serde(deserialize_with = "lenient_deps")]
    pub peer_dependencies: DepMap,
    #[serde(deserialize_with = "lenient")]
    pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
    #[serde(deserialize_with = "lenient_deps")]
    pub optional_dependencies: DepMap,
    pub bin: Option<Value>,
    #[serde(deserialize_with = "string_or_list")]
    pub os: Vec<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub cpu: Vec<String>,
}

impl VersionManifest {
    /// Dependency edges to follow for this version.
    ///
    /// `dependencies`, plus non-optional peers (a literal dependency entry
    /// wins over the peer range), plus optional dependencies when enabled.
    #[must_use]
    pub fn edges(&self, include_optional: bool) -> DepMap {
        let mut edges = DepMap::new();
        if include_optional {
            edges.extend(
                self.optional_dependencies
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        for (name, range) in &self.peer_dependencies {
            let optional = self
                .peer_dependencies_meta
                .get(name)
                .is_some_and(|m| m.optional);
            if !optional {
                edges.insert(name.clone(), range.clone());
            }
        }
        edges.extend(
            self.dependencies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        edges
    }
}

/// A registry packument.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackageManifest {
    #[serde(deserialize_with = "lenient")]
    pub name: String,
    #[serde(rename = "dist-tags", deserialize_with = "lenient")]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(deserialize_with = "lenient_versions")]
    pub versions: BTreeMap<String, VersionManifest>,
}

/// Malformed version entries are dropped individually.
fn lenient_versions<'de, D>(d: D) -> Result<BTreeMap<String, VersionManifest>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    let Value::Object(map) = value else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(version, entry)| {
            let mut manifest: VersionManifest = serde_json::from_value(entry).ok()?;
            if manifest.version.is_empty() {
                manifest.version.clone_from(&version);
            }
            Some((version, manifest))
        })
        .collect())
}

/// Source of package manifests.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the packument for `name`.
    async fn get_manifest(&self, name: &str) -> Result<PackageManifest, PkgError>;
}

/// HTTP registry client honoring `.npmrc` scopes and tokens.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    npmrc: Npmrc,
    http: Client,
}

/// Build the shared HTTP client.
pub(crate) fn http_client() -> Result<Client, PkgError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(60))
        .user_agent(concat!("memnode/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))
}

impl RegistryClient {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        Self::with_npmrc(base_url, Npmrc::default())
    }

    /// Create a client with `.npmrc` scoped registries and tokens.
    pub fn with_npmrc(base_url: &str, npmrc: Npmrc) -> Result<Self, PkgError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| PkgError::registry(format!("Invalid registry URL '{base_url}': {e}")))?;
        Ok(Self {
            base_url,
            npmrc,
            http: http_client()?,
        })
    }

    /// Pick the registry: explicit override, then `.npmrc`, then the default.
    pub fn configured(override_url: Option<&str>, npmrc: Npmrc) -> Result<Self, PkgError> {
        let base = override_url
            .map(String::from)
            .or_else(|| npmrc.registry.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        Self::with_npmrc(&base, npmrc)
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn npmrc(&self) -> &Npmrc {
        &self.npmrc
    }

    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Registry URL used for `name`.
    #[must_use]
    pub fn registry_for(&self, name: &str) -> &Url {
        self.npmrc.scoped_registry(name).unwrap_or(&self.base_url)
    }

    /// Packument URL for `name` (scoped names keep `@` and encode `/`).
    pub fn manifest_url(&self, name: &str) -> Result<Url, PkgError> {
        let encoded = name.replace('/', "%2F");
        self.registry_for(name)
            .join(&encoded)
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn get_manifest(&self, name: &str) -> Result<PackageManifest, PkgError> {
        let url = self.manifest_url(name)?;
        let mut request = self
            .http
            .get(url.as_str())
            .header("accept", "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8");
        if let Some(token) = self.npmrc.token_for(self.registry_for(name)) {
            request = request.bearer_auth(token);
        }

        debug!(name, url = %url, "fetching manifest");
        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }
        if !response.status().is_success() {
            return Err(PkgError::registry(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let mut manifest: PackageManifest = response.json().await?;
        if manifest.name.is_empty() {
            manifest.name = name.to_string();
        }
        Ok(manifest)
    }
}
