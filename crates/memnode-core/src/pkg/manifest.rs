//! Typed `package.json`.
//!
//! Parsing never fails on a malformed field: anything with an unexpected
//! shape falls back to its default, the same way npm tolerates sloppy
//! manifests. Only a document that is not a JSON object is rejected.

use super::error::PkgError;
use crate::vfs::{path as vpath, Vfs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Dependency name → spec.
pub type DepMap = BTreeMap<String, String>;

/// `peerDependenciesMeta` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerMeta {
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageJson {
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(deserialize_with = "lenient_deps")]
    pub dependencies: DepMap,
    #[serde(deserialize_with = "lenient_deps")]
    pub dev_dependencies: DepMap,
    #[serde(deserialize_with = "lenient_deps")]
    pub optional_dependencies: DepMap,
    #[serde(deserialize_with = "lenient_deps")]
    pub peer_dependencies: DepMap,
    #[serde(deserialize_with = "lenient")]
    pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
    pub workspaces: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub main: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub module: Option<String>,
    pub exports: Option<Value>,
    pub bin: Option<Value>,
    #[serde(deserialize_with = "string_or_list")]
    pub os: Vec<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub cpu: Vec<String>,
}

/// Deserialize `T`, substituting the default on any shape mismatch.
pub(crate) fn lenient<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(d)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Keep only the string-valued entries of an object.
pub(crate) fn lenient_deps<'de, D>(d: D) -> Result<DepMap, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => DepMap::new(),
    })
}

pub(crate) fn string_or_list<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    })
}

/// Normalize a `bin` field into command → relative path.
///
/// A string `bin` is exposed under the package name without its scope.
#[must_use]
pub fn bin_entries(package_name: &str, bin: Option<&Value>) -> BTreeMap<String, String> {
    match bin {
        Some(Value::String(target)) => {
            let command = package_name.rsplit('/').next().unwrap_or(package_name);
            if command.is_empty() {
                BTreeMap::new()
            } else {
                BTreeMap::from([(command.to_string(), target.clone())])
            }
        }
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn collect_export_targets(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with("./") && !s.contains('*') => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_export_targets(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_export_targets(v, out)),
        _ => {}
    }
}

impl PackageJson {
    /// Parse manifest text.
    pub fn parse(text: &str) -> Result<Self, PkgError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, PkgError> {
        if !value.is_object() {
            return Err(PkgError::package_json_invalid(
                "package.json must be a JSON object",
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| PkgError::package_json_invalid(format!("Invalid package.json: {e}")))
    }

    /// Read `<dir>/package.json` from the VFS.
    pub fn read(vfs: &Vfs, dir: &str) -> Result<Self, PkgError> {
        let path = vpath::join(dir, "package.json");
        let text = vfs
            .read_to_string(&path)
            .map_err(|_| PkgError::package_json_not_found(&path))?;
        Self::parse(&text)
    }

    #[must_use]
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    #[must_use]
    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or("0.0.0")
    }

    #[must_use]
    pub fn bin_entries(&self) -> BTreeMap<String, String> {
        bin_entries(self.name_or_default(), self.bin.as_ref())
    }

    /// Glob patterns from `workspaces` (array or `{ packages: [...] }`).
    #[must_use]
    pub fn workspace_patterns(&self) -> Vec<String> {
        let list = match &self.workspaces {
            Some(Value::Array(items)) => Some(items),
            Some(Value::Object(map)) => map.get("packages").and_then(Value::as_array),
            _ => None,
        };
        list.map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Relative files the package declares as entry points: `main`, `module`,
    /// concrete `exports` targets and `bin` scripts.
    #[must_use]
    pub fn declared_entry_points(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.extend(self.main.iter().cloned());
        out.extend(self.module.iter().cloned());
        match &self.exports {
            Some(Value::String(s)) => out.push(s.clone()),
            Some(other) => collect_export_targets(other, &mut out),
            None => {}
        }
        out.extend(self.bin_entries().into_values());
        out.sort();
        out.dedup();
        out
    }
}

/// Add (or replace) a dependency in the `package.json` under `dir`.
///
/// Other fields are preserved as JSON values.
pub fn write_dependency(
    vfs: &Vfs,
    dir: &str,
    name: &str,
    spec: &str,
    section: &str,
) -> Result<(), PkgError> {
    let path = vpath::join(dir, "package.json");
    let text = vfs
        .read_to_string(&path)
        .map_err(|_| PkgError::package_json_not_found(&path))?;
    let mut root: Value = serde_json::from_str(&text)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;
    let obj = root
        .as_object_mut()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let entry = obj
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }
    if let Some(deps) = entry.as_object_mut() {
        deps.insert(name.to_string(), Value::String(spec.to_string()));
    }

    let mut out = serde_json::to_string_pretty(&root)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to serialize: {e}")))?;
    out.push('\n');
    vfs.write_file(&path, out)?;
    Ok(())
}
