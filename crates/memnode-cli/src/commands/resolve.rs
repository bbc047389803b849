//! `memnode resolve` command implementation.
//!
//! Prints the flat tree the installer would place, without fetching any
//! archives.

use super::{exit_with_error, runtime};
use crate::mount::Mount;
use memnode_core::pkg::{
    pkg_codes, resolve_dependencies, DepMap, Npmrc, PackageJson, PackageSpec, PkgError,
    RegistryClient, ResolveOptions, ResolvedPackage,
};
use memnode_core::Config;
use miette::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

fn fs_error(report: miette::Report) -> PkgError {
    PkgError::new(pkg_codes::PKG_FS_ERROR, report.to_string())
}

/// Root requests from the command line (`name[@range]`), or from the
/// project's `package.json` when none are given.
fn requests(
    config: &Config,
    packages: &[String],
    options: &ResolveOptions,
) -> Result<(DepMap, Npmrc), PkgError> {
    if packages.is_empty() {
        let mount = Mount::open(&config.cwd).map_err(fs_error)?;
        let manifest = PackageJson::read(&mount.vfs, &mount.project_dir)?;
        let mut deps = DepMap::new();
        if options.include_dev {
            deps.extend(manifest.dev_dependencies.clone());
        }
        if options.include_optional {
            deps.extend(manifest.optional_dependencies.clone());
        }
        deps.extend(manifest.dependencies);
        return Ok((deps, Npmrc::load(&mount.vfs, &mount.project_dir)));
    }

    let mut deps = DepMap::new();
    for raw in packages {
        let spec = PackageSpec::parse(raw)?;
        deps.insert(spec.name, spec.range.unwrap_or_else(|| "latest".to_string()));
    }
    let npmrc = std::fs::read_to_string(config.cwd.join(".npmrc"))
        .map(|text| Npmrc::parse(&text))
        .unwrap_or_default();
    Ok((deps, npmrc))
}

fn resolve(
    config: &Config,
    packages: &[String],
    options: ResolveOptions,
) -> Result<BTreeMap<String, ResolvedPackage>, PkgError> {
    let (deps, npmrc) = requests(config, packages, &options)?;
    let registry = RegistryClient::configured(config.registry_override().as_deref(), npmrc)?;
    let rt = runtime().map_err(fs_error)?;
    rt.block_on(resolve_dependencies(Arc::new(registry), &deps, options))
}

pub fn run(config: &Config, packages: &[String], production: bool, json: bool) -> Result<()> {
    let options = ResolveOptions {
        include_dev: !production,
        include_optional: true,
    };
    let resolved = resolve(config, packages, options).unwrap_or_else(|e| exit_with_error(&e, json));

    if json {
        let packages: Vec<_> = resolved
            .values()
            .map(|pkg| {
                serde_json::json!({
                    "name": pkg.name,
                    "version": pkg.version,
                    "resolved": pkg.tarball_url,
                    "integrity": pkg.integrity,
                    "alias_for": pkg.alias_for,
                    "dependencies": pkg.dependencies,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({ "ok": true, "packages": packages })
        );
    } else {
        for pkg in resolved.values() {
            println!("{}@{}", pkg.name, pkg.version);
        }
        println!("Resolved {} package(s)", resolved.len());
    }
    Ok(())
}
