//! `memnode add` command implementation.

use super::install::{report, InstallFlags};
use super::{exit_with_error, runtime};
use crate::mount::Mount;
use memnode_core::pkg::PackageManager;
use memnode_core::Config;
use miette::{IntoDiagnostic, Result};

pub fn run(config: &Config, request: &str, dev: bool, flags: &InstallFlags, json: bool) -> Result<()> {
    let mount = Mount::open(&config.cwd)?;
    let config = config
        .clone()
        .merge_project_file(&mount.project_host)
        .into_diagnostic()?;
    let pm = PackageManager::from_config(mount.vfs.clone(), &mount.project_dir, &config)
        .unwrap_or_else(|e| exit_with_error(&e, json));

    let rt = runtime()?;
    let result = rt
        .block_on(pm.add(&mount.project_dir, request, dev, &flags.options()))
        .unwrap_or_else(|e| exit_with_error(&e, json));

    mount.write_manifest()?;
    mount.write_node_modules()?;
    report(&result, json);
    Ok(())
}
