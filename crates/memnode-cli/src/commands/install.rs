//! `memnode install` command implementation.

use super::{exit_with_error, runtime};
use crate::mount::Mount;
use memnode_core::pkg::{InstallOptions, InstallResult, PackageManager};
use memnode_core::Config;
use miette::{IntoDiagnostic, Result};
use tracing::info;

/// Flags shared by `install` and `add`.
#[derive(Debug, Clone, Default)]
pub struct InstallFlags {
    pub production: bool,
    pub no_optional: bool,
    pub no_lockfile: bool,
    pub prefer_published: bool,
}

impl InstallFlags {
    pub fn options(&self) -> InstallOptions {
        InstallOptions {
            include_dev: !self.production,
            include_optional: !self.no_optional,
            prefer_published: self.prefer_published,
            use_lockfile: !self.no_lockfile,
        }
    }
}

pub fn run(config: &Config, flags: &InstallFlags, json: bool) -> Result<()> {
    let mount = Mount::open(&config.cwd)?;
    let config = config
        .clone()
        .merge_project_file(&mount.project_host)
        .into_diagnostic()?;
    let pm = PackageManager::from_config(mount.vfs.clone(), &mount.project_dir, &config)
        .unwrap_or_else(|e| exit_with_error(&e, json));

    info!(project = %mount.project_host.display(), "installing");
    let rt = runtime()?;
    let result = rt
        .block_on(pm.install(&mount.project_dir, &flags.options()))
        .unwrap_or_else(|e| exit_with_error(&e, json));

    mount.write_node_modules()?;
    report(&result, json);
    Ok(())
}

/// Print an install result.
pub fn report(result: &InstallResult, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "install": result })
        );
        return;
    }

    if let Some(lockfile) = &result.lockfile {
        println!("Replayed {lockfile}");
    }
    for pkg in &result.installed {
        println!("  + {}@{}", pkg.name, pkg.version);
    }
    for bin in &result.bins {
        println!("  bin {bin}");
    }
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    println!("Installed {} package(s)", result.installed.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_to_options() {
        let defaults = InstallFlags::default().options();
        assert_eq!(defaults, InstallOptions::default());

        let flags = InstallFlags {
            production: true,
            no_lockfile: true,
            ..InstallFlags::default()
        };
        let options = flags.options();
        assert!(!options.include_dev);
        assert!(!options.use_lockfile);
        assert!(options.include_optional);
    }
}
