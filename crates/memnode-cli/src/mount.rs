//! A host project loaded into a fresh VFS.
//!
//! The tree is mounted at its own host path, so absolute paths written
//! by the installer (bin shims, links) stay meaningful once written back.

use memnode_core::host::{self, TransferStats};
use memnode_core::paths::project_root;
use memnode_core::vfs::path as vpath;
use memnode_core::Vfs;
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct Mount {
    pub vfs: Vfs,
    /// Host directory of the project being installed.
    pub project_host: PathBuf,
    /// Same directory inside the VFS.
    pub project_dir: String,
}

/// VFS path for a host path.
pub fn vfs_path(host: &Path) -> String {
    vpath::normalize(&host.to_string_lossy().replace('\\', "/"))
}

/// Whether `dir` declares workspace patterns.
fn declares_workspaces(dir: &Path) -> bool {
    if dir.join("pnpm-workspace.yaml").is_file() {
        return true;
    }
    std::fs::read(dir.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_slice::<serde_json::Value>(&raw).ok())
        .is_some_and(|manifest| manifest.get("workspaces").is_some())
}

impl Mount {
    /// Load the project containing `cwd`. When an ancestor declares
    /// workspaces the whole monorepo is loaded so members can be copied.
    pub fn open(cwd: &Path) -> Result<Self> {
        let project_host = project_root(cwd)
            .filter(|dir| dir.join("package.json").is_file())
            .unwrap_or_else(|| cwd.to_path_buf());
        let host_root = project_host
            .ancestors()
            .find(|dir| declares_workspaces(dir))
            .unwrap_or(project_host.as_path())
            .to_path_buf();

        let vfs = Vfs::new();
        let stats = host::load_directory(&vfs, &host_root, &vfs_path(&host_root)).into_diagnostic()?;
        debug!(
            root = %host_root.display(),
            project = %project_host.display(),
            files = stats.files,
            "mounted host project"
        );

        Ok(Self {
            vfs,
            project_dir: vfs_path(&project_host),
            project_host,
        })
    }

    /// Replace the host `node_modules` with the one built in the VFS.
    pub fn write_node_modules(&self) -> Result<TransferStats> {
        let vfs_dir = vpath::join(&self.project_dir, "node_modules");
        let host_dir = self.project_host.join("node_modules");
        if host_dir.symlink_metadata().is_ok() {
            std::fs::remove_dir_all(&host_dir).into_diagnostic()?;
        }
        if !self.vfs.is_dir(&vfs_dir) {
            return Ok(TransferStats::default());
        }
        host::write_directory(&self.vfs, &vfs_dir, &host_dir).into_diagnostic()
    }

    /// Write the project's `package.json` back to the host.
    pub fn write_manifest(&self) -> Result<()> {
        let bytes = self
            .vfs
            .read_file(&vpath::join(&self.project_dir, "package.json"))
            .into_diagnostic()?;
        memnode_util::fs::atomic_write(&self.project_host.join("package.json"), &bytes)
            .into_diagnostic()
    }
}
