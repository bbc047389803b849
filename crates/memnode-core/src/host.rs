//! Bridge between the host disk and a [`Vfs`].
//!
//! Only the CLI touches the real filesystem; everything else in the crate
//! works against the in-memory tree.

use crate::error::Error;
use crate::vfs::{path as vpath, FileKind, Vfs};
use memnode_util::fs::atomic_write;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Directory names never loaded from the host.
const SKIP_DIRS: &[&str] = &[".git", "node_modules"];

/// Counts reported by a host transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
}

/// Copy a host directory into the VFS at `vfs_root`.
///
/// `.git` and `node_modules` are skipped; installs recreate the latter.
pub fn load_directory(vfs: &Vfs, host_root: &Path, vfs_root: &str) -> Result<TransferStats, Error> {
    let mut stats = TransferStats::default();
    vfs.create_dir_all(vfs_root)?;

    let walker = WalkDir::new(host_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIP_DIRS.iter().any(|s| e.file_name() == *s))
        });

    for entry in walker {
        let entry = entry.map_err(|source| Error::Walk {
            path: host_root.to_path_buf(),
            source,
        })?;
        let Ok(rel) = entry.path().strip_prefix(host_root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel.to_string_lossy().replace('\\', "/");
        let target = vpath::join(vfs_root, &rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            vfs.create_dir_all(&target)?;
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            vfs.symlink(&link.to_string_lossy().replace('\\', "/"), &target)?;
            stats.symlinks += 1;
        } else {
            let bytes = std::fs::read(entry.path())?;
            vfs.write_file(&target, bytes)?;
            stats.files += 1;
        }
    }

    debug!(
        host = %host_root.display(),
        vfs_root,
        files = stats.files,
        dirs = stats.dirs,
        "loaded host directory"
    );
    Ok(stats)
}

/// Write a VFS subtree to the host at `host_root`.
///
/// Files are written atomically; symlinks are recreated on Unix and skipped
/// elsewhere.
pub fn write_directory(vfs: &Vfs, vfs_root: &str, host_root: &Path) -> Result<TransferStats, Error> {
    let mut stats = TransferStats::default();
    std::fs::create_dir_all(host_root)?;
    write_dir_inner(vfs, vfs_root, host_root, &mut stats)?;
    debug!(
        vfs_root,
        host = %host_root.display(),
        files = stats.files,
        symlinks = stats.symlinks,
        "wrote directory to host"
    );
    Ok(stats)
}

fn write_dir_inner(
    vfs: &Vfs,
    dir: &str,
    host_dir: &Path,
    stats: &mut TransferStats,
) -> Result<(), Error> {
    for entry in vfs.read_dir_entries(dir)? {
        let src = vpath::join(dir, &entry.name);
        let dst = host_dir.join(&entry.name);
        match entry.kind {
            FileKind::Directory => {
                std::fs::create_dir_all(&dst)?;
                stats.dirs += 1;
                write_dir_inner(vfs, &src, &dst, stats)?;
            }
            FileKind::File => {
                atomic_write(&dst, &vfs.read_file(&src)?)?;
                set_host_mode(&dst, vfs.stat(&src)?.mode)?;
                stats.files += 1;
            }
            FileKind::Symlink => {
                let target = host_link_target(&src, &vfs.readlink(&src)?);
                if write_host_symlink(&target, &dst)? {
                    stats.symlinks += 1;
                }
            }
        }
    }
    Ok(())
}

/// Absolute VFS targets only mean something inside the VFS; on the host
/// they become relative to the link's directory.
fn host_link_target(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        vpath::relative(&vpath::dirname(link), target)
    } else {
        target.to_string()
    }
}

#[cfg(unix)]
fn set_host_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode & 0o111 != 0 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_host_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_host_symlink(target: &str, dst: &Path) -> std::io::Result<bool> {
    if dst.symlink_metadata().is_ok() {
        std::fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(target, dst)?;
    Ok(true)
}

#[cfg(not(unix))]
fn write_host_symlink(_target: &str, _dst: &Path) -> std::io::Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_skips_node_modules_and_git() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("src/index.js"), "1").unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "2").unwrap();

        let vfs = Vfs::new();
        let stats = load_directory(&vfs, dir.path(), "/project").unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(vfs.read_to_string("/project/src/index.js").unwrap(), "1");
        assert!(!vfs.exists("/project/node_modules"));
        assert!(!vfs.exists("/project/.git"));
    }

    #[test]
    fn test_write_directory_round_trip() {
        let vfs = Vfs::new();
        vfs.create_dir_all("/out/node_modules/.bin").unwrap();
        vfs.write_file("/out/node_modules/pkg.js", b"module.exports = 1").unwrap();
        vfs.write_file("/out/node_modules/.bin/tool", b"#!/usr/bin/env node\n").unwrap();
        vfs.set_mode("/out/node_modules/.bin/tool", 0o755).unwrap();

        let dir = tempdir().unwrap();
        let stats = write_directory(&vfs, "/out", dir.path()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("node_modules/pkg.js")).unwrap(),
            "module.exports = 1"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("node_modules/.bin/tool"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_absolute_links_become_relative() {
        assert_eq!(
            host_link_target("/p/node_modules/lib", "/p/packages/lib"),
            "../packages/lib"
        );
        assert_eq!(host_link_target("/p/node_modules/x", "../y"), "../y");
    }
}
