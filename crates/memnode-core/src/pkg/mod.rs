//! Package manager functionality.
//!
//! Provides utilities for:
//! - Parsing package specs and classifying dependency protocols
//! - Fetching package metadata from an npm registry
//! - Resolving version ranges with a built-in semver engine
//! - Downloading, caching and extracting archives into the VFS
//! - Reading npm and bun lockfiles for replay
//! - Workspace support for monorepos
//! - Installing into `node_modules` with bin shims

pub mod bin;
pub mod cache;
pub mod cancel;
pub mod error;
pub mod fetch;
pub mod install;
pub mod integrity;
pub mod lockfile;
pub mod manifest;
pub mod npmrc;
pub mod platform;
pub mod registry;
pub mod resolve;
pub mod spec;
pub mod tarball;
pub mod version;
pub mod workspaces;

pub use bin::{link_bins, missing_artifacts, resolve_module_file};
pub use cache::{ArchiveCache, ArchiveStore, CacheKey, CacheStats, DiskStore, NamespaceLocks};
pub use cancel::CancellationToken;
pub use error::{codes as pkg_codes, PkgError};
pub use fetch::{HttpFetcher, TarballFetcher, MAX_TARBALL_SIZE};
pub use install::{
    InstallOptions, InstallResult, InstallSource, InstalledPackage, PackageManager,
    SourceTransformer, INSTALL_CONCURRENCY,
};
pub use integrity::{compute_integrity, verify_integrity};
pub use lockfile::{LockInstallEntry, LockfileError, LockfileKind, ParsedLockfile};
pub use manifest::{DepMap, PackageJson};
pub use npmrc::Npmrc;
pub use registry::{PackageManifest, Registry, RegistryClient, VersionManifest, DEFAULT_REGISTRY};
pub use resolve::{resolve_dependencies, ResolveOptions, ResolvedPackage, Resolver};
pub use spec::{parse_dependency_spec, DepProtocol, PackageSpec, ParsedDependencySpec};
pub use tarball::{extract_subdir_to_vfs, extract_to_vfs, ArchiveError, ExtractSummary};
pub use version::{compare_versions, find_best_version, satisfies, Version};
pub use workspaces::{discover as discover_workspaces, find_workspace_root, WorkspacePackage, Workspaces};
