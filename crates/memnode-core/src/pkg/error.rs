//! Package manager error types.

use crate::vfs::VfsError;
use std::fmt;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_DOWNLOAD_FAILED: &str = "PKG_DOWNLOAD_FAILED";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const PKG_ARCHIVE_INVALID: &str = "PKG_ARCHIVE_INVALID";
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_UNSUPPORTED_PROTOCOL: &str = "PKG_UNSUPPORTED_PROTOCOL";
    pub const PKG_LOCAL_NOT_FOUND: &str = "PKG_LOCAL_NOT_FOUND";
    pub const PKG_WORKSPACE_NOT_FOUND: &str = "PKG_WORKSPACE_NOT_FOUND";
    pub const PKG_ALIAS_INVALID: &str = "PKG_ALIAS_INVALID";
    pub const PKG_CANCELLED: &str = "PKG_CANCELLED";
    pub const PKG_FS_ERROR: &str = "PKG_FS_ERROR";
    pub const PKG_PACKAGE_JSON_NOT_FOUND: &str = "PKG_PACKAGE_JSON_NOT_FOUND";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";
    pub const PKG_CACHE_ERROR: &str = "PKG_CACHE_ERROR";
}

/// Package manager error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::new(
            codes::PKG_VERSION_NOT_FOUND,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_DOWNLOAD_FAILED, msg)
    }

    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_EXTRACT_FAILED, msg)
    }

    pub fn archive_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_ARCHIVE_INVALID, msg)
    }

    #[must_use]
    pub fn integrity_mismatch(name: &str, expected: &str) -> Self {
        Self::new(
            codes::PKG_INTEGRITY_MISMATCH,
            format!("Integrity check failed for {name}: expected {expected}"),
        )
    }

    /// A git dependency; lists the protocols that are accepted instead.
    #[must_use]
    pub fn unsupported_protocol(name: &str, spec: &str) -> Self {
        Self::new(
            codes::PKG_UNSUPPORTED_PROTOCOL,
            format!(
                "Unsupported dependency protocol for {name}: {spec}. \
                 Use a registry range, npm:, workspace:, file:, link:, \
                 github:owner/repo, or a direct .tgz URL instead"
            ),
        )
    }

    #[must_use]
    pub fn local_not_found(name: &str, path: &str) -> Self {
        Self::new(
            codes::PKG_LOCAL_NOT_FOUND,
            format!("Local dependency {name} not found at {path}"),
        )
    }

    #[must_use]
    pub fn workspace_not_found(name: &str) -> Self {
        Self::new(
            codes::PKG_WORKSPACE_NOT_FOUND,
            format!("Workspace package not found: {name}"),
        )
    }

    pub fn alias_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_ALIAS_INVALID, msg)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(codes::PKG_CANCELLED, "Operation cancelled")
    }

    #[must_use]
    pub fn package_json_not_found(path: &str) -> Self {
        Self::new(
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            format!("package.json not found: {path}"),
        )
    }

    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    pub fn cache_error(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_CACHE_ERROR, msg)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == codes::PKG_CANCELLED
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<VfsError> for PkgError {
    fn from(e: VfsError) -> Self {
        Self::new(codes::PKG_FS_ERROR, e.to_string())
    }
}

impl From<std::io::Error> for PkgError {
    fn from(e: std::io::Error) -> Self {
        Self::new(codes::PKG_CACHE_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::PKG_REGISTRY_ERROR, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::PKG_REGISTRY_ERROR, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, format!("Invalid JSON: {e}"))
    }
}
