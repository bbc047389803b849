//! Filesystem error taxonomy.

use std::fmt;
use thiserror::Error;

/// POSIX errno names surfaced by the virtual filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No such file or directory.
    Enoent,
    /// A path component is not a directory.
    Enotdir,
    /// Operation not permitted on a directory.
    Eisdir,
    /// Entry already exists.
    Eexist,
    /// Directory is not empty.
    Enotempty,
    /// Too many levels of symbolic links.
    Eloop,
    /// Invalid argument.
    Einval,
}

impl ErrorCode {
    /// The errno name, e.g. `ENOENT`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enoent => "ENOENT",
            Self::Enotdir => "ENOTDIR",
            Self::Eisdir => "EISDIR",
            Self::Eexist => "EEXIST",
            Self::Enotempty => "ENOTEMPTY",
            Self::Eloop => "ELOOP",
            Self::Einval => "EINVAL",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Enoent => "no such file or directory",
            Self::Enotdir => "not a directory",
            Self::Eisdir => "illegal operation on a directory",
            Self::Eexist => "file already exists",
            Self::Enotempty => "directory not empty",
            Self::Eloop => "too many symbolic links encountered",
            Self::Einval => "invalid argument",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filesystem error carrying the errno code, syscall name and path.
///
/// Displays the way Node does: `ENOENT: no such file or directory, open '/x'`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {}, {syscall} '{path}'", code.description())]
pub struct VfsError {
    pub code: ErrorCode,
    pub syscall: &'static str,
    pub path: String,
}

impl VfsError {
    #[must_use]
    pub fn new(code: ErrorCode, syscall: &'static str, path: impl Into<String>) -> Self {
        Self {
            code,
            syscall,
            path: path.into(),
        }
    }

    pub(crate) fn enoent(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Enoent, syscall, path)
    }

    pub(crate) fn enotdir(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Enotdir, syscall, path)
    }

    pub(crate) fn eisdir(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Eisdir, syscall, path)
    }

    pub(crate) fn eexist(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Eexist, syscall, path)
    }

    pub(crate) fn enotempty(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Enotempty, syscall, path)
    }

    pub(crate) fn eloop(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Eloop, syscall, path)
    }

    pub(crate) fn einval(syscall: &'static str, path: &str) -> Self {
        Self::new(ErrorCode::Einval, syscall, path)
    }

    /// Whether this error is `ENOENT`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::Enoent
    }
}
