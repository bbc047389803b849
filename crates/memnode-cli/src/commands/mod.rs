pub mod add;
pub mod install;
pub mod resolve;
pub mod version;

use memnode_core::pkg::PkgError;
use serde::Serialize;

/// Error object in JSON output.
#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&PkgError> for ErrorInfo {
    fn from(err: &PkgError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message().to_string(),
        }
    }
}

/// Report a package manager failure and exit with status 1.
pub fn exit_with_error(err: &PkgError, json: bool) -> ! {
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": false, "error": ErrorInfo::from(err) })
        );
    } else {
        eprintln!("error: [{}] {}", err.code(), err.message());
    }
    std::process::exit(1);
}

/// Multi-threaded runtime for one command.
pub fn runtime() -> miette::Result<tokio::runtime::Runtime> {
    use miette::IntoDiagnostic;
    tokio::runtime::Runtime::new().into_diagnostic()
}
