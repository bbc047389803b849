use super::error::PkgError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared by a resolve/install run.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(PKG_CANCELLED)` once cancelled.
    pub fn check(&self) -> Result<(), PkgError> {
        if self.is_cancelled() {
            Err(PkgError::cancelled())
        } else {
            Ok(())
        }
    }
}
