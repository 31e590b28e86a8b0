//! Cooperative cancellation shared between a caller and background work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ForkpointError, Result};

/// Cloneable cancellation flag.
///
/// Work checks the flag at well-defined points (before blocking on I/O,
/// before starting a worker, before a new search round) and unwinds with
/// [`ForkpointError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail with `Cancelled` once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `ForkpointError::Cancelled` if the token is cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ForkpointError::Cancelled)
        } else {
            Ok(())
        }
    }
}
