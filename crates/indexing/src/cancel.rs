//! Cancellation tokens for scanning and indexing tasks.
//!
//! Cancellation is cooperative: long-running loops call [`CancellationToken::check`]
//! between files and between providers, and the `?` operator carries
//! [`IndexingError::Cancelled`] back to the task boundary. There is no
//! time-based cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{IndexingError, Result};

/// A shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is never cancelled by anyone else.
    ///
    /// Useful for tests or operations that should not be interruptible.
    #[inline]
    pub fn noop() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IndexingError::Cancelled)
        } else {
            Ok(())
        }
    }
}
