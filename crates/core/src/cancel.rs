//! Cooperative cancellation for long reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag checked between I/O batches.
///
/// Cloning shares the flag; cancelling any clone cancels all of them. Long
/// operations poll `is_cancelled` at their next suspension point (e.g. between
/// read slices) and abort with a `Cancelled` error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
