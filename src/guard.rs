use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Single-flight flag for aggregation passes. A second caller is turned
/// away rather than queued.
#[derive(Debug, Clone, Default)]
pub struct LoadGuard {
    running: Arc<AtomicBool>,
}

impl LoadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard. `None` when a pass is already running.
    pub fn try_enter(&self) -> Option<LoadPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadPermit {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of one pass; dropping it clears the guard on
/// every exit path.
#[derive(Debug)]
pub struct LoadPermit {
    running: Arc<AtomicBool>,
}

impl LoadPermit {
    pub fn leave(self) {}
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        debug!("EPG load guard released");
    }
}
