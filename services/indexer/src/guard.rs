//! Per-type cycle exclusion.
//!
//! A polling tick can outlive the tick interval when upstream or storage
//! latency spikes. The guard makes the overlapping tick a no-op instead of
//! letting two cycles read the same cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exclusion flag for one event type's cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a cycle is already in flight.
    pub fn try_acquire(&self) -> Option<CyclePermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CyclePermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one cycle; releases the guard on drop,
/// including early returns and panics.
#[derive(Debug)]
pub struct CyclePermit {
    busy: Arc<AtomicBool>,
}

impl Drop for CyclePermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
