// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Single-flight guard rejecting a second concurrent call instead of queueing it.
#[derive(Clone, Debug, Default)]
pub struct Latch {
    busy: Arc<AtomicBool>,
}

impl Latch {
    /// Returns a guard if no other call holds the latch, the latch is released when the guard is
    /// dropped.
    pub fn try_acquire(&self) -> Option<LatchGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct LatchGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
