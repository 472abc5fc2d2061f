//! Resurrect-proof reference counter
//!
//! The handle registry must never hand out a resource whose destructor has
//! been queued. A plain `fetch_add` cannot guarantee that: a thread racing
//! with the final release could bump 0 back to 1 after the record was put on
//! the clean queue. `RefCount` therefore wraps the increment in a
//! compare-exchange that only succeeds while the count is still positive.

use core::sync::atomic::{AtomicI32, Ordering};

pub struct RefCount {
    count: AtomicI32,
}

impl RefCount {
    pub const fn new(initial: i32) -> Self {
        Self {
            count: AtomicI32::new(initial),
        }
    }

    pub fn get(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the object is still reachable (count > 0).
    pub fn live(&self) -> bool {
        self.get() > 0
    }

    /// Increment, but only if the count was positive before the add.
    ///
    /// Returns `false` when the object is already on its way to destruction;
    /// the caller must treat it as not found.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement. Returns `true` exactly once: on the 1 -> 0 transition.
    pub fn release(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
