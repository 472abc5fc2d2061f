//! Counting semaphore
//!
//! Built on the futex word; used by the handle janitor to sleep between
//! bursts of deferred destruction work.

use core::sync::atomic::{AtomicI32, Ordering};

use super::futex;
use crate::error::KernelResult;

pub struct Semaphore {
    count: AtomicI32,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Self {
            count: AtomicI32::new(initial),
        }
    }

    /// Decrement the semaphore, waiting for it to become positive first.
    ///
    /// `timeout_ms` of `None` waits forever.
    pub fn wait(&self, timeout_ms: Option<u64>) -> KernelResult<()> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .count
                    .compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            futex::futex_wait(&self.count, current, timeout_ms)?;
        }
    }

    /// Decrement without waiting. Returns whether a unit was taken.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Add `units` and wake a waiter.
    pub fn signal(&self, units: i32) {
        self.count.fetch_add(units, Ordering::AcqRel);
        futex::futex_wake(&self.count, 1);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::error::KernelError;

    #[test]
    fn signal_then_wait() {
        let semaphore = Semaphore::new(0);
        semaphore.signal(2);
        semaphore.wait(None).expect("first unit available");
        semaphore.wait(None).expect("second unit available");
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn wait_times_out_when_empty() {
        let semaphore = Semaphore::new(0);
        assert_eq!(semaphore.wait(Some(10)), Err(KernelError::Timeout));
    }
}
