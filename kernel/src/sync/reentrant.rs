//! Reentrant spinlock
//!
//! Address-space mutation takes this lock, and mapping paths can re-enter
//! it (a map that faults in a table calls back into the same space). The
//! owner is identified by an architecture-supplied token (core id on bare
//! metal), so the same context can lock repeatedly while others spin.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch;

pub struct ReentrantLock {
    /// Owner token + 1; 0 means unowned.
    owner: AtomicUsize,
    depth: AtomicU32,
}

pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            depth: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        let token = arch::lock_token() + 1;
        if self.owner.load(Ordering::Relaxed) == token {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return ReentrantGuard { lock: self };
        }
        loop {
            match self
                .owner
                .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(_) => core::hint::spin_loop(),
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        ReentrantGuard { lock: self }
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(0, Ordering::Release);
        }
    }
}
