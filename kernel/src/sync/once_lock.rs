//! Write-once cell for boot-time singletons
//!
//! The machine structure and the kernel address space are initialized at one
//! well-defined point during boot and read-only afterwards. `OnceLock`
//! captures that: `set` succeeds exactly once, `get` hands out `'static`
//! references after the release store has published the value.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was produced by `set` from
            // `Box::into_raw`, so it refers to a live heap allocation that is
            // never freed (the cell leaks its value by design). The Acquire
            // load pairs with the Release compare-exchange in `set`, making
            // the pointee fully visible.
            Some(unsafe { &*ptr })
        }
    }

    /// Install the value. Fails with the rejected value if already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: the exchange failed, so nobody else saw `ptr`; it
                // still uniquely owns the allocation made above.
                let rejected = unsafe { Box::from_raw(ptr) };
                Err(*rejected)
            }
        }
    }

    pub fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &'static T {
        if let Some(value) = self.get() {
            return value;
        }
        let _ = self.set(init());
        self.get().expect("OnceLock empty after set")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the cell only publishes &T after a release/acquire handoff and the
// value is never mutated once published.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn second_set_is_rejected() {
        let cell = OnceLock::new();
        assert!(cell.set(1).is_ok());
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = OnceLock::new();
        assert_eq!(*cell.get_or_init(|| 41), 41);
        assert_eq!(*cell.get_or_init(|| 99), 41);
    }
}
