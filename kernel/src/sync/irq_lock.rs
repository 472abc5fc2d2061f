//! Interrupt-safe spinlock
//!
//! A [`spin::Mutex`] that disables local interrupts for the duration of the
//! critical section, so interrupt handlers on the same core can never
//! deadlock against it. The previous interrupt state is restored when the
//! guard drops, which makes nesting safe.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch;

pub struct IrqSpinlock<T> {
    inner: Mutex<T>,
}

pub struct IrqSpinlockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    interrupts_were_enabled: bool,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let interrupts_were_enabled = arch::interrupt_save_disable();
        IrqSpinlockGuard {
            guard: Some(self.inner.lock()),
            interrupts_were_enabled,
        }
    }
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken before drop")
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken before drop")
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // The spinlock must be released before interrupts come back on.
        self.guard.take();
        if self.interrupts_were_enabled {
            arch::interrupt_enable();
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_value() {
        let lock = IrqSpinlock::new(7);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn nesting_restores_state() {
        let a = IrqSpinlock::new(1);
        let b = IrqSpinlock::new(2);
        let outer = a.lock();
        {
            let inner = b.lock();
            assert_eq!(*inner, 2);
        }
        assert_eq!(*outer, 1);
    }
}
