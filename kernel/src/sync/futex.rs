//! Futex-style waiting on an atomic word
//!
//! `futex_wait` parks the caller until the word no longer holds the expected
//! value or the timeout elapses; `futex_wake` publishes that the word has
//! changed. In this core the wait is a bounded poll (the scheduler, which
//! lives above this crate, supplies real blocking by swapping `relax` for a
//! block-on-word queue); the memory-ordering contract is the same either
//! way: a writer that transitions the word and then wakes happens-before
//! the waiter's observation of the new value.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::{
    arch,
    error::{KernelError, KernelResult},
};

/// Wait until `word` no longer contains `expected`.
///
/// `timeout_ms` of `None` waits forever. Returns `Err(Timeout)` when the
/// deadline passes with the word still unchanged.
pub fn futex_wait(
    word: &AtomicI32,
    expected: i32,
    timeout_ms: Option<u64>,
) -> KernelResult<()> {
    let deadline = timeout_ms.map(|ms| arch::monotonic_ms().saturating_add(ms));

    while word.load(Ordering::Acquire) == expected {
        if let Some(deadline) = deadline {
            if arch::monotonic_ms() >= deadline {
                return Err(KernelError::Timeout);
            }
        }
        arch::relax();
    }
    Ok(())
}

/// Wake up to `count` waiters parked on `word`.
///
/// With the polling waiter this is a memory-fence-only operation; the
/// argument is kept so callers express the one-wake contract and the
/// scheduler-backed implementation can honor it.
pub fn futex_wake(word: &AtomicI32, count: usize) {
    let _ = (word, count);
    core::sync::atomic::fence(Ordering::Release);
}
