//! Thread creation hooks
//!
//! Scheduling policy lives outside this core; these hooks are the seam it
//! plugs into. Until the scheduler is up, kernel-thread requests are parked
//! and replayed when it arrives. Host builds run requests on real threads
//! so the janitor and tests behave naturally.

use spin::Mutex;

use alloc::vec::Vec;

/// A kernel-thread body; never returns.
pub type ThreadEntry = fn() -> !;

struct PendingThread {
    name: &'static str,
    entry: ThreadEntry,
}

/// Requests made before the scheduler registered itself.
static PENDING: Mutex<Vec<PendingThread>> = Mutex::new(Vec::new());

/// Per-core threading switch, flipped by core activation.
pub fn enable_local() {
    log::trace!("threading enabled on core {}", crate::arch::core_id());
}

/// Ask for a kernel thread running `entry`.
pub fn spawn_kernel(name: &'static str, entry: ThreadEntry) {
    #[cfg(not(target_os = "none"))]
    {
        let spawned = std::thread::Builder::new()
            .name(std::string::String::from(name))
            .spawn(move || entry());
        if let Err(error) = spawned {
            log::error!("failed to spawn kernel thread {}: {:?}", name, error);
        }
    }

    #[cfg(target_os = "none")]
    {
        // Parked until the scheduler drains the list.
        PENDING.lock().push(PendingThread { name, entry });
        log::trace!("kernel thread {} queued for the scheduler", name);
    }
}

/// Scheduler attach point: take ownership of every parked request.
pub fn take_pending() -> Vec<(&'static str, ThreadEntry)> {
    core::mem::take(&mut *PENDING.lock())
        .into_iter()
        .map(|pending| (pending.name, pending.entry))
        .collect()
}
