//! Host stand-ins for the architecture surface
//!
//! Active on any build that is not bare-metal x86_64 (in practice: the unit
//! test suite). State that the hardware would own lives in process-wide
//! atomics so tests can steer and observe it.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::{cpu::CoreId, mm::PhysicalAddress};

static CURRENT_CORE: AtomicU32 = AtomicU32::new(0);
static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static INSTALLED_DIRECTORY: AtomicUsize = AtomicUsize::new(0);
static TLB_RELOADS: AtomicU64 = AtomicU64::new(0);
static NEXT_LOCK_TOKEN: AtomicUsize = AtomicUsize::new(0);

pub fn core_id() -> CoreId {
    CURRENT_CORE.load(Ordering::Relaxed)
}

/// Point of control for tests that simulate running on another core.
pub fn set_current_core(id: CoreId) {
    CURRENT_CORE.store(id, Ordering::Relaxed);
}

/// Identity of the executing context for ownership-tracking locks.
/// Per-thread on the host, where many test threads share "core 0".
pub fn lock_token() -> usize {
    std::thread_local! {
        static TOKEN: usize = NEXT_LOCK_TOKEN.fetch_add(1, Ordering::Relaxed) + 1;
    }
    TOKEN.with(|token| *token)
}

pub fn interrupt_enable() {
    INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
}

pub fn interrupt_disable() {
    INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
}

pub fn interrupt_save_disable() -> bool {
    INTERRUPTS_ENABLED.swap(false, Ordering::Relaxed)
}

pub fn idle() {
    std::thread::yield_now();
}

pub fn relax() {
    std::thread::yield_now();
}

pub fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(std::time::Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Host heap addresses double as their own physical addresses.
pub fn virt_to_phys(virt: usize) -> PhysicalAddress {
    PhysicalAddress::new(virt)
}

pub fn phys_to_virt(phys: PhysicalAddress) -> usize {
    phys.as_usize()
}

pub fn update_virtual_addressing(directory_virtual: usize, directory_physical: PhysicalAddress) {
    let _ = directory_physical;
    INSTALLED_DIRECTORY.store(directory_virtual, Ordering::Release);
    reload_tlb();
}

/// The directory most recently handed to `update_virtual_addressing`.
pub fn installed_directory() -> usize {
    INSTALLED_DIRECTORY.load(Ordering::Acquire)
}

pub fn reload_tlb() {
    TLB_RELOADS.fetch_add(1, Ordering::Relaxed);
}

pub fn tlb_reload_count() -> u64 {
    TLB_RELOADS.load(Ordering::Relaxed)
}

pub fn raise_ipi(_core: CoreId) {
    // The queue is inspected directly; there is no doorbell to ring.
}

pub fn start_application_core(core: CoreId) {
    log::trace!("would start application core {}", core);
}
