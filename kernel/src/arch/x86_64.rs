//! x86_64 implementation of the architecture surface

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use x86_64::{
    instructions::{hlt, interrupts, tlb},
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
    PhysAddr,
};

use crate::{cpu::CoreId, mm::PhysicalAddress};

/// Offset of the bootloader's full physical-memory mapping; set once during
/// early boot, before any page structure is allocated.
static PHYSICAL_MEMORY_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// TSC ticks per millisecond, calibrated by the timer collaborator during
/// boot. The pre-calibration default only has to be monotonic.
static TSC_TICKS_PER_MS: AtomicU64 = AtomicU64::new(2_000_000);

const LAPIC_BASE: usize = 0xFEE0_0000;
const LAPIC_ICR_LOW: usize = 0x300;
const LAPIC_ICR_HIGH: usize = 0x310;
const IPI_VECTOR: u32 = 0xF0;

/// Remap and mask the legacy PICs so the IO-APIC/LAPIC owned by the
/// interrupt-controller collaborator has a quiet bus, then leave interrupts
/// off until the first core activates.
pub fn early_init() {
    let mut pics = unsafe { pic8259::ChainedPics::new(0x20, 0x28) };
    unsafe {
        pics.initialize();
        pics.disable();
    }
}

pub fn set_physical_memory_offset(offset: usize) {
    PHYSICAL_MEMORY_OFFSET.store(offset, Ordering::Release);
}

pub fn core_id() -> CoreId {
    // Initial APIC id, CPUID leaf 1, EBX[31:24].
    let cpuid = unsafe { core::arch::x86_64::__cpuid(1) };
    cpuid.ebx >> 24
}

pub fn lock_token() -> usize {
    core_id() as usize
}

pub fn interrupt_enable() {
    interrupts::enable();
}

pub fn interrupt_disable() {
    interrupts::disable();
}

pub fn interrupt_save_disable() -> bool {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    were_enabled
}

pub fn idle() {
    hlt();
}

pub fn relax() {
    core::hint::spin_loop();
}

pub fn monotonic_ms() -> u64 {
    let ticks = unsafe { core::arch::x86_64::_rdtsc() };
    ticks / TSC_TICKS_PER_MS.load(Ordering::Relaxed)
}

pub fn calibrate_tsc(ticks_per_ms: u64) {
    TSC_TICKS_PER_MS.store(ticks_per_ms.max(1), Ordering::Relaxed);
}

/// Translate a kernel-virtual address inside the direct physical mapping.
pub fn virt_to_phys(virt: usize) -> PhysicalAddress {
    PhysicalAddress::new(virt - PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire))
}

pub fn phys_to_virt(phys: PhysicalAddress) -> usize {
    phys.as_usize() + PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire)
}

pub fn update_virtual_addressing(directory_virtual: usize, directory_physical: PhysicalAddress) {
    let _ = directory_virtual;
    let frame = PhysFrame::containing_address(PhysAddr::new(directory_physical.as_usize() as u64));
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

pub fn installed_directory() -> usize {
    let (frame, _) = Cr3::read();
    phys_to_virt(PhysicalAddress::new(frame.start_address().as_u64() as usize))
}

pub fn reload_tlb() {
    tlb::flush_all();
}

pub fn raise_ipi(core: CoreId) {
    let base = phys_to_virt(PhysicalAddress::new(LAPIC_BASE));
    let icr_high = (base + LAPIC_ICR_HIGH) as *mut u32;
    let icr_low = (base + LAPIC_ICR_LOW) as *mut u32;
    // SAFETY: the local APIC registers sit inside the direct physical
    // mapping established at boot; destination field then command word, in
    // that order, per the APIC programming model.
    unsafe {
        core::ptr::write_volatile(icr_high, core << 24);
        core::ptr::write_volatile(icr_low, IPI_VECTOR);
    }
}

/// Kick an application processor out of its wait state. The INIT/SIPI
/// sequence itself is owned by the platform bring-up collaborator; the core
/// only needs the doorbell.
pub fn start_application_core(core: CoreId) {
    raise_ipi(core);
}
