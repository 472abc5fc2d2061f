//! The machine singleton
//!
//! One structure describes the running machine: the boot information, the
//! physical frame pool, the processor topology, and the address-space
//! manager. It is assembled at a single point during boot and read-only
//! (structurally) afterwards; every component hanging off it is also
//! instantiable standalone, which is what the unit tests do.

use core::sync::atomic::AtomicI32;

use crate::{
    boot::{self, BootInfo},
    cpu::{self, Processor},
    mm::{paging::PageDirectory, PhysicalMemory, SpaceManager, PAGE_SIZE},
    sync::OnceLock,
};

pub struct Machine {
    boot_info: BootInfo,
    pub physical_memory: PhysicalMemory,
    pub memory_granularity: usize,
    pub processor: Processor,
    pub active_cores: AtomicI32,
    spaces: OnceLock<SpaceManager>,
}

static MACHINE: OnceLock<Machine> = OnceLock::new();

impl Machine {
    pub fn boot_info(&self) -> &BootInfo {
        &self.boot_info
    }

    pub fn spaces(&self) -> &SpaceManager {
        self.spaces
            .get()
            .expect("address spaces initialized at boot")
    }
}

/// Bring the machine structure up. Called once from kernel entry, after the
/// heap works and before any other subsystem starts.
pub fn initialize(boot_info: BootInfo, processor: Processor) -> &'static Machine {
    let frame_capacity = boot_info.available_bytes() / PAGE_SIZE;
    let physical_memory = PhysicalMemory::with_capacity(frame_capacity);
    let seeded = boot::seed_physical_memory(&boot_info, &physical_memory);
    log::info!(
        "{} frames of usable memory, loader '{}'",
        seeded,
        boot_info.bootloader()
    );

    if MACHINE
        .set(Machine {
            boot_info,
            physical_memory,
            memory_granularity: PAGE_SIZE,
            processor,
            active_cores: AtomicI32::new(1),
            spaces: OnceLock::new(),
        })
        .is_err()
    {
        crate::fatal!("machine initialized twice");
    }
    let machine = MACHINE.get().expect("machine just initialized");

    cpu::initialize_processor(&machine.processor);

    let (kernel_directory, kernel_directory_physical) =
        PageDirectory::allocate().expect("boot-time directory allocation cannot fail");
    let spaces = SpaceManager::new(
        kernel_directory,
        kernel_directory_physical,
        &machine.physical_memory,
    );
    machine
        .spaces
        .set(spaces)
        .unwrap_or_else(|_| crate::fatal!("address spaces initialized twice"));

    machine
}

/// The machine. Panics before [`initialize`].
pub fn machine() -> &'static Machine {
    MACHINE.get().expect("machine initialized at boot")
}

pub fn try_machine() -> Option<&'static Machine> {
    MACHINE.get()
}

/// Shorthand for the address-space manager.
pub fn spaces() -> &'static SpaceManager {
    machine().spaces()
}
