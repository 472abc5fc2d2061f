//! Halcyon kernel entry
//!
//! Boot order matters: console and logging first, then the heap, then the
//! machine structure (which seeds physical memory), then handles and the
//! kernel address space, and finally core bringup.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern crate alloc;
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod entry {
    use core::panic::PanicInfo;

    use bootloader_api::{
        config::Mapping, entry_point, BootInfo as LoaderInfo, BootloaderConfig,
    };
    use halcyon_kernel::{
        arch, boot, cpu, handle, klog, machine,
        mm::{PhysicalAddress, SpaceFlags, VirtualAddress, PAGE_SIZE},
        serial_println,
    };

    /// 1 MiB boot heap carved from the first usable region
    const BOOT_HEAP_SIZE: usize = 0x10_0000;

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_entry, config = &BOOTLOADER_CONFIG);

    fn kernel_entry(loader: &'static mut LoaderInfo) -> ! {
        serial_println!("halcyon {}", env!("CARGO_PKG_VERSION"));
        klog::init(log::LevelFilter::Info);
        arch::early_init();

        let physical_offset = loader
            .physical_memory_offset
            .into_option()
            .expect("loader maps all physical memory");
        arch::set_physical_memory_offset(physical_offset as usize);

        // Feed the boot heap from the largest usable region so the machine
        // structure and page tables have somewhere to live.
        let heap_region = loader
            .memory_regions
            .iter()
            .filter(|region| {
                region.kind == bootloader_api::info::MemoryRegionKind::Usable
                    && (region.end - region.start) as usize >= BOOT_HEAP_SIZE
            })
            .max_by_key(|region| region.end - region.start)
            .expect("no usable memory region for the boot heap");
        let heap_start = physical_offset as usize + heap_region.start as usize;
        halcyon_kernel::init_heap(heap_start, BOOT_HEAP_SIZE);

        // Copy the loader's story into kernel-owned storage; the heap window
        // is carved out so it is never handed to the frame pool.
        let memory_map = loader
            .memory_regions
            .iter()
            .map(|region| boot::MemoryDescriptor {
                base: PhysicalAddress::new(region.start as usize),
                length: (region.end - region.start) as usize,
                kind: match region.kind {
                    bootloader_api::info::MemoryRegionKind::Usable
                        if region.start == heap_region.start =>
                    {
                        boot::MemoryKind::Reserved
                    }
                    bootloader_api::info::MemoryRegionKind::Usable => boot::MemoryKind::Available,
                    _ => boot::MemoryKind::Reserved,
                },
            })
            .collect();
        let ramdisk = loader.ramdisk_addr.into_option().map(|addr| boot::Ramdisk {
            base: PhysicalAddress::new(addr as usize),
            size: loader.ramdisk_len as usize,
        });
        let info = boot::BootInfo::from_parts(
            alloc::string::String::from("rust-bootloader"),
            ramdisk,
            memory_map,
        );

        let machine = machine::initialize(info, cpu::Processor::new(arch::core_id(), 1));

        // Identity-map the kernel's low window into the fresh directory,
        // then take over translation from the loader.
        let kernel = machine.spaces().kernel_space().clone();
        let mut base = PhysicalAddress::new(PAGE_SIZE);
        let mut window = VirtualAddress::new(PAGE_SIZE);
        machine
            .spaces()
            .map(
                &kernel,
                Some(&mut base),
                Some(&mut window),
                halcyon_kernel::mm::KERNEL_END - PAGE_SIZE,
                SpaceFlags::VIRTUAL | SpaceFlags::SUPPLIED_VIRTUAL,
                !0,
            )
            .expect("kernel identity window");
        machine.spaces().switch(&kernel);

        handle::initialize_janitor();

        log::info!("boot core {} online", arch::core_id());
        loop {
            cpu::ipi_interrupt_handler();
            arch::idle();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("[KERNEL PANIC] {}", info);
        loop {
            halcyon_kernel::arch::idle();
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    // The kernel only boots on bare metal; host builds exist for the test
    // suite in the library crate.
    std::eprintln!("halcyon-kernel is a bare-metal image; run the library tests instead");
}
