//! Boot parameter block
//!
//! The architecture layer hands kernel entry a raw record assembled by the
//! boot loader. It is consumed exactly once, before any subsystem starts:
//! everything it references is copied into kernel-owned storage so the
//! loader's memory can be reclaimed along with the rest of low memory.

use alloc::{string::String, vec::Vec};

use crate::{
    arch,
    mm::{PhysicalAddress, PhysicalMemory, PAGE_SIZE},
};

/// Raw record at kernel entry, layout shared with the boot loader
#[repr(C)]
pub struct RawBootRecord {
    pub bootloader_name: [u8; 32],
    pub ramdisk_base: u64,
    pub ramdisk_size: u64,
    /// Physical pointer to an array of [`RawMemoryDescriptor`]
    pub memory_map: u64,
    pub memory_map_entries: u32,
    _reserved: u32,
    /// Physical pointer to an opaque architecture blob (ACPI root, etc.)
    pub arch_blob: u64,
    pub arch_blob_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawMemoryDescriptor {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    _reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Defective,
}

impl MemoryKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            5 => Self::Defective,
            _ => Self::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub base: PhysicalAddress,
    pub length: usize,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone, Copy)]
pub struct Ramdisk {
    pub base: PhysicalAddress,
    pub size: usize,
}

/// Kernel-owned copy of everything the boot loader reported
pub struct BootInfo {
    bootloader: String,
    ramdisk: Option<Ramdisk>,
    memory_map: Vec<MemoryDescriptor>,
    arch_blob: Vec<u8>,
}

impl BootInfo {
    /// Copy the raw record out of loader memory.
    ///
    /// # Safety
    ///
    /// `record` and the physical pointers inside it must describe memory
    /// that is mapped and valid for the duration of this call.
    pub unsafe fn consume(record: &RawBootRecord) -> Self {
        let name_length = record
            .bootloader_name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(record.bootloader_name.len());
        let bootloader =
            String::from_utf8_lossy(&record.bootloader_name[..name_length]).into_owned();

        let ramdisk = (record.ramdisk_size != 0).then(|| Ramdisk {
            base: PhysicalAddress::new(record.ramdisk_base as usize),
            size: record.ramdisk_size as usize,
        });

        let mut memory_map = Vec::with_capacity(record.memory_map_entries as usize);
        if record.memory_map != 0 {
            let descriptors = arch::phys_to_virt(PhysicalAddress::new(record.memory_map as usize))
                as *const RawMemoryDescriptor;
            for index in 0..record.memory_map_entries as usize {
                // SAFETY: caller guarantees the descriptor array is mapped
                // and `memory_map_entries` long.
                let raw = unsafe { descriptors.add(index).read_unaligned() };
                memory_map.push(MemoryDescriptor {
                    base: PhysicalAddress::new(raw.base as usize),
                    length: raw.length as usize,
                    kind: MemoryKind::from_raw(raw.kind),
                });
            }
        }

        let mut arch_blob = Vec::new();
        if record.arch_blob != 0 && record.arch_blob_size != 0 {
            let blob = arch::phys_to_virt(PhysicalAddress::new(record.arch_blob as usize))
                as *const u8;
            // SAFETY: caller guarantees the blob is mapped and sized.
            arch_blob
                .extend_from_slice(unsafe {
                    core::slice::from_raw_parts(blob, record.arch_blob_size as usize)
                });
        }

        Self {
            bootloader,
            ramdisk,
            memory_map,
            arch_blob,
        }
    }

    /// Assemble boot information directly, for platforms whose loader hands
    /// us an already-parsed structure.
    pub fn from_parts(
        bootloader: String,
        ramdisk: Option<Ramdisk>,
        memory_map: Vec<MemoryDescriptor>,
    ) -> Self {
        Self {
            bootloader,
            ramdisk,
            memory_map,
            arch_blob: Vec::new(),
        }
    }

    pub fn bootloader(&self) -> &str {
        &self.bootloader
    }

    pub fn ramdisk(&self) -> Option<Ramdisk> {
        self.ramdisk
    }

    pub fn memory_map(&self) -> &[MemoryDescriptor] {
        &self.memory_map
    }

    pub fn arch_blob(&self) -> &[u8] {
        &self.arch_blob
    }

    /// Bytes of usable RAM in the map.
    pub fn available_bytes(&self) -> usize {
        self.memory_map
            .iter()
            .filter(|descriptor| descriptor.kind == MemoryKind::Available)
            .map(|descriptor| descriptor.length)
            .sum()
    }
}

/// Legacy/BIOS low megabyte, never handed to the allocator
const LOW_MEMORY_END: usize = 0x10_0000;

/// Push every usable frame from the memory map into the physical pool.
/// Returns the number of frames seeded.
pub fn seed_physical_memory(info: &BootInfo, pool: &PhysicalMemory) -> usize {
    let mut seeded = 0;
    for descriptor in info.memory_map() {
        if descriptor.kind != MemoryKind::Available {
            continue;
        }
        let first = descriptor.base.as_usize().next_multiple_of(PAGE_SIZE);
        let end = descriptor.base.as_usize() + descriptor.length;
        let mut frame = first.max(LOW_MEMORY_END);
        while frame + PAGE_SIZE <= end {
            pool.free(PhysicalAddress::new(frame));
            frame += PAGE_SIZE;
            seeded += 1;
        }
    }
    seeded
}
