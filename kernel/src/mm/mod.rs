//! Memory management
//!
//! Three layers, strictly stacked: the physical frame pool ([`phys`]), the
//! page-table engine ([`paging`]), and the per-process address-space facade
//! ([`space`]) with its kernel virtual-region allocator ([`region`]).

pub mod paging;
pub mod phys;
pub mod region;
pub mod space;

pub use paging::{EntryFlags, PageDirectory, PageTable, ENTRY_COUNT};
pub use phys::PhysicalMemory;
pub use space::{AddressSpace, SpaceFlags, SpaceManager};

/// Size of a physical frame and of one page mapping (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Low bits of an address: the offset within its page
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// High bits of an address: the page base
pub const PAGE_MASK: usize = !PAGE_OFFSET_MASK;

// ---------------------------------------------------------------------------
// Virtual layout
//
// [0, KERNEL_END)                  kernel image, heap, global-access window
// [KERNEL_END, THREAD_REGION_START) shared user region, synchronized with
//                                   the process parent directory
// [THREAD_REGION_START, ...)        per-thread region, private to each space
// ---------------------------------------------------------------------------

/// Last address of the kernel's own mappings
pub const KERNEL_END: usize = 0x2000_0000;

/// Start of the kernel virtual window handed out by the region allocator
pub const GLOBAL_ACCESS_START: usize = 0x0D00_0000;

/// End (exclusive) of the kernel region-allocator window
pub const GLOBAL_ACCESS_END: usize = 0x2000_0000;

/// First address of the per-thread region
pub const THREAD_REGION_START: usize = 0xF800_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl core::fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl core::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Pages needed to cover `bytes`
pub const fn page_count(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
