//! Page-table engine
//!
//! Two-level translation: a [`PageDirectory`] of 1024 slots, each naming a
//! leaf [`PageTable`] of 1024 page entries. The directory keeps two parallel
//! arrays: the raw entries the MMU walks (physical address plus flag bits)
//! and the kernel-virtual pointers it uses to reach the leaf tables itself.
//!
//! Directory slots are updated lock-free. Sibling address spaces share leaf
//! tables through their parent directory: the parent slot is the consensus
//! point, written with one strong compare-exchange, and the loser of the
//! race frees its freshly allocated table and adopts the winner's. A slot
//! taken over from elsewhere carries the `INHERITED` bit, which records
//! "mapped here, owned elsewhere" and exempts the leaf table from teardown.

use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;

use crate::{
    arch,
    error::{KernelError, KernelResult},
    mm::{PhysicalAddress, PhysicalMemory, VirtualAddress, KERNEL_END, THREAD_REGION_START},
};

/// Entries per directory and per leaf table
pub const ENTRY_COUNT: usize = 1024;

/// Address bits of a raw entry
pub const ADDRESS_MASK: usize = !0xFFF;

bitflags! {
    /// Raw MMU entry bits, plus the software bits the engine relies on
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: usize {
        const PRESENT      = 1 << 0;
        const WRITE        = 1 << 1;
        const USER         = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const NOCACHE      = 1 << 4;
        const ACCESSED     = 1 << 5;
        const DIRTY        = 1 << 6;
        /// Never reclaimed on directory teardown
        const PERSISTENT   = 1 << 9;
        /// Mapped in this directory but owned by another
        const INHERITED    = 1 << 10;
        /// Backing frame was supplied by the caller, not the frame pool
        const RAW_PHYSICAL = 1 << 11;
    }
}

const fn directory_index(address: VirtualAddress) -> usize {
    (address.as_usize() >> 22) & (ENTRY_COUNT - 1)
}

const fn table_index(address: VirtualAddress) -> usize {
    (address.as_usize() >> 12) & (ENTRY_COUNT - 1)
}

/// Leaf translation table: 1024 page entries
#[repr(C, align(4096))]
pub struct PageTable {
    pages: [AtomicUsize; ENTRY_COUNT],
}

/// Top-level translation structure
#[repr(C, align(4096))]
pub struct PageDirectory {
    /// Raw entries walked by the MMU
    entries: [AtomicUsize; ENTRY_COUNT],
    /// Kernel-virtual pointers to the leaf tables, parallel to `entries`
    tables: [AtomicUsize; ENTRY_COUNT],
}

/// Leaf tables alive right now; teardown accounting for tests and stats.
static LIVE_TABLES: AtomicUsize = AtomicUsize::new(0);

pub fn live_table_count() -> usize {
    LIVE_TABLES.load(Ordering::Relaxed)
}

/// Allocate a zeroed, page-aligned structure from the kernel heap and report
/// its physical address.
fn allocate_page_struct<T>() -> KernelResult<(NonNull<T>, PhysicalAddress)> {
    let layout = Layout::new::<T>();
    // SAFETY: `T` is one of the page structures, both non-zero-sized and
    // 4 KiB aligned by their repr.
    let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
    let Some(pointer) = NonNull::new(raw.cast::<T>()) else {
        return Err(KernelError::OutOfMemory);
    };
    Ok((pointer, arch::virt_to_phys(raw as usize)))
}

/// # Safety
///
/// `pointer` must come from [`allocate_page_struct`] with the same `T` and
/// must not be referenced afterwards.
unsafe fn free_page_struct<T>(pointer: NonNull<T>) {
    // SAFETY: same layout as the allocation, per the contract above.
    unsafe { alloc::alloc::dealloc(pointer.as_ptr().cast(), Layout::new::<T>()) };
}

impl PageTable {
    fn allocate() -> KernelResult<(NonNull<PageTable>, PhysicalAddress)> {
        let pair = allocate_page_struct::<PageTable>()?;
        LIVE_TABLES.fetch_add(1, Ordering::Relaxed);
        Ok(pair)
    }

    /// # Safety
    ///
    /// `pointer` must be an unshared table from [`PageTable::allocate`].
    unsafe fn free(pointer: NonNull<PageTable>) {
        LIVE_TABLES.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: forwarded contract.
        unsafe { free_page_struct(pointer) };
    }

    fn entry(&self, address: VirtualAddress) -> &AtomicUsize {
        &self.pages[table_index(address)]
    }
}

impl PageDirectory {
    /// A fresh, empty directory.
    pub fn allocate() -> KernelResult<(&'static PageDirectory, PhysicalAddress)> {
        let (pointer, physical) = allocate_page_struct::<PageDirectory>()?;
        // SAFETY: freshly allocated, zeroed, and leaked; only
        // `destroy_directory` ever reclaims it.
        Ok((unsafe { pointer.as_ref() }, physical))
    }

    fn slot(&self, index: usize) -> usize {
        self.entries[index].load(Ordering::Acquire)
    }

    fn table_pointer(&self, index: usize) -> Option<&PageTable> {
        let raw = self.tables[index].load(Ordering::Acquire);
        // SAFETY: a non-null slot pointer is only ever published alongside a
        // PRESENT entry and stays valid until teardown of the owning
        // directory, which requires exclusive access.
        NonNull::new(raw as *mut PageTable).map(|p| unsafe { &*p.as_ptr() })
    }

    /// Spin until the virtual pointer for `index` is published. The raw
    /// entry is CAS-installed first and the pointer follows with a release
    /// store, so the wait is bounded by one peer's two instructions.
    fn wait_for_table(&self, index: usize) -> &PageTable {
        loop {
            if let Some(table) = self.table_pointer(index) {
                return table;
            }
            core::hint::spin_loop();
        }
    }

    /// Resolve the leaf table covering `address`, synchronizing with
    /// `parent` when the slot is empty here.
    ///
    /// The lazy-share protocol, in order:
    /// 1. our slot is present: use it;
    /// 2. the parent's slot is present (acquire): adopt it with the
    ///    `INHERITED` bit (release) and copy the virtual pointer;
    /// 3. `create` allows it: allocate a table and compare-exchange it into
    ///    the parent slot; the loser frees its table and retries from 2;
    ///    without a parent, install locally only.
    ///
    /// `is_current` forces a TLB reload when the walk changed the directory
    /// the MMU is using right now.
    pub fn table_for<'a>(
        &'a self,
        parent: Option<&'a PageDirectory>,
        address: VirtualAddress,
        create: bool,
        is_current: bool,
    ) -> KernelResult<&'a PageTable> {
        let index = directory_index(address);

        let mapping = self.slot(index);
        if mapping & EntryFlags::PRESENT.bits() != 0 {
            return Ok(self.wait_for_table(index));
        }

        let mut parent_mapping = match parent {
            Some(parent) => parent.entries[index].load(Ordering::Acquire),
            None => 0,
        };

        let table = loop {
            if parent_mapping & EntryFlags::PRESENT.bits() != 0 {
                let parent = parent.expect("non-zero parent mapping without a parent");
                let table = parent.wait_for_table(index);
                self.entries[index].store(
                    parent_mapping | EntryFlags::INHERITED.bits(),
                    Ordering::Release,
                );
                self.tables[index].store(
                    table as *const PageTable as usize,
                    Ordering::Release,
                );
                break table;
            }

            if !create {
                return Err(KernelError::NotFound);
            }

            let (new_table, table_physical) = PageTable::allocate()?;
            let mut entry = table_physical.as_usize()
                | (EntryFlags::PRESENT | EntryFlags::WRITE).bits();
            if address.as_usize() > KERNEL_END {
                entry |= EntryFlags::USER.bits();
            }

            if let Some(parent) = parent {
                match parent.entries[index].compare_exchange(
                    parent_mapping,
                    entry,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        parent.tables[index]
                            .store(new_table.as_ptr() as usize, Ordering::Release);
                        entry |= EntryFlags::INHERITED.bits();
                    }
                    Err(observed) => {
                        // Someone else won the slot; drop ours and re-read.
                        // SAFETY: the table never left this function.
                        unsafe { PageTable::free(new_table) };
                        parent_mapping = observed;
                        continue;
                    }
                }
            }

            self.entries[index].store(entry, Ordering::Release);
            self.tables[index].store(new_table.as_ptr() as usize, Ordering::Release);
            // SAFETY: just published; lives until directory teardown.
            break unsafe { &*new_table.as_ptr() };
        };

        if is_current {
            arch::reload_tlb();
        }
        Ok(table)
    }

    /// Install a single page mapping. An occupied entry is left alone and
    /// reported as `Exists` so the caller can decide who owns the frame.
    pub fn map(
        &self,
        parent: Option<&PageDirectory>,
        physical: PhysicalAddress,
        address: VirtualAddress,
        flags: EntryFlags,
        is_current: bool,
    ) -> KernelResult<()> {
        let table = self.table_for(parent, address, true, is_current)?;
        let entry = physical.page_base().as_usize() | (flags | EntryFlags::PRESENT).bits();
        table
            .entry(address)
            .compare_exchange(0, entry, Ordering::AcqRel, Ordering::Relaxed)
            .map_err(|_| KernelError::Exists)?;
        if is_current {
            arch::reload_tlb();
        }
        Ok(())
    }

    /// Remove a present mapping, returning the frame and the flags it
    /// carried so the caller can settle ownership.
    pub fn unmap(
        &self,
        parent: Option<&PageDirectory>,
        address: VirtualAddress,
        is_current: bool,
    ) -> KernelResult<(PhysicalAddress, EntryFlags)> {
        let table = self.table_for(parent, address, false, is_current)?;
        let previous = table.entry(address).swap(0, Ordering::AcqRel);
        if previous & EntryFlags::PRESENT.bits() == 0 {
            return Err(KernelError::NotFound);
        }
        if is_current {
            arch::reload_tlb();
        }
        Ok((
            PhysicalAddress::new(previous & ADDRESS_MASK),
            EntryFlags::from_bits_truncate(previous),
        ))
    }

    /// Physical frame backing `address`, if mapped.
    pub fn mapping(
        &self,
        parent: Option<&PageDirectory>,
        address: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let entry = self.entry_raw(parent, address)?;
        Ok(PhysicalAddress::new(entry & ADDRESS_MASK))
    }

    /// Flag bits of the mapping at `address`.
    pub fn flags(
        &self,
        parent: Option<&PageDirectory>,
        address: VirtualAddress,
    ) -> KernelResult<EntryFlags> {
        let entry = self.entry_raw(parent, address)?;
        Ok(EntryFlags::from_bits_truncate(entry))
    }

    /// Rewrite the flag bits of a present mapping, returning the old flags.
    pub fn set_flags(
        &self,
        parent: Option<&PageDirectory>,
        address: VirtualAddress,
        flags: EntryFlags,
        is_current: bool,
    ) -> KernelResult<EntryFlags> {
        let table = self.table_for(parent, address, false, is_current)?;
        let result = table.entry(address).fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |entry| {
                if entry & EntryFlags::PRESENT.bits() == 0 {
                    None
                } else {
                    Some((entry & ADDRESS_MASK) | flags.bits() | EntryFlags::PRESENT.bits())
                }
            },
        );
        match result {
            Ok(previous) => {
                if is_current {
                    arch::reload_tlb();
                }
                Ok(EntryFlags::from_bits_truncate(previous))
            }
            Err(_) => Err(KernelError::NotFound),
        }
    }

    fn entry_raw(
        &self,
        parent: Option<&PageDirectory>,
        address: VirtualAddress,
    ) -> KernelResult<usize> {
        let table = self.table_for(parent, address, false, false)?;
        let entry = table.entry(address).load(Ordering::Acquire);
        if entry & EntryFlags::PRESENT.bits() == 0 {
            return Err(KernelError::NotFound);
        }
        Ok(entry)
    }
}

/// Build the directory for a new address space.
///
/// Every slot the system directory populates (the kernel mappings) is copied
/// with `INHERITED` set; the system directory owns those leaf tables for the
/// machine's lifetime. Slots of the per-thread region are never copied. With
/// `inherit`, present slots of `parent` below the thread region are adopted
/// as well, also marked `INHERITED`.
pub fn clone_directory(
    system: &PageDirectory,
    parent: Option<&PageDirectory>,
    inherit: bool,
) -> KernelResult<(&'static PageDirectory, PhysicalAddress)> {
    let (directory, physical) = PageDirectory::allocate()?;

    let thread_region_first = directory_index(VirtualAddress::new(THREAD_REGION_START));

    for index in 0..ENTRY_COUNT {
        if index >= thread_region_first {
            continue;
        }

        if system.tables[index].load(Ordering::Relaxed) != 0 {
            let mapping = system.entries[index].load(Ordering::Acquire);
            directory.entries[index].store(
                mapping | EntryFlags::INHERITED.bits(),
                Ordering::Release,
            );
            directory.tables[index]
                .store(system.tables[index].load(Ordering::Relaxed), Ordering::Relaxed);
            continue;
        }

        if inherit {
            if let Some(parent) = parent {
                let mapping = parent.entries[index].load(Ordering::Acquire);
                if mapping & EntryFlags::PRESENT.bits() != 0 {
                    directory.entries[index].store(
                        mapping | EntryFlags::INHERITED.bits(),
                        Ordering::Release,
                    );
                    directory.tables[index].store(
                        parent.tables[index].load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                }
            }
        }
    }

    Ok((directory, physical))
}

/// Tear a directory down, returning every owned, non-persistent frame to the
/// pool. Inherited slots are skipped entirely; their leaf tables belong to
/// an ancestor.
///
/// # Safety
///
/// `directory` must no longer be installed on any core and no other
/// reference to it may remain.
pub unsafe fn destroy_directory(directory: &'static PageDirectory, pool: &PhysicalMemory) {
    for index in 0..ENTRY_COUNT {
        let table_raw = directory.tables[index].load(Ordering::Relaxed);
        if table_raw == 0 {
            continue;
        }

        let mapping = directory.entries[index].load(Ordering::Relaxed);
        if mapping & EntryFlags::INHERITED.bits() != 0
            || mapping & EntryFlags::PRESENT.bits() == 0
        {
            continue;
        }

        // SAFETY: a present, non-inherited slot names a table this directory
        // allocated and exclusively owns now that teardown has begun.
        let table = unsafe { &*(table_raw as *const PageTable) };
        for entry in &table.pages {
            let page = entry.load(Ordering::Relaxed);
            if page & EntryFlags::PERSISTENT.bits() != 0
                || page & EntryFlags::PRESENT.bits() == 0
            {
                continue;
            }
            if page & ADDRESS_MASK != 0 {
                pool.free(PhysicalAddress::new(page & ADDRESS_MASK));
            }
        }
        // SAFETY: same table; nothing references it past this point.
        unsafe {
            PageTable::free(NonNull::new_unchecked(table_raw as *mut PageTable));
        }
    }

    // SAFETY: caller guarantees exclusivity; the directory came from
    // `PageDirectory::allocate`.
    unsafe {
        free_page_struct(NonNull::new_unchecked(
            directory as *const PageDirectory as *mut PageDirectory,
        ));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    const USER_ADDRESS: VirtualAddress = VirtualAddress::new(0x4000_0000);

    fn empty_directory() -> &'static PageDirectory {
        PageDirectory::allocate().expect("directory allocation").0
    }

    #[test]
    fn map_then_read_back() {
        let directory = empty_directory();
        let frame = PhysicalAddress::new(0x7000);

        directory
            .map(None, frame, USER_ADDRESS, EntryFlags::WRITE, false)
            .expect("fresh slot maps");
        assert_eq!(
            directory.mapping(None, USER_ADDRESS).expect("mapped"),
            frame
        );
        let flags = directory.flags(None, USER_ADDRESS).expect("mapped");
        assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::WRITE));
    }

    #[test]
    fn existing_mapping_wins() {
        let directory = empty_directory();

        directory
            .map(None, PhysicalAddress::new(0x7000), USER_ADDRESS, EntryFlags::WRITE, false)
            .expect("first mapping");
        assert_eq!(
            directory.map(
                None,
                PhysicalAddress::new(0x8000),
                USER_ADDRESS,
                EntryFlags::WRITE,
                false,
            ),
            Err(KernelError::Exists)
        );
        assert_eq!(
            directory.mapping(None, USER_ADDRESS).expect("mapped"),
            PhysicalAddress::new(0x7000)
        );
    }

    #[test]
    fn unmap_returns_frame_and_flags() {
        let directory = empty_directory();

        directory
            .map(
                None,
                PhysicalAddress::new(0x9000),
                USER_ADDRESS,
                EntryFlags::WRITE | EntryFlags::RAW_PHYSICAL,
                false,
            )
            .expect("mapping");
        let (frame, flags) = directory.unmap(None, USER_ADDRESS, false).expect("unmap");
        assert_eq!(frame, PhysicalAddress::new(0x9000));
        assert!(flags.contains(EntryFlags::RAW_PHYSICAL));
        assert_eq!(
            directory.mapping(None, USER_ADDRESS),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn child_adopts_parent_table() {
        let parent = empty_directory();
        let child = empty_directory();

        parent
            .map(None, PhysicalAddress::new(0xA000), USER_ADDRESS, EntryFlags::WRITE, false)
            .expect("parent mapping");
        // Resolving through the child must reuse the parent's leaf table.
        let table = child
            .table_for(Some(parent), USER_ADDRESS, false, false)
            .expect("inherited table");
        let index = super::directory_index(USER_ADDRESS);
        assert_eq!(
            table as *const PageTable as usize,
            parent.tables[index].load(Ordering::Relaxed)
        );
        assert!(
            child.entries[index].load(Ordering::Relaxed) & EntryFlags::INHERITED.bits() != 0
        );
        assert_eq!(
            child.mapping(Some(parent), USER_ADDRESS).expect("visible"),
            PhysicalAddress::new(0xA000)
        );
    }

    #[test]
    fn sibling_race_converges_on_one_table() {
        use std::{sync::Arc, vec::Vec};

        // Two children of the same parent concurrently fault in the same
        // high address; the parent slot is the consensus point, so both must
        // end up on the same leaf table and carry identical entries.
        let parent = empty_directory();
        let child_a = empty_directory();
        let child_b = empty_directory();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let workers: Vec<_> = [child_a, child_b]
            .into_iter()
            .map(|child| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    child
                        .table_for(Some(parent), USER_ADDRESS, true, false)
                        .expect("create or adopt") as *const PageTable as usize
                })
            })
            .collect();
        let tables: Vec<usize> = workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect();

        let index = super::directory_index(USER_ADDRESS);
        let parent_table = parent.tables[index].load(Ordering::Relaxed);
        assert_ne!(parent_table, 0);
        assert_eq!(tables[0], parent_table);
        assert_eq!(tables[1], parent_table);
        // Both children recorded the winner's entry, inherited.
        let entry_a = child_a.entries[index].load(Ordering::Relaxed);
        let entry_b = child_b.entries[index].load(Ordering::Relaxed);
        assert_eq!(entry_a, entry_b);
        assert!(entry_a & EntryFlags::INHERITED.bits() != 0);
        assert_eq!(
            entry_a & ADDRESS_MASK,
            parent.entries[index].load(Ordering::Relaxed) & ADDRESS_MASK
        );
    }

    #[test]
    fn losing_a_settled_race_frees_the_extra_table() {
        // Deterministic replay of the race tail: the parent slot is already
        // taken by a sibling, so a create through another child must adopt
        // instead of allocating a second table.
        let parent = empty_directory();
        let first = empty_directory();
        let second = empty_directory();

        let table_first = first
            .table_for(Some(parent), USER_ADDRESS, true, false)
            .expect("first child creates") as *const PageTable as usize;
        let table_second = second
            .table_for(Some(parent), USER_ADDRESS, true, false)
            .expect("second child adopts") as *const PageTable as usize;

        assert_eq!(table_first, table_second);
        let index = super::directory_index(USER_ADDRESS);
        assert!(
            second.entries[index].load(Ordering::Relaxed) & EntryFlags::INHERITED.bits() != 0
        );
    }

    #[test]
    fn teardown_returns_owned_frames_once() {
        let pool = PhysicalMemory::with_capacity(16);
        for frame in 1..=4usize {
            pool.free(PhysicalAddress::new(frame * PAGE_SIZE));
        }

        let system = empty_directory();
        // Give the system directory a kernel-region mapping the clone will
        // inherit.
        system
            .map(
                None,
                PhysicalAddress::new(0x6000_0000),
                VirtualAddress::new(0x1000_0000),
                EntryFlags::WRITE,
                false,
            )
            .expect("system mapping");

        let (directory, _physical) =
            clone_directory(system, None, false).expect("clone");
        for page in 0..2usize {
            let frame = pool.allocate(!0, 1).expect("pool frame");
            directory
                .map(
                    None,
                    frame,
                    USER_ADDRESS.offset(page * PAGE_SIZE),
                    EntryFlags::WRITE,
                    false,
                )
                .expect("mapping");
        }
        assert_eq!(pool.free_count(), 2);

        // SAFETY: never installed, no other references.
        unsafe { destroy_directory(directory, &pool) };
        assert_eq!(pool.free_count(), 4);
        // The inherited kernel slot was not touched.
        assert_eq!(
            system
                .mapping(None, VirtualAddress::new(0x1000_0000))
                .expect("system mapping survives"),
            PhysicalAddress::new(0x6000_0000)
        );
    }

    #[test]
    fn dirty_bit_round_trips_through_set_flags() {
        let directory = empty_directory();

        directory
            .map(None, PhysicalAddress::new(0xB000), USER_ADDRESS, EntryFlags::WRITE, false)
            .expect("mapping");
        let old = directory
            .set_flags(
                None,
                USER_ADDRESS,
                EntryFlags::WRITE | EntryFlags::DIRTY,
                false,
            )
            .expect("present mapping");
        assert!(!old.contains(EntryFlags::DIRTY));
        assert!(directory
            .flags(None, USER_ADDRESS)
            .expect("mapped")
            .contains(EntryFlags::DIRTY));
        // The frame address survives a flag rewrite.
        assert_eq!(
            directory.mapping(None, USER_ADDRESS).expect("mapped"),
            PhysicalAddress::new(0xB000)
        );
    }
}
