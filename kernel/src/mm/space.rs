//! Address spaces
//!
//! The per-process virtual-memory facade over the frame pool and the
//! page-table engine. Every space shares the kernel mapping through
//! inherited directory slots; application and driver spaces additionally
//! synchronize their shared user region with the upper-most non-kernel
//! ancestor of the process that spawned them.

use alloc::{boxed::Box, sync::Arc, vec};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    arch,
    error::{KernelError, KernelResult},
    fatal,
    mm::{
        page_count,
        paging::{self, EntryFlags, PageDirectory},
        region::RegionAllocator,
        PhysicalAddress, PhysicalMemory, VirtualAddress, GLOBAL_ACCESS_END, GLOBAL_ACCESS_START,
        KERNEL_END, PAGE_SIZE, THREAD_REGION_START,
    },
    sync::{RefCount, ReentrantLock},
};

bitflags! {
    /// Role bits, clone modifiers, and mapping modes; one stable flag set
    /// shared with userspace
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpaceFlags: u32 {
        const KERNEL           = 1 << 0;
        const APPLICATION      = 1 << 1;
        const DRIVER           = 1 << 2;
        /// Clone the current space's shared user region
        const INHERIT          = 1 << 3;
        /// Caller supplies the physical base; frames stay caller-owned
        const VIRTUAL          = 1 << 4;
        /// One physically contiguous run backs the whole mapping
        const CONTIGUOUS       = 1 << 5;
        /// Caller supplies the virtual base
        const SUPPLIED_VIRTUAL = 1 << 6;
        const NOCACHE          = 1 << 7;
        const READONLY         = 1 << 8;
    }
}

/// x86 task I/O permission bitmap: one bit per port
const IO_BITMAP_SIZE: usize = 8192;

/// Per-core current-space slots; the scheduler parks the running thread's
/// space here via `switch`
const CORE_SLOTS: usize = 256;

pub struct AddressSpace {
    id: u32,
    flags: SpaceFlags,
    directory: &'static PageDirectory,
    directory_physical: PhysicalAddress,
    /// Upper-most non-kernel ancestor; `None` for the kernel space and for
    /// process roots
    parent: Option<Arc<AddressSpace>>,
    references: RefCount,
    lock: ReentrantLock,
    /// Allocated for root spaces only; applications start with every port
    /// denied, drivers with every port allowed
    io_bitmap: Option<Mutex<Box<[u8]>>>,
}

impl AddressSpace {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> SpaceFlags {
        self.flags
    }

    pub fn directory(&self) -> &'static PageDirectory {
        self.directory
    }

    pub fn directory_physical(&self) -> PhysicalAddress {
        self.directory_physical
    }

    pub fn parent(&self) -> Option<&Arc<AddressSpace>> {
        self.parent.as_ref()
    }

    pub fn references(&self) -> i32 {
        self.references.get()
    }

    /// Grant or revoke access to an I/O port. Only meaningful on a root
    /// space; child spaces share their root's bitmap through the scheduler.
    pub fn set_io_port(&self, port: u16, allowed: bool) -> KernelResult<()> {
        let Some(bitmap) = &self.io_bitmap else {
            return Err(KernelError::InvalidParameters);
        };
        let mut bitmap = bitmap.lock();
        let byte = usize::from(port / 8);
        let bit = 1u8 << (port % 8);
        // A cleared bit means the port is accessible.
        if allowed {
            bitmap[byte] &= !bit;
        } else {
            bitmap[byte] |= bit;
        }
        Ok(())
    }
}

/// Translate interface flags to native MMU entry bits.
fn native_flags(flags: SpaceFlags) -> EntryFlags {
    let mut native = EntryFlags::PRESENT;
    if flags.contains(SpaceFlags::APPLICATION) {
        native |= EntryFlags::USER;
    }
    if flags.contains(SpaceFlags::NOCACHE) {
        native |= EntryFlags::NOCACHE;
    }
    if flags.contains(SpaceFlags::VIRTUAL) {
        // Caller-owned frames must survive teardown untouched.
        native |= EntryFlags::RAW_PHYSICAL | EntryFlags::PERSISTENT;
    }
    if !flags.contains(SpaceFlags::READONLY) {
        native |= EntryFlags::WRITE;
    }
    native
}

pub struct SpaceManager {
    kernel_space: Arc<AddressSpace>,
    physical: &'static PhysicalMemory,
    regions: RegionAllocator,
    id_generator: AtomicU32,
    current: [Mutex<Option<Arc<AddressSpace>>>; CORE_SLOTS],
}

impl SpaceManager {
    pub fn new(
        kernel_directory: &'static PageDirectory,
        kernel_directory_physical: PhysicalAddress,
        physical: &'static PhysicalMemory,
    ) -> Self {
        let id_generator = AtomicU32::new(1);
        let kernel_space = Arc::new(AddressSpace {
            id: id_generator.fetch_add(1, Ordering::Relaxed),
            flags: SpaceFlags::KERNEL,
            directory: kernel_directory,
            directory_physical: kernel_directory_physical,
            parent: None,
            references: RefCount::new(1),
            lock: ReentrantLock::new(),
            io_bitmap: None,
        });
        Self {
            kernel_space,
            physical,
            regions: RegionAllocator::new(GLOBAL_ACCESS_START, GLOBAL_ACCESS_END),
            id_generator,
            current: [const { Mutex::new(None) }; CORE_SLOTS],
        }
    }

    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    /// The space of the currently running thread, or the kernel space while
    /// threading is not up on this core.
    pub fn current(&self) -> Arc<AddressSpace> {
        let slot = self.current[arch::core_id() as usize % CORE_SLOTS].lock();
        match &*slot {
            Some(space) => Arc::clone(space),
            None => Arc::clone(&self.kernel_space),
        }
    }

    /// Create an address space according to `flags`.
    pub fn create(&self, flags: SpaceFlags) -> KernelResult<Arc<AddressSpace>> {
        if flags.contains(SpaceFlags::KERNEL) {
            // The kernel space is recycled, never duplicated.
            if !self.kernel_space.references.try_acquire() {
                fatal!("kernel space refcount reached zero");
            }
            return Ok(Arc::clone(&self.kernel_space));
        }

        if flags == SpaceFlags::INHERIT {
            let current = self.current();
            if !current.references.try_acquire() {
                return Err(KernelError::NotFound);
            }
            return Ok(current);
        }

        if flags.intersects(SpaceFlags::APPLICATION | SpaceFlags::DRIVER) {
            if flags.contains(SpaceFlags::APPLICATION | SpaceFlags::DRIVER) {
                fatal!("address space roles are exclusive: {:?}", flags);
            }
            return self.create_user_space(flags);
        }

        fatal!("invalid address space flags {:?}", flags);
    }

    fn create_user_space(&self, flags: SpaceFlags) -> KernelResult<Arc<AddressSpace>> {
        let current = self.current();

        // Chain to the upper-most ancestor of the current space, stopping
        // short of the kernel: process roots have no parent.
        let parent = match current.parent() {
            Some(parent) => Some(Arc::clone(parent)),
            None => Some(Arc::clone(&current)),
        }
        .filter(|space| !Arc::ptr_eq(space, &self.kernel_space));

        let (directory, directory_physical) = paging::clone_directory(
            self.kernel_space.directory(),
            parent.as_ref().map(|space| space.directory()),
            flags.contains(SpaceFlags::INHERIT),
        )?;

        // Only process roots own an I/O permission map. Applications start
        // fully fenced off, drivers fully open.
        let io_bitmap = parent.is_none().then(|| {
            let fill = if flags.contains(SpaceFlags::APPLICATION) {
                0xFF
            } else {
                0x00
            };
            Mutex::new(vec![fill; IO_BITMAP_SIZE].into_boxed_slice())
        });

        Ok(Arc::new(AddressSpace {
            id: self.id_generator.fetch_add(1, Ordering::Relaxed),
            flags,
            directory,
            directory_physical,
            parent,
            references: RefCount::new(1),
            lock: ReentrantLock::new(),
            io_bitmap,
        }))
    }

    /// Drop one reference; the last one tears the directory down for
    /// application and driver spaces. The kernel space is never freed.
    pub fn destroy(&self, space: &Arc<AddressSpace>) {
        if !space.references.release() {
            return;
        }
        if space
            .flags
            .intersects(SpaceFlags::APPLICATION | SpaceFlags::DRIVER)
        {
            // SAFETY: the reference count reached zero, so no thread can be
            // running on this directory anymore and nobody else will touch
            // it.
            unsafe { paging::destroy_directory(space.directory, self.physical) };
        }
    }

    /// Install `space` on the executing core. The caller keeps the space
    /// alive for as long as the MMU uses it.
    pub fn switch(&self, space: &Arc<AddressSpace>) {
        arch::update_virtual_addressing(
            space.directory as *const PageDirectory as usize,
            space.directory_physical,
        );
        *self.current[arch::core_id() as usize % CORE_SLOTS].lock() = Some(Arc::clone(space));
    }

    /// The parent directory consulted for lazy table synchronization at
    /// `address`: the kernel's below the kernel split, the space's process
    /// parent in the shared user region, none in the per-thread region.
    fn parent_directory_for(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
    ) -> Option<&'static PageDirectory> {
        if address.as_usize() <= KERNEL_END {
            return Some(self.kernel_space.directory);
        }
        if address.as_usize() < THREAD_REGION_START {
            if let Some(parent) = &space.parent {
                return Some(parent.directory);
            }
        }
        None
    }

    fn is_current(&self, space: &Arc<AddressSpace>) -> bool {
        Arc::ptr_eq(space, &self.current())
    }

    /// Map `size` bytes into `space`.
    ///
    /// `physical` is the supplied base with `VIRTUAL`, and receives the
    /// chosen base otherwise. `address` is the supplied base with
    /// `SUPPLIED_VIRTUAL`, and receives the reserved kernel-region base
    /// otherwise. `mask` constrains every frame drawn from the pool.
    pub fn map(
        &self,
        space: &Arc<AddressSpace>,
        mut physical: Option<&mut PhysicalAddress>,
        mut address: Option<&mut VirtualAddress>,
        size: usize,
        flags: SpaceFlags,
        mask: usize,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidParameters);
        }
        let pages = page_count(size);

        let physical_base = if flags.contains(SpaceFlags::VIRTUAL) {
            match physical.as_deref() {
                Some(base) => base.page_base(),
                None => return Err(KernelError::InvalidParameters),
            }
        } else if flags.contains(SpaceFlags::CONTIGUOUS) {
            let base = self.physical.allocate(mask, pages)?;
            if let Some(out) = physical.as_deref_mut() {
                *out = base;
            }
            base
        } else {
            if let Some(out) = physical.as_deref_mut() {
                *out = PhysicalAddress::new(0);
            }
            PhysicalAddress::new(0)
        };

        let virtual_base = if flags.contains(SpaceFlags::SUPPLIED_VIRTUAL) {
            match address.as_deref() {
                Some(base) => base.page_base(),
                None => return Err(KernelError::InvalidParameters),
            }
        } else {
            match self.regions.reserve(pages) {
                Ok(base) => {
                    if let Some(out) = address.as_deref_mut() {
                        *out = base;
                    }
                    base
                }
                Err(error) => {
                    if flags.contains(SpaceFlags::CONTIGUOUS) {
                        self.free_run(physical_base, pages);
                    }
                    return Err(error);
                }
            }
        };

        let native = native_flags(flags);
        let parent = self.parent_directory_for(space, virtual_base);
        let is_current = self.is_current(space);
        let fixed_backing =
            flags.intersects(SpaceFlags::VIRTUAL | SpaceFlags::CONTIGUOUS);

        let _guard = space.lock.lock();
        for index in 0..pages {
            let page_address = virtual_base.offset(index * PAGE_SIZE);
            let page_physical = if fixed_backing {
                physical_base.offset(index * PAGE_SIZE)
            } else {
                match self.physical.allocate(mask, 1) {
                    Ok(frame) => frame,
                    Err(error) => {
                        self.unwind_partial(space, parent, virtual_base, index, is_current);
                        return Err(error);
                    }
                }
            };

            if !fixed_backing {
                if let Some(out) = physical.as_deref_mut() {
                    if out.as_usize() == 0 {
                        *out = page_physical;
                    }
                }
            }

            match space
                .directory
                .map(parent, page_physical, page_address, native, is_current)
            {
                Ok(()) => {}
                Err(_) => {
                    // The existing mapping wins. A collision mid-run breaks
                    // the contiguity promise and cannot be recovered.
                    if flags.contains(SpaceFlags::CONTIGUOUS) && index != 0 {
                        fatal!("contiguous mapping collided at {}", page_address);
                    }
                    if !flags.contains(SpaceFlags::VIRTUAL) {
                        self.physical.free(page_physical);
                    }
                }
            }
        }
        Ok(())
    }

    fn free_run(&self, base: PhysicalAddress, pages: usize) {
        for index in 0..pages {
            self.physical.free(base.offset(index * PAGE_SIZE));
        }
    }

    /// Roll back the pages mapped before an allocation failure.
    fn unwind_partial(
        &self,
        space: &Arc<AddressSpace>,
        parent: Option<&PageDirectory>,
        base: VirtualAddress,
        mapped: usize,
        is_current: bool,
    ) {
        for index in 0..mapped {
            let page_address = base.offset(index * PAGE_SIZE);
            if let Ok((frame, entry)) = space.directory.unmap(parent, page_address, is_current)
            {
                if !entry.contains(EntryFlags::RAW_PHYSICAL) {
                    self.physical.free(frame);
                }
            }
        }
    }

    /// Rewrite the protection bits of every page in the range, reporting
    /// the first page's previous flags.
    pub fn change_protection(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
        size: usize,
        flags: SpaceFlags,
        mut previous: Option<&mut EntryFlags>,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidParameters);
        }
        let native = native_flags(flags);
        let pages = page_count(size + address.page_offset());
        let parent = self.parent_directory_for(space, address);
        let is_current = self.is_current(space);

        let _guard = space.lock.lock();
        for index in 0..pages {
            let page_address = address.page_base().offset(index * PAGE_SIZE);
            let old = space
                .directory
                .set_flags(parent, page_address, native, is_current)?;
            if index == 0 {
                if let Some(out) = previous.as_deref_mut() {
                    *out = old;
                }
            }
        }
        Ok(())
    }

    /// Unmap every page of the range. Pages that are not mapped are logged
    /// and skipped; owned frames go back to the pool.
    pub fn unmap(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
        size: usize,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidParameters);
        }
        let pages = page_count(size);
        let parent = self.parent_directory_for(space, address);
        let is_current = self.is_current(space);

        let _guard = space.lock.lock();
        for index in 0..pages {
            let page_address = address.page_base().offset(index * PAGE_SIZE);
            match space.directory.unmap(parent, page_address, is_current) {
                Ok((frame, entry)) => {
                    if !entry.contains(EntryFlags::RAW_PHYSICAL) && frame.as_usize() != 0 {
                        self.physical.free(frame);
                    }
                }
                Err(_) => {
                    log::trace!("ignoring unmap of unmapped address {}", page_address);
                }
            }
        }
        Ok(())
    }

    /// Physical address backing `address` in `space`.
    pub fn mapping(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let parent = self.parent_directory_for(space, address);
        let frame = space.directory.mapping(parent, address)?;
        Ok(frame.offset(address.page_offset()))
    }

    /// Whether the page at `address` has been written through this mapping.
    pub fn is_dirty(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
    ) -> KernelResult<bool> {
        let parent = self.parent_directory_for(space, address);
        let flags = space.directory.flags(parent, address)?;
        Ok(flags.contains(EntryFlags::DIRTY))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::paging::PageDirectory;

    fn manager_with_frames(frames: &[usize]) -> SpaceManager {
        let pool = Box::leak(Box::new(PhysicalMemory::with_capacity(64)));
        for &frame in frames {
            pool.free(PhysicalAddress::new(frame));
        }
        let (kernel_directory, kernel_physical) =
            PageDirectory::allocate().expect("kernel directory");
        SpaceManager::new(kernel_directory, kernel_physical, pool)
    }

    #[test]
    fn kernel_space_is_recycled() {
        let manager = manager_with_frames(&[]);
        let before = manager.kernel_space().references();

        let kernel = manager.create(SpaceFlags::KERNEL).expect("kernel role");
        assert!(Arc::ptr_eq(&kernel, manager.kernel_space()));
        assert_eq!(kernel.references(), before + 1);

        manager.destroy(&kernel);
        assert_eq!(manager.kernel_space().references(), before);
    }

    #[test]
    fn inherit_returns_current_space() {
        let manager = manager_with_frames(&[]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");
        manager.switch(&space);

        let inherited = manager.create(SpaceFlags::INHERIT).expect("inherit");
        assert!(Arc::ptr_eq(&inherited, &space));
        assert_eq!(space.references(), 2);
    }

    #[test]
    fn clone_and_map_draws_frames_from_the_pool() {
        let manager =
            manager_with_frames(&[0x10_1000, 0x10_2000, 0x10_3000, 0x10_4000]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");
        assert!(space.parent().is_none());
        assert!(space.io_bitmap.is_some());

        let mut chosen = VirtualAddress::new(0);
        manager
            .map(
                &space,
                None,
                Some(&mut chosen),
                2 * PAGE_SIZE,
                SpaceFlags::empty(),
                !0,
            )
            .expect("two-page mapping");
        assert_ne!(chosen.as_usize(), 0);

        let first = manager.mapping(&space, chosen).expect("first page mapped");
        let second = manager
            .mapping(&space, chosen.offset(PAGE_SIZE))
            .expect("second page mapped");
        assert_ne!(first, second);
        // Two frames came out of the pool, nothing more.
        assert_eq!(manager.physical.free_count(), 2);

        manager
            .unmap(&space, chosen, 2 * PAGE_SIZE)
            .expect("unmap returns frames");
        assert_eq!(manager.physical.free_count(), 4);
        manager.destroy(&space);
    }

    #[test]
    fn supplied_physical_mapping_is_caller_owned() {
        let manager = manager_with_frames(&[0x10_1000]);
        let space = manager
            .create(SpaceFlags::DRIVER)
            .expect("driver space");

        // Driver roots own an all-open port bitmap.
        space
            .set_io_port(0x3F8, false)
            .expect("root space owns a bitmap");

        let mut device = PhysicalAddress::new(0xFEC0_0000);
        let mut window = VirtualAddress::new(0);
        manager
            .map(
                &space,
                Some(&mut device),
                Some(&mut window),
                PAGE_SIZE,
                SpaceFlags::VIRTUAL | SpaceFlags::NOCACHE,
                !0,
            )
            .expect("device mapping");
        assert_eq!(
            manager.mapping(&space, window).expect("mapped"),
            PhysicalAddress::new(0xFEC0_0000)
        );

        // The pool did not shrink and unmapping does not grow it.
        assert_eq!(manager.physical.free_count(), 1);
        manager.unmap(&space, window, PAGE_SIZE).expect("unmap");
        assert_eq!(manager.physical.free_count(), 1);
        manager.destroy(&space);
    }

    #[test]
    fn contiguous_mapping_uses_one_run() {
        let manager =
            manager_with_frames(&[0x10_1000, 0x10_2000, 0x10_3000, 0x20_0000]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");

        let mut base = PhysicalAddress::new(0);
        let mut window = VirtualAddress::new(0);
        manager
            .map(
                &space,
                Some(&mut base),
                Some(&mut window),
                3 * PAGE_SIZE,
                SpaceFlags::CONTIGUOUS,
                !0,
            )
            .expect("contiguous mapping");
        assert_eq!(base, PhysicalAddress::new(0x10_1000));
        for page in 0..3 {
            assert_eq!(
                manager
                    .mapping(&space, window.offset(page * PAGE_SIZE))
                    .expect("page mapped"),
                base.offset(page * PAGE_SIZE)
            );
        }
        manager.destroy(&space);
    }

    #[test]
    fn inherited_clone_sees_parent_mappings() {
        let manager = manager_with_frames(&[0x10_1000, 0x10_2000]);
        let parent_space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("parent space");
        manager.switch(&parent_space);

        // A mapping in the shared user region, supplied-virtual so it lands
        // above the kernel split.
        let mut user = VirtualAddress::new(0x4000_0000);
        manager
            .map(
                &parent_space,
                None,
                Some(&mut user),
                PAGE_SIZE,
                SpaceFlags::SUPPLIED_VIRTUAL | SpaceFlags::APPLICATION,
                !0,
            )
            .expect("parent user mapping");

        let child = manager
            .create(SpaceFlags::APPLICATION | SpaceFlags::INHERIT)
            .expect("inheriting child");
        assert!(Arc::ptr_eq(
            child.parent().expect("child has parent"),
            &parent_space
        ));
        assert_eq!(
            manager.mapping(&child, user).expect("inherited mapping"),
            manager.mapping(&parent_space, user).expect("parent mapping")
        );

        manager.destroy(&child);
        manager.destroy(&parent_space);
    }

    #[test]
    fn destroying_a_space_returns_its_user_frames() {
        let manager = manager_with_frames(&[0x10_1000, 0x10_2000]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");

        let mut user = VirtualAddress::new(0x4000_0000);
        manager
            .map(
                &space,
                None,
                Some(&mut user),
                2 * PAGE_SIZE,
                SpaceFlags::SUPPLIED_VIRTUAL | SpaceFlags::APPLICATION,
                !0,
            )
            .expect("user mapping");
        assert_eq!(manager.physical.free_count(), 0);

        manager.destroy(&space);
        assert_eq!(manager.physical.free_count(), 2);
    }

    #[test]
    fn change_protection_reports_previous_flags() {
        let manager = manager_with_frames(&[0x10_1000, 0x10_2000]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");

        let mut user = VirtualAddress::new(0x4000_0000);
        manager
            .map(
                &space,
                None,
                Some(&mut user),
                2 * PAGE_SIZE,
                SpaceFlags::SUPPLIED_VIRTUAL | SpaceFlags::APPLICATION,
                !0,
            )
            .expect("user mapping");

        let mut old = EntryFlags::empty();
        // Misaligned base: the page count must still cover the second page.
        manager
            .change_protection(
                &space,
                user.offset(0x800),
                PAGE_SIZE + 0x700,
                SpaceFlags::APPLICATION | SpaceFlags::READONLY,
                Some(&mut old),
            )
            .expect("protection change");
        assert!(old.contains(EntryFlags::WRITE));
        for page in 0..2 {
            let flags = space
                .directory()
                .flags(None, user.offset(page * PAGE_SIZE))
                .expect("mapped");
            assert!(!flags.contains(EntryFlags::WRITE));
        }
        manager.destroy(&space);
    }

    #[test]
    fn dirty_query_follows_the_dirty_bit() {
        let manager = manager_with_frames(&[0x10_1000]);
        let space = manager
            .create(SpaceFlags::APPLICATION)
            .expect("application space");

        let mut user = VirtualAddress::new(0x4000_0000);
        manager
            .map(
                &space,
                None,
                Some(&mut user),
                PAGE_SIZE,
                SpaceFlags::SUPPLIED_VIRTUAL | SpaceFlags::APPLICATION,
                !0,
            )
            .expect("user mapping");
        assert!(!manager.is_dirty(&space, user).expect("mapped"));

        // Simulate the MMU setting the dirty bit on first write.
        let flags = space.directory().flags(None, user).expect("mapped");
        space
            .directory()
            .set_flags(None, user, flags | EntryFlags::DIRTY, false)
            .expect("flag update");
        assert!(manager.is_dirty(&space, user).expect("mapped"));
        manager.destroy(&space);
    }
}
