//! Kernel virtual-region allocator
//!
//! Hands out page-granular windows from the kernel's global-access range for
//! mappings whose caller did not supply a virtual base. Reservations are
//! permanent for the lifetime of the machine; the consumers (device
//! registers, shared rings) never give their windows back.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{VirtualAddress, PAGE_SIZE},
};

pub struct RegionAllocator {
    next: Mutex<usize>,
    end: usize,
}

impl RegionAllocator {
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            next: Mutex::new(start),
            end,
        }
    }

    /// Reserve `pages` consecutive pages of kernel virtual space.
    pub fn reserve(&self, pages: usize) -> KernelResult<VirtualAddress> {
        if pages == 0 {
            return Err(KernelError::InvalidParameters);
        }
        let mut next = self.next.lock();
        let bytes = pages * PAGE_SIZE;
        if self.end - *next < bytes {
            return Err(KernelError::OutOfMemory);
        }
        let base = *next;
        *next += bytes;
        Ok(VirtualAddress::new(base))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn reservations_do_not_overlap() {
        let regions = RegionAllocator::new(0x1000_0000, 0x1001_0000);
        let a = regions.reserve(4).expect("room for four pages");
        let b = regions.reserve(2).expect("room for two more");
        assert_eq!(b.as_usize(), a.as_usize() + 4 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_is_reported() {
        let regions = RegionAllocator::new(0x1000_0000, 0x1000_2000);
        regions.reserve(2).expect("exactly fits");
        assert_eq!(regions.reserve(1), Err(KernelError::OutOfMemory));
    }
}
