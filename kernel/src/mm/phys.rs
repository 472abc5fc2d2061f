//! Physical frame pool
//!
//! All frame-sized chunks of RAM live here: either on the free stack or
//! handed out, never both. The pool is a bounded LIFO stack of frame base
//! addresses behind an interrupt-safe spinlock; contiguous multi-frame
//! requests are rare (early DMA buffers) and served by an O(n) scan that
//! simply restarts when a candidate run turns out to be incomplete.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    fatal,
    sync::IrqSpinlock,
    mm::{PhysicalAddress, PAGE_OFFSET_MASK, PAGE_SIZE},
};

struct BoundedStack {
    frames: Vec<usize>,
    capacity: usize,
}

pub struct PhysicalMemory {
    pool: IrqSpinlock<BoundedStack>,
}

impl PhysicalMemory {
    /// An empty pool that can hold at most `capacity` free frames.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: IrqSpinlock::new(BoundedStack {
                frames: Vec::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Return a frame to the pool.
    pub fn free(&self, address: PhysicalAddress) {
        if address.as_usize() & PAGE_OFFSET_MASK != 0 {
            fatal!("freeing unaligned frame {}", address);
        }
        let mut pool = self.pool.lock();
        debug_assert!(
            !pool.frames.contains(&address.as_usize()),
            "frame {} freed while already in the pool",
            address
        );
        if pool.frames.len() == pool.capacity {
            fatal!("physical frame pool overflow at {}", address);
        }
        pool.frames.push(address.as_usize());
    }

    /// Take `count` physically contiguous frames whose addresses all satisfy
    /// `mask` (`address & !mask == 0`). Single-frame requests pop the newest
    /// matching entry.
    pub fn allocate(&self, mask: usize, count: usize) -> KernelResult<PhysicalAddress> {
        if count == 0 {
            return Err(KernelError::InvalidParameters);
        }
        let mut pool = self.pool.lock();
        if count == 1 {
            return pool.take_single(mask);
        }
        pool.take_run(mask, count)
    }

    /// Frames currently in the pool.
    pub fn free_count(&self) -> usize {
        self.pool.lock().frames.len()
    }
}

impl BoundedStack {
    fn take_single(&mut self, mask: usize) -> KernelResult<PhysicalAddress> {
        // Newest first, so the cache-warm frame is reused.
        for index in (0..self.frames.len()).rev() {
            let address = self.frames[index];
            if address & !mask == 0 {
                self.frames.remove(index);
                return Ok(PhysicalAddress::new(address));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn take_run(&mut self, mask: usize, count: usize) -> KernelResult<PhysicalAddress> {
        'candidates: for index in (0..self.frames.len()).rev() {
            let base = self.frames[index];
            if base & !mask != 0 {
                continue;
            }
            let last = base + (count - 1) * PAGE_SIZE;
            if last & !mask != 0 {
                continue;
            }
            for step in 1..count {
                if !self.frames.contains(&(base + step * PAGE_SIZE)) {
                    continue 'candidates;
                }
            }
            // Complete run found; pull every member off the stack.
            self.frames.retain(|&frame| frame < base || frame > last);
            return Ok(PhysicalAddress::new(base));
        }
        Err(KernelError::OutOfMemory)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn pool_with(frames: &[usize]) -> PhysicalMemory {
        let pool = PhysicalMemory::with_capacity(64);
        for &frame in frames {
            pool.free(PhysicalAddress::new(frame));
        }
        pool
    }

    #[test]
    fn allocation_is_lifo() {
        let pool = pool_with(&[0x1000, 0x2000, 0x3000]);

        assert_eq!(
            pool.allocate(!0, 1).expect("pool has frames"),
            PhysicalAddress::new(0x3000)
        );
        assert_eq!(
            pool.allocate(!0, 1).expect("pool has frames"),
            PhysicalAddress::new(0x2000)
        );
        pool.free(PhysicalAddress::new(0x3000));
        assert_eq!(
            pool.allocate(!0, 1).expect("freed frame is back"),
            PhysicalAddress::new(0x3000)
        );
    }

    #[test]
    fn pool_size_is_conserved() {
        let pool = pool_with(&[0x1000, 0x2000, 0x3000, 0x4000]);

        let a = pool.allocate(!0, 1).expect("first allocation");
        let b = pool.allocate(!0, 2).expect("contiguous pair");
        pool.free(a);
        pool.free(b);
        pool.free(b.offset(PAGE_SIZE));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn mask_constrains_single_frames() {
        let pool = pool_with(&[0x1000, 0x200_0000]);

        // A 16 MiB DMA-style mask skips the 32 MiB frame even though it is
        // newer.
        let frame = pool.allocate(0xFF_FFFF, 1).expect("low frame matches");
        assert_eq!(frame, PhysicalAddress::new(0x1000));
        assert_eq!(
            pool.allocate(0xFF_FFFF, 1),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn contiguous_run_spans_gaps() {
        // 0x5000 missing: the run must come from 0x6000..0x8000.
        let pool = pool_with(&[0x3000, 0x4000, 0x6000, 0x7000, 0x8000]);

        let run = pool.allocate(!0, 3).expect("three contiguous frames exist");
        assert_eq!(run, PhysicalAddress::new(0x6000));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(
            pool.allocate(!0, 3),
            Err(KernelError::OutOfMemory)
        );
    }
}
