//! Halcyon kernel library
//!
//! The core of the kernel: physical and virtual memory management, the
//! system-wide handle registry with readiness notification, and the CPU
//! topology with inter-processor messaging. Exported as a library so the
//! unit-test suite can drive every subsystem on a host build.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal uses the kernel heap; host builds (tests, coverage) delegate to
// the system allocator so test code can allocate normally.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Hand the bare-metal heap its backing window. Called once from entry.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init_heap(start: usize, size: usize) {
    // SAFETY: entry passes a mapped, unused, page-aligned window.
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
}

#[macro_use]
pub mod serial;
#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod cpu;
pub mod error;
pub mod handle;
pub mod klog;
pub mod machine;
pub mod mm;
pub mod sync;
pub mod thread;

// Re-exports for the binary and for tests
pub use error::{KernelError, KernelResult};
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
