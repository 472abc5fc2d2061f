//! Synchronization primitives
//!
//! Small building blocks shared by the memory, handle, and CPU subsystems.
//! Everything here is interrupt-aware where it has to be and busy-waiting
//! where blocking would require the scheduler (which plugs in above this
//! layer).

pub mod futex;
pub mod irq_lock;
pub mod once_lock;
pub mod reentrant;
pub mod refcount;
pub mod semaphore;

pub use futex::{futex_wait, futex_wake};
pub use irq_lock::IrqSpinlock;
pub use once_lock::OnceLock;
pub use reentrant::ReentrantLock;
pub use refcount::RefCount;
pub use semaphore::Semaphore;
