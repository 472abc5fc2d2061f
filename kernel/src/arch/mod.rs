//! Architecture collaborators
//!
//! The core calls out to a small, fixed surface: current core identity,
//! MMU install and TLB reload, interrupt state, the idle instruction, and
//! the raw inter-processor doorbell. On bare-metal x86_64 these are real;
//! on a host build (unit tests, coverage) they are deterministic stand-ins
//! so the core's logic can be exercised without hardware.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::*;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use self::host::*;

use crate::{
    cpu::{CoreId, IpiMessage},
    error::KernelResult,
};

/// Enqueue a function on the target core and ring its doorbell.
///
/// Ordering toward a single destination is producer-FIFO; across
/// destinations nothing is promised.
pub fn txu_message_send(core: CoreId, message: IpiMessage) -> KernelResult<()> {
    crate::cpu::post_to_core(core, message)?;
    raise_ipi(core);
    Ok(())
}
