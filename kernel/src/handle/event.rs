//! User events
//!
//! Counting events in the eventfd family: a bounded counter a producer
//! signals and a consumer drains, surfaced to handle sets through [`mark`].
//! The sync word is futex-compatible so userspace can wait on its mapping
//! of the counter without entering the kernel.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use super::{registry, set, HandleId, HandleType, Resource};
use crate::{
    error::{KernelError, KernelResult},
    sync::futex_wake,
};

/// Producer-defined event bit posted when a sync event fires
pub const EVENT_SIGNALED: u32 = 1 << 0;
/// Producer-defined event bit posted when a timeout event fires
pub const EVENT_TIMER_FIRED: u32 = 1 << 1;

/// Behaves as a timer rather than a plain semaphore-style event
pub const EVENT_KIND_TIMEOUT: u32 = 1 << 0;

pub struct UserEvent {
    /// Counter ceiling; signals past it are refused
    limit: i32,
    flags: u32,
    value: AtomicI32,
}

impl UserEvent {
    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }
}

fn destroy_user_event(_resource: &Resource) {
    log::trace!("user event reclaimed");
}

fn lookup_event(id: HandleId) -> KernelResult<Arc<UserEvent>> {
    let resource = registry()
        .lookup_typed(id, HandleType::Event)
        .ok_or(KernelError::NotFound)?;
    resource
        .downcast::<UserEvent>()
        .map_err(|_| KernelError::NotFound)
}

/// Create a user event with the given counter ceiling.
pub fn create(limit: i32, flags: u32) -> KernelResult<HandleId> {
    if limit <= 0 {
        return Err(KernelError::InvalidParameters);
    }
    let event = Arc::new(UserEvent {
        limit,
        flags,
        value: AtomicI32::new(0),
    });
    Ok(registry().create(HandleType::Event, Some(destroy_user_event), event))
}

/// Signal the event: bump the counter if the ceiling allows, wake one
/// futex waiter, and mark every observing set.
///
/// Returns `Ok` when the counter was incremented and `Err(Busy)` when it
/// was already at its ceiling; the mark still goes out either way, since
/// the condition "signaled" holds regardless.
pub fn signal(id: HandleId) -> KernelResult<()> {
    let event = lookup_event(id)?;

    let mut current = event.value.load(Ordering::Relaxed);
    let incremented = loop {
        if current >= event.limit {
            break false;
        }
        match event.value.compare_exchange_weak(
            current,
            current + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => break true,
            Err(observed) => current = observed,
        }
    };

    if incremented {
        futex_wake(&event.value, 1);
    }

    let bit = if event.flags & EVENT_KIND_TIMEOUT != 0 {
        EVENT_TIMER_FIRED
    } else {
        EVENT_SIGNALED
    };
    set::mark(id, bit)?;

    if incremented {
        Ok(())
    } else {
        Err(KernelError::Busy)
    }
}

/// Consume one unit of the counter, if any.
pub fn try_consume(id: HandleId) -> KernelResult<()> {
    let event = lookup_event(id)?;
    let mut current = event.value.load(Ordering::Relaxed);
    loop {
        if current <= 0 {
            return Err(KernelError::Busy);
        }
        match event.value.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(()),
            Err(observed) => current = observed,
        }
    }
}

/// Current counter value, for diagnostics.
pub fn value(id: HandleId) -> KernelResult<i32> {
    Ok(lookup_event(id)?.value())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::handle::set::{control, create_set, wait, SetEvent, SetOperation};

    #[test]
    fn signal_saturates_at_the_ceiling() {
        let id = create(2, 0).expect("event");
        signal(id).expect("first signal fits");
        signal(id).expect("second signal fits");
        assert_eq!(signal(id), Err(KernelError::Busy));
        assert_eq!(value(id).expect("live"), 2);

        try_consume(id).expect("one unit available");
        signal(id).expect("room again");

        registry().destroy(id).expect("destroy");
        registry().drain_clean_queue();
    }

    #[test]
    fn signal_marks_observing_sets() {
        let id = create(1, 0).expect("event");
        let set_id = create_set(0);
        control(set_id, SetOperation::Add, id, EVENT_SIGNALED, 0xE).expect("add");

        signal(id).expect("signal");
        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        let count = wait(set_id, &mut out, None).expect("event pending");
        assert_eq!(count, 1);
        assert_eq!(out[0].events, EVENT_SIGNALED);
        assert_eq!(out[0].context, 0xE);

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(id).expect("destroy event");
        registry().drain_clean_queue();
    }

    #[test]
    fn empty_event_has_nothing_to_consume() {
        let id = create(1, 0).expect("event");
        assert_eq!(try_consume(id), Err(KernelError::Busy));
        registry().destroy(id).expect("destroy");
        registry().drain_clean_queue();
    }
}
