//! Handle sets: unified readiness notification
//!
//! A set is itself a handle whose resource aggregates readiness over other
//! handles. Event producers call [`mark`] with the bits that became true;
//! the set queues the member, bumps its pending counter, and wakes one
//! waiter on the 0 -> positive transition. [`wait`] drains queued members
//! into caller records.
//!
//! Ownership is deliberately one-directional: elements are owned by their
//! set's member tree, the observed handle keeps only weak links, and the
//! element points back at its set weakly. No cycles, and a deleted member
//! simply evaporates out of the ready queue.

use alloc::sync::{Arc, Weak};
use alloc::{collections::BTreeMap, collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::{registry, HandleId, HandleType, Resource};
use crate::{
    error::{KernelError, KernelResult},
    sync::{futex_wait, futex_wake},
};

/// Wire operation codes shared with userspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SetOperation {
    Add = 1,
    Modify = 2,
    Delete = 3,
}

impl SetOperation {
    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        match raw {
            1 => Ok(Self::Add),
            2 => Ok(Self::Modify),
            3 => Ok(Self::Delete),
            _ => Err(KernelError::InvalidParameters),
        }
    }
}

bitflags! {
    /// Control bits carried in the high end of a member's configuration
    /// mask; the low bits are producer-defined event bits the set treats as
    /// opaque.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventOptions: u32 {
        /// Report each event once instead of staying ready until cleared
        const EDGE_TRIGGERED = 1 << 30;
        /// Queue the member as ready the moment it is added
        const INITIAL_READY  = 1 << 31;
    }
}

/// One record returned by [`wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEvent {
    pub events: u32,
    pub handle: HandleId,
    pub context: usize,
}

struct ElementConfiguration {
    mask: u32,
    context: usize,
}

/// Membership of one handle in one set
pub(crate) struct SetElement {
    handle: HandleId,
    set: Weak<HandleSet>,
    configuration: Mutex<ElementConfiguration>,
    active: AtomicU32,
}

pub struct HandleSet {
    pending: AtomicI32,
    ready: Mutex<VecDeque<Weak<SetElement>>>,
    members: Mutex<BTreeMap<HandleId, Arc<SetElement>>>,
    flags: u32,
}

impl HandleSet {
    fn new(flags: u32) -> Self {
        Self {
            pending: AtomicI32::new(0),
            ready: Mutex::new(VecDeque::new()),
            members: Mutex::new(BTreeMap::new()),
            flags,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }
}

fn downcast_set(resource: &Resource) -> KernelResult<Arc<HandleSet>> {
    resource
        .clone()
        .downcast::<HandleSet>()
        .map_err(|_| KernelError::NotFound)
}

fn lookup_set(set_id: HandleId) -> KernelResult<Arc<HandleSet>> {
    let resource = registry()
        .lookup_typed(set_id, HandleType::Set)
        .ok_or(KernelError::NotFound)?;
    downcast_set(&resource)
}

/// Create an empty handle set and return its handle.
pub fn create_set(flags: u32) -> HandleId {
    let set: Arc<HandleSet> = Arc::new(HandleSet::new(flags));
    registry().create(HandleType::Set, Some(destroy_handle_set), set)
}

/// Add, modify, or remove a member of the set.
pub fn control(
    set_id: HandleId,
    operation: SetOperation,
    target: HandleId,
    mask: u32,
    context: usize,
) -> KernelResult<()> {
    let set = lookup_set(set_id)?;
    match operation {
        SetOperation::Add => {
            let mut members = set.members.lock();
            if members.contains_key(&target) {
                return Err(KernelError::Exists);
            }
            // The membership holds a reference for as long as it exists.
            let entry = registry()
                .acquire_entry(target)
                .ok_or(KernelError::NotFound)?;
            let element = Arc::new(SetElement {
                handle: target,
                set: Arc::downgrade(&set),
                configuration: Mutex::new(ElementConfiguration { mask, context }),
                active: AtomicU32::new(0),
            });
            entry.observers.lock().push(Arc::downgrade(&element));
            if EventOptions::from_bits_truncate(mask).contains(EventOptions::INITIAL_READY) {
                set.ready.lock().push_back(Arc::downgrade(&element));
                set.pending.fetch_add(1, Ordering::Release);
            }
            members.insert(target, element);
            Ok(())
        }
        SetOperation::Modify => {
            let members = set.members.lock();
            let element = members.get(&target).ok_or(KernelError::NotFound)?;
            let mut configuration = element.configuration.lock();
            configuration.mask = mask;
            configuration.context = context;
            // Disarm anything the new mask no longer watches.
            element.active.fetch_and(mask, Ordering::AcqRel);
            Ok(())
        }
        SetOperation::Delete => {
            let mut members = set.members.lock();
            let element = members.remove(&target).ok_or(KernelError::NotFound)?;
            if let Some(entry) = registry().entry(target) {
                let removed = Arc::downgrade(&element);
                entry
                    .observers
                    .lock()
                    .retain(|observer| !Weak::ptr_eq(observer, &removed));
            }
            drop(members);
            // Balance the acquire taken on Add.
            registry().destroy(target)
        }
    }
}

/// Notify every set observing `id` that `events` became true.
///
/// For each observing element whose configured mask intersects `events`,
/// the intersection is OR-ed into its active bits; a 0 -> nonzero edge
/// queues the element and a pending 0 -> positive edge wakes one waiter.
pub fn mark(id: HandleId, events: u32) -> KernelResult<()> {
    let entry = registry().entry(id).ok_or(KernelError::NotFound)?;
    let mut incomplete = false;

    let observers = entry.observers.lock();
    for weak in observers.iter() {
        let Some(element) = weak.upgrade() else {
            continue;
        };
        let mask = element.configuration.lock().mask;
        let hits = mask & events & !EventOptions::all().bits();
        if hits == 0 {
            continue;
        }
        let previous = element.active.fetch_or(hits, Ordering::AcqRel);
        if previous != 0 {
            continue;
        }
        match element.set.upgrade() {
            Some(set) => {
                set.ready.lock().push_back(weak.clone());
                let previous_pending = set.pending.fetch_add(1, Ordering::Release);
                if previous_pending == 0 {
                    futex_wake(&set.pending, 1);
                }
            }
            None => {
                // The set died under us; the event bits are recorded but
                // nobody will ever see them.
                incomplete = true;
            }
        }
    }

    if incomplete {
        Err(KernelError::Incomplete)
    } else {
        Ok(())
    }
}

/// The inverse bridge: the producer's condition went away. Clears the bits
/// so level-triggered members stop reporting ready.
pub fn unmark(id: HandleId, events: u32) -> KernelResult<()> {
    let entry = registry().entry(id).ok_or(KernelError::NotFound)?;
    let observers = entry.observers.lock();
    for weak in observers.iter() {
        if let Some(element) = weak.upgrade() {
            element.active.fetch_and(!events, Ordering::AcqRel);
        }
    }
    Ok(())
}

/// Wait for readiness on the set, filling `events_out`.
///
/// Returns the number of records written. Level-triggered members re-queue
/// themselves until their condition is cleared by [`unmark`] or a
/// [`SetOperation::Modify`]. `Err(Busy)` means every queued element turned
/// out to be stale (deleted, or cleared concurrently); callers retry.
pub fn wait(
    set_id: HandleId,
    events_out: &mut [SetEvent],
    timeout_ms: Option<u64>,
) -> KernelResult<usize> {
    let set = lookup_set(set_id)?;

    let mut pending = set.pending.swap(0, Ordering::AcqRel);
    while pending == 0 {
        futex_wait(&set.pending, 0, timeout_ms)?;
        pending = set.pending.swap(0, Ordering::AcqRel);
    }

    let budget = (pending as usize).min(events_out.len());
    if pending as usize > budget {
        // More readiness than the caller asked for; leave it visible to the
        // next waiter.
        set.pending
            .fetch_add(pending - budget as i32, Ordering::Release);
    }

    let mut filled = 0;
    let mut requeue: Vec<Weak<SetElement>> = Vec::new();
    {
        let mut ready = set.ready.lock();
        while filled < budget {
            let Some(weak) = ready.pop_front() else {
                break;
            };
            let Some(element) = weak.upgrade() else {
                continue;
            };
            let events = element.active.swap(0, Ordering::AcqRel);
            if events == 0 {
                continue;
            }
            let configuration = element.configuration.lock();
            events_out[filled] = SetEvent {
                events,
                handle: element.handle,
                context: configuration.context,
            };
            let level_triggered = !EventOptions::from_bits_truncate(configuration.mask)
                .contains(EventOptions::EDGE_TRIGGERED);
            drop(configuration);
            if level_triggered {
                // Stays ready until the producer clears the condition.
                element.active.fetch_or(events, Ordering::AcqRel);
                requeue.push(weak);
            }
            filled += 1;
        }
        for weak in requeue {
            ready.push_back(weak);
            set.pending.fetch_add(1, Ordering::Release);
        }
    }

    if filled == 0 {
        return Err(KernelError::Busy);
    }
    Ok(filled)
}

/// Destructor for set handles, run by the janitor: every membership is
/// removed and its Add-time reference released.
fn destroy_handle_set(resource: &Resource) {
    let Ok(set) = downcast_set(resource) else {
        return;
    };
    let mut members = set.members.lock();
    while let Some((id, element)) = members.pop_first() {
        if let Some(entry) = registry().entry(id) {
            let removed = Arc::downgrade(&element);
            entry
                .observers
                .lock()
                .retain(|observer| !Weak::ptr_eq(observer, &removed));
        }
        if registry().destroy(id).is_err() {
            log::warn!("set member {} vanished before its set", id);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::handle::registry;

    const READ: u32 = 1 << 0;
    const WRITE: u32 = 1 << 1;

    fn plain_handle() -> HandleId {
        registry().create(HandleType::Generic, None, Arc::new(0usize))
    }

    #[test]
    fn marked_member_is_returned_by_wait() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0x42).expect("add member");

        mark(handle, READ | WRITE).expect("mark");

        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        let count = wait(set_id, &mut out, None).expect("one event pending");
        assert_eq!(count, 1);
        // Only the configured intersection is reported.
        assert_eq!(out[0].events, READ);
        assert_eq!(out[0].handle, handle);
        assert_eq!(out[0].context, 0x42);

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0).expect("first add");
        assert_eq!(
            control(set_id, SetOperation::Add, handle, READ, 0),
            Err(KernelError::Exists)
        );
        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }

    #[test]
    fn mask_gates_marks() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0).expect("add");

        mark(handle, WRITE).expect("mark misses the mask");
        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        assert_eq!(
            wait(set_id, &mut out, Some(10)),
            Err(KernelError::Timeout)
        );

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }

    #[test]
    fn level_triggered_member_stays_ready_until_cleared() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0).expect("add");
        mark(handle, READ).expect("mark");

        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        wait(set_id, &mut out, None).expect("first wait");
        // Still ready: the condition was never cleared.
        wait(set_id, &mut out, None).expect("second wait");
        assert_eq!(out[0].events, READ);

        unmark(handle, READ).expect("clear condition");
        assert_eq!(
            wait(set_id, &mut out, Some(10)),
            Err(KernelError::Busy)
        );

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }

    #[test]
    fn edge_triggered_member_reports_once() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(
            set_id,
            SetOperation::Add,
            handle,
            READ | EventOptions::EDGE_TRIGGERED.bits(),
            0,
        )
        .expect("add");
        mark(handle, READ).expect("mark");

        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        wait(set_id, &mut out, None).expect("first wait");
        assert_eq!(
            wait(set_id, &mut out, Some(10)),
            Err(KernelError::Timeout)
        );

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }

    #[test]
    fn delete_balances_the_add_reference() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0).expect("add");
        control(set_id, SetOperation::Delete, handle, 0, 0).expect("delete");

        // Only the creation reference remains.
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
        assert!(registry().lookup(handle).is_none());

        registry().destroy(set_id).expect("destroy set");
        registry().drain_clean_queue();
    }

    #[test]
    fn destroying_the_set_releases_members() {
        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 0).expect("add");

        registry().destroy(set_id).expect("destroy set");
        registry().drain_clean_queue();

        // The membership reference is gone; one destroy reclaims the handle.
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
        assert!(registry().lookup(handle).is_none());
    }

    #[test]
    fn wait_wakes_on_concurrent_mark() {
        use std::sync::Arc as StdArc;

        let set_id = create_set(0);
        let handle = plain_handle();
        control(set_id, SetOperation::Add, handle, READ, 7).expect("add");

        let barrier = StdArc::new(std::sync::Barrier::new(2));
        let producer = {
            let barrier = StdArc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                std::thread::sleep(std::time::Duration::from_millis(20));
                mark(handle, READ).expect("mark from producer");
            })
        };

        barrier.wait();
        let mut out = [SetEvent {
            events: 0,
            handle: 0,
            context: 0,
        }];
        let count = wait(set_id, &mut out, None).expect("woken by producer");
        assert_eq!(count, 1);
        assert_eq!(out[0].context, 7);
        producer.join().expect("producer panicked");

        registry().destroy(set_id).expect("destroy set");
        registry().destroy(handle).expect("destroy member");
        registry().drain_clean_queue();
    }
}
