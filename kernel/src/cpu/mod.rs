//! CPU topology and inter-processor messaging
//!
//! A processor groups one primary core with the application cores brought
//! up after it. Cores live inside their owning [`Processor`]; the global
//! core table stores only non-owning references and is append-only during
//! boot, so post-bringup reads need no lock.
//!
//! Cross-core work travels as short functions: [`message_send`] enqueues
//! onto every targeted core and rings its doorbell. Each core carries two
//! inbox slots, so a message arriving mid-drain lands in the slot not being
//! processed and never stalls the sender.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::{
    arch,
    error::{KernelError, KernelResult},
    fatal,
    machine,
};

/// Upper bound on hardware core identifiers
pub const MAX_CORES: usize = 256;

pub type CoreId = u32;

/// Marks an unoccupied application-core slot
const INVALID_CORE: CoreId = CoreId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreState {
    Unavailable = 0,
    Running = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    FlushTlb,
    Reschedule,
    Halt,
    Custom,
}

pub type IpiFunction = fn(usize);

#[derive(Clone, Copy)]
pub struct IpiMessage {
    pub kind: MessageKind,
    pub function: IpiFunction,
    pub argument: usize,
}

pub struct Core {
    id: AtomicU32,
    state: AtomicU32,
    /// Brought up by firmware outside our INIT/SIPI sequence
    external: AtomicBool,
    /// Which inbox slot new messages land in; flipped by the drain side
    inbox: AtomicUsize,
    queues: [Mutex<VecDeque<IpiMessage>>; 2],
    /// Thread structures parked here by the scheduler
    current_thread: AtomicUsize,
    idle_thread: AtomicUsize,
}

impl Core {
    const fn vacant() -> Self {
        Self {
            id: AtomicU32::new(INVALID_CORE),
            state: AtomicU32::new(CoreState::Unavailable as u32),
            external: AtomicBool::new(false),
            inbox: AtomicUsize::new(0),
            queues: [Mutex::new(VecDeque::new()), Mutex::new(VecDeque::new())],
            current_thread: AtomicUsize::new(0),
            idle_thread: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CoreState {
        if self.state.load(Ordering::Acquire) == CoreState::Running as u32 {
            CoreState::Running
        } else {
            CoreState::Unavailable
        }
    }

    pub fn is_external(&self) -> bool {
        self.external.load(Ordering::Relaxed)
    }

    /// Enqueue a message for this core. Producer-FIFO toward one core.
    pub fn post_message(&self, message: IpiMessage) {
        let slot = self.inbox.load(Ordering::Acquire) & 1;
        self.queues[slot].lock().push_back(message);
    }

    /// Drain and execute the active inbox. New arrivals flow into the other
    /// slot meanwhile.
    pub fn process_messages(&self) -> usize {
        let slot = self.inbox.fetch_xor(1, Ordering::AcqRel) & 1;
        let mut executed = 0;
        loop {
            let message = self.queues[slot].lock().pop_front();
            match message {
                Some(message) => {
                    (message.function)(message.argument);
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Messages waiting across both inbox slots.
    pub fn pending_messages(&self) -> usize {
        self.queues[0].lock().len() + self.queues[1].lock().len()
    }

    pub fn set_current_thread(&self, thread: usize) {
        self.current_thread.store(thread, Ordering::Release);
    }

    pub fn current_thread(&self) -> usize {
        self.current_thread.load(Ordering::Acquire)
    }

    pub fn set_idle_thread(&self, thread: usize) {
        self.idle_thread.store(thread, Ordering::Release);
    }
}

pub struct Processor {
    primary: Core,
    application: Once<Box<[Core]>>,
    core_count: usize,
}

impl Processor {
    /// Describe a processor whose boot core is already executing.
    pub fn new(boot_core: CoreId, core_count: usize) -> Self {
        let primary = Core::vacant();
        primary.id.store(boot_core, Ordering::Relaxed);
        primary
            .state
            .store(CoreState::Running as u32, Ordering::Release);
        Self {
            primary,
            application: Once::new(),
            core_count: core_count.max(1),
        }
    }

    pub fn primary(&self) -> &Core {
        &self.primary
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Application cores registered so far; empty before the first one.
    pub fn application_cores(&self) -> &[Core] {
        self.application.get().map(|cores| &cores[..]).unwrap_or(&[])
    }

    /// Record an application core discovered during bringup and publish it
    /// in the core table.
    pub fn register_application_core(
        &'static self,
        id: CoreId,
        state: CoreState,
        external: bool,
    ) -> KernelResult<()> {
        if self.core_count < 2 || id as usize >= MAX_CORES {
            return Err(KernelError::InvalidParameters);
        }
        let cores = self.application.call_once(|| {
            let mut cores = Vec::with_capacity(self.core_count - 1);
            cores.resize_with(self.core_count - 1, Core::vacant);
            cores.into_boxed_slice()
        });
        for core in cores.iter() {
            if core.id.load(Ordering::Relaxed) != INVALID_CORE {
                continue;
            }
            core.id.store(id, Ordering::Relaxed);
            core.state.store(state as u32, Ordering::Release);
            core.external.store(external, Ordering::Relaxed);
            publish_core(core);
            return Ok(());
        }
        Err(KernelError::OutOfMemory)
    }
}

// ---------------------------------------------------------------------------
// Core table
// ---------------------------------------------------------------------------

static CORE_TABLE: [AtomicPtr<Core>; MAX_CORES] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CORES];

fn publish_core(core: &'static Core) {
    let id = core.id() as usize;
    if id >= MAX_CORES {
        fatal!("core id {} exceeds the core table", id);
    }
    CORE_TABLE[id].store(core as *const Core as *mut Core, Ordering::Release);
}

/// Register the boot processor: its primary core becomes reachable through
/// the core table.
pub fn initialize_processor(processor: &'static Processor) {
    publish_core(&processor.primary);
}

pub fn core_by_id(id: CoreId) -> Option<&'static Core> {
    if id as usize >= MAX_CORES {
        return None;
    }
    let pointer = CORE_TABLE[id as usize].load(Ordering::Acquire);
    // SAFETY: the table only ever holds pointers to cores inside leaked
    // `Processor` structures, published once during boot and never removed.
    (!pointer.is_null()).then(|| unsafe { &*pointer })
}

/// The core executing this code. The table entry must have been published
/// during bringup.
pub fn current_core() -> &'static Core {
    match core_by_id(arch::core_id()) {
        Some(core) => core,
        None => fatal!("core {} missing from the core table", arch::core_id()),
    }
}

/// Hand an enqueued message to `core`. Called from the architecture's
/// doorbell path.
pub(crate) fn post_to_core(core: CoreId, message: IpiMessage) -> KernelResult<()> {
    let core = core_by_id(core).ok_or(KernelError::NotFound)?;
    core.post_message(message);
    Ok(())
}

/// Entry glue for the IPI vector: drain the executing core's inbox.
pub fn ipi_interrupt_handler() {
    current_core().process_messages();
}

// ---------------------------------------------------------------------------
// Bringup and messaging
// ---------------------------------------------------------------------------

/// Called on an application processor once it reaches kernel code: turn on
/// threading locally, publish the running state, and idle. The primary core
/// of the processor additionally starts its remaining siblings, serially.
pub fn activate_application_core(core: &'static Core) -> ! {
    crate::thread::enable_local();
    machine::machine()
        .active_cores
        .fetch_add(1, Ordering::AcqRel);
    core.state
        .store(CoreState::Running as u32, Ordering::Release);
    arch::interrupt_enable();

    let processor = &machine::machine().processor;
    if core::ptr::eq(core, processor.primary()) {
        for sibling in processor.application_cores() {
            if sibling.state() == CoreState::Unavailable && !sibling.is_external() {
                arch::start_application_core(sibling.id());
            }
        }
    }

    log::info!("core {} is online", core.id());
    loop {
        core.process_messages();
        arch::idle();
    }
}

/// Dispatch `function` to every running core of the current processor,
/// optionally excluding the caller's own core. Returns the number of
/// doorbell sends.
pub fn message_send(
    exclude_self: bool,
    kind: MessageKind,
    function: IpiFunction,
    argument: usize,
) -> usize {
    message_send_from(
        current_core(),
        &machine::machine().processor,
        exclude_self,
        kind,
        function,
        argument,
    )
}

fn message_send_from(
    current: &Core,
    processor: &Processor,
    exclude_self: bool,
    kind: MessageKind,
    function: IpiFunction,
    argument: usize,
) -> usize {
    let message = IpiMessage {
        kind,
        function,
        argument,
    };
    let mut dispatched = 0;

    let primary = processor.primary();
    if (!exclude_self || primary.id() != current.id())
        && primary.state() == CoreState::Running
    {
        if let Err(error) = arch::txu_message_send(primary.id(), message) {
            log::warn!("message to core {} failed: {}", primary.id(), error);
        }
        dispatched += 1;
    }

    for core in processor.application_cores() {
        if (!exclude_self || core.id() != current.id()) && core.state() == CoreState::Running {
            if let Err(error) = arch::txu_message_send(core.id(), message) {
                log::warn!("message to core {} failed: {}", core.id(), error);
            }
            dispatched += 1;
        }
    }
    dispatched
}

/// Discard cached translations everywhere: peers by IPI, locally in place.
pub fn flush_tlb_all() -> usize {
    let dispatched = message_send(true, MessageKind::FlushTlb, |_| arch::reload_tlb(), 0);
    arch::reload_tlb();
    dispatched
}
