//! System-wide resource handles
//!
//! A handle is a small integer naming a typed, reference-counted resource.
//! Lookups and the final release are serialized by the registry lock, so a
//! handle that reaches zero references becomes unlookable in the same
//! critical region that observed the decrement; nothing can resurrect it.
//! Actual destruction is deferred to the janitor, which runs destructors on
//! its own stack: releasers may hold locks a destructor would need.

pub mod event;
pub mod set;


use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{any::Any, sync::atomic::{AtomicU32, Ordering}};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sync::{RefCount, Semaphore},
};

use self::set::SetElement;

/// System-wide handle identifier
pub type HandleId = u32;

/// Resource variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Generic,
    File,
    Socket,
    Pipe,
    MemorySpace,
    Event,
    Timer,
    Set,
}

/// The resource a handle refers to; jointly owned by the registry and every
/// acquirer that still holds a clone
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Runs in the janitor when the last reference drops. Must not fail; it
/// logs and continues on subsidiary errors.
pub type Destructor = fn(&Resource);

pub(crate) struct HandleEntry {
    id: HandleId,
    kind: HandleType,
    resource: Resource,
    destructor: Option<Destructor>,
    pub(crate) references: RefCount,
    path: Mutex<Option<String>>,
    /// Set elements observing this handle. Borrowed links: each element is
    /// owned by its set and drops out of here when removed from the set.
    pub(crate) observers: Mutex<Vec<Weak<SetElement>>>,
}

pub struct HandleRegistry {
    handles: Mutex<BTreeMap<HandleId, Arc<HandleEntry>>>,
    paths: Mutex<BTreeMap<String, HandleId>>,
    clean_queue: Mutex<VecDeque<Arc<HandleEntry>>>,
    janitor_signal: Semaphore,
    id_generator: AtomicU32,
}

/// The one registry; all handles are system-wide.
static REGISTRY: HandleRegistry = HandleRegistry::new();

pub fn registry() -> &'static HandleRegistry {
    &REGISTRY
}

impl HandleRegistry {
    pub const fn new() -> Self {
        Self {
            handles: Mutex::new(BTreeMap::new()),
            paths: Mutex::new(BTreeMap::new()),
            clean_queue: Mutex::new(VecDeque::new()),
            janitor_signal: Semaphore::new(0),
            id_generator: AtomicU32::new(1),
        }
    }

    /// Register a resource and return its fresh handle id. The caller holds
    /// the initial reference.
    pub fn create(
        &self,
        kind: HandleType,
        destructor: Option<Destructor>,
        resource: Resource,
    ) -> HandleId {
        let id = self.id_generator.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(HandleEntry {
            id,
            kind,
            resource,
            destructor,
            references: RefCount::new(1),
            path: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        });
        self.handles.lock().insert(id, entry);
        log::trace!("created handle {} ({:?})", id, kind);
        id
    }

    /// The resource behind `id`, if the handle is still live. A record
    /// observed mid-destruction reads as not found.
    pub fn lookup(&self, id: HandleId) -> Option<Resource> {
        let handles = self.handles.lock();
        let entry = handles.get(&id)?;
        entry.references.live().then(|| entry.resource.clone())
    }

    /// Like [`lookup`](Self::lookup), but also checks the type tag.
    pub fn lookup_typed(&self, id: HandleId, kind: HandleType) -> Option<Resource> {
        let handles = self.handles.lock();
        let entry = handles.get(&id)?;
        (entry.kind == kind && entry.references.live()).then(|| entry.resource.clone())
    }

    /// Take an additional reference, unless the handle is already on its
    /// way to the janitor.
    pub fn acquire(&self, id: HandleId) -> Option<Resource> {
        Some(self.acquire_entry(id)?.resource.clone())
    }

    pub(crate) fn acquire_entry(&self, id: HandleId) -> Option<Arc<HandleEntry>> {
        let handles = self.handles.lock();
        let entry = handles.get(&id)?;
        if !entry.references.try_acquire() {
            log::warn!("handle {} acquired during teardown", id);
            return None;
        }
        Some(Arc::clone(entry))
    }

    pub(crate) fn entry(&self, id: HandleId) -> Option<Arc<HandleEntry>> {
        self.handles.lock().get(&id).cloned()
    }

    /// Drop one reference. The 1 -> 0 transition unregisters the handle and
    /// its path inside the registry critical region, then hands the record
    /// to the janitor.
    pub fn destroy(&self, id: HandleId) -> KernelResult<()> {
        let dropped = {
            let mut handles = self.handles.lock();
            let entry = handles.get(&id).ok_or(KernelError::NotFound)?;
            if !entry.references.live() {
                return Err(KernelError::NotFound);
            }
            let entry = Arc::clone(entry);
            if !entry.references.release() {
                false
            } else {
                handles.remove(&id);
                if let Some(path) = entry.path.lock().as_ref() {
                    self.paths.lock().remove(path);
                }
                self.clean_queue.lock().push_back(entry);
                true
            }
        };
        if dropped {
            log::trace!("handle {} queued for cleanup", id);
            self.janitor_signal.signal(1);
        }
        Ok(())
    }

    /// Additionally index the handle by a path string.
    pub fn register_path(&self, id: HandleId, path: &str) -> KernelResult<()> {
        if path.is_empty() {
            return Err(KernelError::InvalidParameters);
        }
        let handles = self.handles.lock();
        let entry = handles.get(&id).ok_or(KernelError::NotFound)?;
        if !entry.references.live() {
            return Err(KernelError::NotFound);
        }
        let mut entry_path = entry.path.lock();
        let mut paths = self.paths.lock();
        if entry_path.is_some() || paths.contains_key(path) {
            return Err(KernelError::Exists);
        }
        *entry_path = Some(String::from(path));
        paths.insert(String::from(path), id);
        Ok(())
    }

    pub fn lookup_by_path(&self, path: &str) -> KernelResult<HandleId> {
        self.paths
            .lock()
            .get(path)
            .copied()
            .ok_or(KernelError::NotFound)
    }

    /// Run every queued destructor. Returns how many records were reclaimed.
    ///
    /// Normally driven by [`janitor_main`]; tests call it directly.
    pub fn drain_clean_queue(&self) -> usize {
        let mut reclaimed = 0;
        loop {
            let entry = self.clean_queue.lock().pop_front();
            let Some(entry) = entry else {
                break;
            };
            if let Some(destructor) = entry.destructor {
                destructor(&entry.resource);
            }
            // The path key and the observer list go down with the entry.
            log::trace!("reclaimed handle {}", entry.id);
            reclaimed += 1;
        }
        reclaimed
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the janitor thread: sleep on the signal, drain, repeat.
pub fn janitor_main() -> ! {
    loop {
        let _ = REGISTRY.janitor_signal.wait(None);
        let reclaimed = REGISTRY.drain_clean_queue();
        if reclaimed > 0 {
            log::trace!("janitor reclaimed {} handles", reclaimed);
        }
    }
}

/// Spawn the janitor once threading is available.
pub fn initialize_janitor() {
    crate::thread::spawn_kernel("hjanitor", janitor_main);
}
