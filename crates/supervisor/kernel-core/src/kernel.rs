/*!
The kernel instance

A [`Kernel`] owns the folio arena, the translation cache and the two
global locks. Every public operation takes the locks it needs and passes
a guard token down, so internal functions can demand proof that the
right lock is held:

* [`WaitLocked`]: the wait lock and the address space write lock. Held
  by everything that mutates slots, wait queues or object lifetimes.
* [`AsReadLocked`]: the address space read lock. Enough for walks and
  slot reads.

Both implement [`AsLocked`]. Lock order is wait lock, address space
lock, folio arena, folio, object content. The translation cache lock is
a leaf and is never held while taking another lock.
*/
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use viengoos_abi::{
    activity::ActivityPolicy,
    bootstrap,
    cap::{CapType, ObjectPolicy},
    error::{Error, Result},
    folio::FolioPolicy,
    thread::ThreadSlot,
};

use crate::{
    activity::Activity,
    aspace::SlotLoc,
    cap::Capability,
    folio::FolioStore,
    messenger::Messenger,
    object::{ObjectBody, ObjectMeta, ObjectRef, Oid},
    shadow::ShadowCache,
    thread::{Thread, ThreadState},
    wait_queue::WaitHead,
};

/// Boot configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// System wide limit on live folios.
    pub max_folios: usize,
    /// Folio quota of the root activity. Zero means unlimited.
    pub root_quota: u32,
    /// Capacity of the translation cache. Zero disables it.
    pub shadow_cache_entries: usize,
    /// Translation steps after which a walk gives up.
    pub max_walk_steps: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_folios: 1024,
            root_quota: 0,
            shadow_cache_entries: 256,
            max_walk_steps: 128,
        }
    }
}

/// What bootstrap built: the root objects, and where they sit in the
/// root cappage.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub folio: Capability,
    pub activity: Capability,
    pub thread: Capability,
    pub aspace: Capability,
    pub messenger: Capability,
    /// The same, as the first thread sees it.
    pub user: bootstrap::BootInfo,
}

/// Root folio slot of each root object.
const ROOT_ACTIVITY: usize = 0;
const ROOT_THREAD: usize = 1;
const ROOT_ASPACE: usize = 2;
const ROOT_MESSENGER: usize = 3;

/// Proof that the wait lock and the address space write lock are held.
pub struct WaitLocked<'a> {
    _wait: MutexGuard<'a, ()>,
    _aspace: RwLockWriteGuard<'a, ()>,
}

/// Proof that the address space read lock is held.
pub struct AsReadLocked<'a> {
    _aspace: RwLockReadGuard<'a, ()>,
}

/// Proof that the address space is locked at least for reading.
pub trait AsLocked {}

impl AsLocked for WaitLocked<'_> {}
impl AsLocked for AsReadLocked<'_> {}

#[derive(Getters)]
pub struct Kernel {
    #[getset(get = "pub")]
    config: KernelConfig,
    pub(crate) folios: FolioStore,
    pub(crate) shadow: Mutex<ShadowCache>,
    wait_lock: Mutex<()>,
    aspace_lock: RwLock<()>,
    next_thread_id: AtomicU64,
}

impl Kernel {
    fn new(config: KernelConfig) -> Kernel {
        Kernel {
            config,
            folios: FolioStore::new(),
            shadow: Mutex::new(ShadowCache::new(config.shadow_cache_entries)),
            wait_lock: Mutex::new(()),
            aspace_lock: RwLock::new(()),
            next_thread_id: AtomicU64::new(1),
        }
    }

    /// Build a kernel and its root objects.
    ///
    /// The root folio holds the root activity, the first thread, its
    /// address space root and a messenger bound to it. The first thread
    /// finds all of them, and the folio, in its root cappage.
    pub fn bootstrap(config: KernelConfig) -> Result<(Kernel, BootInfo)> {
        let kernel = Kernel::new(config);
        let info = {
            let locked = kernel.lock();
            kernel.boot(&locked)?
        };
        info!(
            "bootstrapped: root folio {}, activity {}, thread {}",
            info.folio.oid, info.activity.oid, info.thread.oid
        );
        Ok((kernel, info))
    }

    fn boot(&self, locked: &WaitLocked<'_>) -> Result<BootInfo> {
        let folio = self.folio_create(locked, FolioPolicy::default())?;
        let folio_index = folio.oid.folio_index();

        let policy = ActivityPolicy {
            folios: self.config.root_quota,
            ..Default::default()
        };
        let activity = self.object_install(
            locked,
            Oid::object(folio_index, ROOT_ACTIVITY),
            CapType::ActivityControl,
            ObjectBody::Activity(Arc::new(Mutex::new(Activity::new(None, policy)))),
            ObjectPolicy::default(),
        )?;
        self.folio_adopt(locked, folio_index, activity.oid)?;

        let (thread, _) = self.folio_object_alloc_locked(
            locked,
            &folio,
            ROOT_THREAD,
            CapType::Thread,
            ObjectPolicy::default(),
            0,
        )?;
        let (aspace, _) = self.folio_object_alloc_locked(
            locked,
            &folio,
            ROOT_ASPACE,
            CapType::CapPage,
            ObjectPolicy::default(),
            0,
        )?;
        let (messenger, _) = self.folio_object_alloc_locked(
            locked,
            &folio,
            ROOT_MESSENGER,
            CapType::Messenger,
            ObjectPolicy::default(),
            0,
        )?;

        let root_slots = [folio, activity, thread, aspace, messenger];
        for (index, cap) in root_slots.iter().enumerate() {
            let slot = SlotLoc::CapPage {
                oid: aspace.oid,
                version: aspace.version,
                index,
            };
            self.slot_write(locked, &slot, *cap)?;
        }
        for (slot, cap) in [(ThreadSlot::Aspace, aspace), (ThreadSlot::Activity, activity)] {
            let slot = SlotLoc::Thread {
                oid: thread.oid,
                version: thread.version,
                slot,
            };
            self.slot_write(locked, &slot, cap)?;
        }

        let (_, messenger_obj) = self.messenger_object(&messenger)?;
        messenger_obj.lock().bind(thread, aspace);
        let (_, thread_obj) = self.thread_object(&thread)?;
        thread_obj.lock().set_state(ThreadState::Running);

        let addr = |index: usize| bootstrap::BootInfo::slot(index as u32);
        Ok(BootInfo {
            folio,
            activity,
            thread,
            aspace,
            messenger,
            user: bootstrap::BootInfo {
                folio: addr(0),
                activity: addr(1),
                thread: addr(2),
                aspace: addr(3),
                messenger: addr(4),
                first_free_slot: root_slots.len() as u32,
            },
        })
    }

    /// Take the wait lock and the address space write lock.
    pub(crate) fn lock(&self) -> WaitLocked<'_> {
        let wait = self.wait_lock.lock();
        let aspace = self.aspace_lock.write();
        WaitLocked {
            _wait: wait,
            _aspace: aspace,
        }
    }

    /// Take the address space read lock.
    pub(crate) fn lock_read(&self) -> AsReadLocked<'_> {
        AsReadLocked {
            _aspace: self.aspace_lock.read(),
        }
    }

    pub(crate) fn alloc_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` on the metadata of object `oid`, whatever its version.
    /// `None` for a folio oid or one beyond the arena.
    pub(crate) fn with_meta<R>(&self, oid: Oid, f: impl FnOnce(&mut ObjectMeta) -> R) -> Option<R> {
        let index = oid.object_index()?;
        let folio = self.folios.get(oid.folio_index())?;
        let mut folio = folio.lock();
        Some(f(&mut folio.objects[index]))
    }

    pub(crate) fn with_wait_head<R>(&self, oid: Oid, f: impl FnOnce(&mut WaitHead) -> R) -> Option<R> {
        let folio = self.folios.get(oid.folio_index())?;
        let mut folio = folio.lock();
        Some(f(folio.wait_head_mut(oid)))
    }

    /// Content of the object `oid`, whatever its version, if an object
    /// occupies the slot. Used to follow internal references, which are
    /// kept coherent by destruction and therefore carry no version.
    pub(crate) fn body_by_oid(&self, oid: Oid) -> Option<ObjectBody> {
        self.with_meta(oid, |meta| match meta.cap_type {
            CapType::Void => None,
            _ => Some(meta.body.clone()),
        })
        .flatten()
    }

    pub(crate) fn messenger_by_oid(&self, oid: Oid) -> Option<Arc<Mutex<Messenger>>> {
        self.body_by_oid(oid)?.as_messenger().ok().cloned()
    }

    pub(crate) fn activity_by_oid(&self, oid: Oid) -> Option<Arc<Mutex<Activity>>> {
        self.body_by_oid(oid)?.as_activity().ok().cloned()
    }

    pub(crate) fn thread_by_oid(&self, oid: Oid) -> Option<Arc<Mutex<Thread>>> {
        self.body_by_oid(oid)?.as_thread().ok().cloned()
    }

    /// The object `cap` designates, if the capability is live.
    pub(crate) fn resolve(&self, cap: &Capability) -> Option<ObjectRef> {
        if cap.is_void() {
            return None;
        }
        let folio = self.folios.get(cap.oid.folio_index())?;
        let folio = folio.lock();
        match cap.oid.object_index() {
            None => (folio.live
                && folio.version == cap.version
                && cap.cap_type == CapType::Folio)
                .then(|| ObjectRef {
                    oid: cap.oid,
                    version: cap.version,
                    cap_type: CapType::Folio,
                    body: ObjectBody::Folio,
                }),
            Some(index) => {
                let meta = &folio.objects[index];
                (meta.cap_type != CapType::Void
                    && meta.version == cap.version
                    && CapType::compatible(meta.cap_type, cap.cap_type))
                .then(|| ObjectRef {
                    oid: cap.oid,
                    version: cap.version,
                    cap_type: cap.cap_type,
                    body: meta.body.clone(),
                })
            }
        }
    }

    /// Resolve `cap` and check its type: `NoObject` if it is dead,
    /// `WrongType` if `accept` refuses it.
    pub(crate) fn object(
        &self,
        cap: &Capability,
        accept: impl Fn(CapType) -> bool,
    ) -> Result<ObjectRef> {
        let object = self.resolve(cap).ok_or(Error::NoObject)?;
        if !accept(object.cap_type) {
            return Err(Error::WrongType);
        }
        Ok(object)
    }

    pub(crate) fn thread_object(&self, cap: &Capability) -> Result<(Oid, Arc<Mutex<Thread>>)> {
        let object = self.object(cap, |t| t == CapType::Thread)?;
        Ok((object.oid, object.body.as_thread()?.clone()))
    }

    pub(crate) fn messenger_object(
        &self,
        cap: &Capability,
    ) -> Result<(Oid, Arc<Mutex<Messenger>>)> {
        let object = self.object(cap, |t| t == CapType::Messenger)?;
        Ok((object.oid, object.body.as_messenger()?.clone()))
    }

    pub(crate) fn activity_object(
        &self,
        cap: &Capability,
    ) -> Result<(ObjectRef, Arc<Mutex<Activity>>)> {
        let object = self.object(cap, CapType::is_activity)?;
        let activity = object.body.as_activity()?.clone();
        Ok((object, activity))
    }

    /// Whether `cap` designates a live object.
    pub fn is_live(&self, cap: &Capability) -> bool {
        self.resolve(cap).is_some()
    }

    /// Number of live folios.
    pub fn live_folios(&self) -> usize {
        self.folios.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(1024, config.max_folios);
        assert_eq!(0, config.root_quota);
        assert_eq!(128, config.max_walk_steps);
    }

    #[test]
    fn test_bootstrap_layout() {
        let (kernel, boot) = Kernel::bootstrap(KernelConfig::default()).unwrap();
        assert_eq!(1, kernel.live_folios());
        for cap in [boot.folio, boot.activity, boot.thread, boot.aspace, boot.messenger] {
            assert!(kernel.is_live(&cap), "{:?} is dead", cap);
        }
        assert_eq!(CapType::ActivityControl, boot.activity.cap_type);
        assert_eq!(Oid::object(0, ROOT_THREAD), boot.thread.oid);
        assert_eq!(5, boot.user.first_free_slot);

        // Every root object is reachable from the first thread.
        let found = kernel.cap_lookup(&boot.thread, boot.user.messenger).unwrap();
        assert_eq!(boot.messenger, found);
        let found = kernel.cap_lookup(&boot.thread, boot.user.folio).unwrap();
        assert_eq!(boot.folio, found);
    }

    #[test]
    fn test_bootstrap_needs_a_folio() {
        let config = KernelConfig {
            max_folios: 0,
            ..Default::default()
        };
        assert_eq!(Some(Error::OutOfResources), Kernel::bootstrap(config).err());
    }

    #[test]
    fn test_resolve_rejects_incompatible_types() {
        let (kernel, boot) = Kernel::bootstrap(KernelConfig::default()).unwrap();
        let wrong = Capability {
            cap_type: CapType::Page,
            ..boot.messenger
        };
        assert!(kernel.resolve(&wrong).is_none());
        let weak = boot.activity.weakened();
        assert_eq!(CapType::Activity, kernel.resolve(&weak).unwrap().cap_type);
        assert_eq!(
            Some(Error::WrongType),
            kernel.thread_object(&boot.messenger).err()
        );
    }
}
