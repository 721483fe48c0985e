/*!
Address spaces

A thread names capabilities by address. Translation starts at the
capability in the thread's address space slot and consumes the address
most significant bits first:

1. the guard of the current capability must match the next bits;
2. if the address is exhausted the current capability is the result;
3. otherwise the capability must designate a cappage, indexed by the
   next `subpage_size_log2` bits within its subpage, or a thread,
   indexed by the next two bits, and translation continues with the
   capability in that slot.

A slot lookup stops before step 1 once the address is exhausted and
names the slot instead of what is in it. Passing through a read-only
cappage makes the rest of the walk read-only: slots found are not
writable and capabilities found are weakened.

Walks of thread address spaces are memoized in the translation cache;
see [`crate::shadow`].
*/
use viengoos_abi::{
    addr::Addr,
    cap::{CapCopyFlags, CapProperties, CapType, UserCapability},
    error::{Error, Result},
    thread::{ThreadSlot, THREAD_SLOTS_LOG2},
};

use crate::{
    cap::Capability,
    kernel::{AsLocked, WaitLocked},
    object::{ObjectBody, ObjectRef, Oid},
    shadow::Path,
    Kernel,
};

/// A capability slot: an index into a cappage or a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotLoc {
    CapPage { oid: Oid, version: u64, index: usize },
    Thread { oid: Oid, version: u64, slot: ThreadSlot },
}

impl SlotLoc {
    /// The object holding the slot.
    pub fn container(&self) -> Oid {
        match self {
            SlotLoc::CapPage { oid, .. } | SlotLoc::Thread { oid, .. } => *oid,
        }
    }

    fn version(&self) -> u64 {
        match self {
            SlotLoc::CapPage { version, .. } | SlotLoc::Thread { version, .. } => *version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupMode {
    /// Name the slot the address reaches.
    Slot,
    /// Name the capability the address designates.
    Object,
}

/// Result of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// The capability found, weakened if the path was read-only.
    pub cap: Capability,
    /// The slot it was read from. `None` only for a detached root.
    pub slot: Option<SlotLoc>,
    /// Whether the slot may be written.
    pub writable: bool,
}

/// Where a walk starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Root {
    cap: Capability,
    slot: Option<SlotLoc>,
    /// Thread the walk is cached for.
    cache_key: Option<Oid>,
}

impl Root {
    /// A root held outside of any slot, such as a messenger's address
    /// space root. Walks from it are not cached.
    pub(crate) fn detached(cap: Capability) -> Root {
        Root {
            cap,
            slot: None,
            cache_key: None,
        }
    }

    pub(crate) fn cap(&self) -> Capability {
        self.cap
    }
}

impl Kernel {
    /// The address space root of `thread`.
    pub(crate) fn thread_root(&self, thread: &Capability) -> Result<Root> {
        let (oid, object) = self.thread_object(thread)?;
        let cap = *object.lock().slot(ThreadSlot::Aspace);
        Ok(Root {
            cap,
            slot: Some(SlotLoc::Thread {
                oid,
                version: thread.version,
                slot: ThreadSlot::Aspace,
            }),
            cache_key: Some(oid),
        })
    }

    fn slot_container(&self, slot: &SlotLoc) -> Result<ObjectBody> {
        self.with_meta(slot.container(), |meta| {
            (meta.cap_type != CapType::Void && meta.version == slot.version())
                .then(|| meta.body.clone())
        })
        .flatten()
        .ok_or(Error::NoObject)
    }

    pub(crate) fn slot_read(&self, slot: &SlotLoc) -> Result<Capability> {
        let body = self.slot_container(slot)?;
        match slot {
            SlotLoc::CapPage { index, .. } => Ok(body.as_cap_page()?.lock()[*index]),
            SlotLoc::Thread { slot, .. } => Ok(*body.as_thread()?.lock().slot(*slot)),
        }
    }

    /// Store `cap` in `slot`, shooting down cached walks through the
    /// slot if what they found changes.
    pub(crate) fn slot_write(&self, _locked: &WaitLocked<'_>, slot: &SlotLoc, cap: Capability) -> Result<()> {
        let body = self.slot_container(slot)?;
        let old = self.slot_read(slot)?;
        if old.needs_shootdown(&cap) {
            self.shadow.lock().shootdown_slot(slot);
        }
        match slot {
            SlotLoc::CapPage { index, .. } => body.as_cap_page()?.lock()[*index] = cap,
            SlotLoc::Thread { slot, .. } => body.as_thread()?.lock().slots[slot.index()] = cap,
        }
        trace!("{:?} := {:?}", slot, cap);
        Ok(())
    }

    /// Translate `addr` from `root`.
    pub(crate) fn lookup(
        &self,
        _locked: &impl AsLocked,
        root: &Root,
        addr: Addr,
        mode: LookupMode,
    ) -> Result<Lookup> {
        if let Some(thread) = root.cache_key {
            if let Some(hit) = self.shadow.lock().get(thread, addr, mode) {
                return Ok(hit);
            }
        }
        let mut path = Path::default();
        let found = self.walk(root, addr, mode, &mut path)?;
        if let Some(thread) = root.cache_key {
            self.shadow.lock().insert(thread, addr, mode, found, path);
        }
        Ok(found)
    }

    fn walk(&self, root: &Root, addr: Addr, mode: LookupMode, path: &mut Path) -> Result<Lookup> {
        if addr.is_void() {
            return Err(Error::InvalidArgument);
        }
        let depth = addr.depth();
        let mut consumed = 0;
        let mut cap = root.cap;
        let mut slot = root.slot;
        let mut writable = true;
        path.slots.extend(slot);

        for _ in 0..self.config().max_walk_steps {
            if mode == LookupMode::Slot && consumed == depth {
                let slot = slot.ok_or(Error::InvalidArgument)?;
                return Ok(Lookup {
                    cap,
                    slot: Some(slot),
                    writable,
                });
            }
            if cap.is_void() {
                return Err(Error::NoObject);
            }
            path.objects.push(cap.oid);

            let trans = *cap.addr_trans();
            let guard_bits = trans.guard_bits();
            if guard_bits > depth - consumed || addr.bits_at(consumed, guard_bits) != trans.guard() {
                return Err(Error::NoObject);
            }
            consumed += guard_bits;

            if consumed == depth {
                return match mode {
                    LookupMode::Object => Ok(Lookup {
                        cap,
                        slot,
                        writable,
                    }),
                    LookupMode::Slot => Err(Error::NoObject),
                };
            }

            let object: ObjectRef = self.resolve(&cap).ok_or(Error::NoObject)?;
            let remaining = depth - consumed;
            let (next, width) = match object.body {
                ObjectBody::CapPage(_) => {
                    let width = trans.subpage_size_log2();
                    if width > remaining {
                        return Err(Error::NoObject);
                    }
                    if cap.cap_type == CapType::ReadOnlyCapPage {
                        writable = false;
                    }
                    let index = trans.subpage_offset() as usize
                        + addr.bits_at(consumed, width) as usize;
                    let next = SlotLoc::CapPage {
                        oid: object.oid,
                        version: object.version,
                        index,
                    };
                    (next, width)
                }
                ObjectBody::Thread(_) => {
                    let width = THREAD_SLOTS_LOG2;
                    if width > remaining {
                        return Err(Error::NoObject);
                    }
                    let which = ThreadSlot::from_index(addr.bits_at(consumed, width) as usize)
                        .ok_or(Error::NoObject)?;
                    let next = SlotLoc::Thread {
                        oid: object.oid,
                        version: object.version,
                        slot: which,
                    };
                    (next, width)
                }
                _ => return Err(Error::NoObject),
            };

            consumed += width;
            cap = self.slot_read(&next)?;
            if !writable {
                cap = cap.weakened();
            }
            slot = Some(next);
            path.slots.push(next);
        }
        debug!("walk of {} gave up after {} steps", addr, self.config().max_walk_steps);
        Err(Error::NoObject)
    }

    /// The capability `addr` designates.
    pub(crate) fn lookup_cap(&self, locked: &impl AsLocked, root: &Root, addr: Addr) -> Result<Capability> {
        Ok(self.lookup(locked, root, addr, LookupMode::Object)?.cap)
    }

    /// The live object `addr` designates, type checked with `accept`.
    pub(crate) fn lookup_object(
        &self,
        locked: &impl AsLocked,
        root: &Root,
        addr: Addr,
        accept: impl Fn(CapType) -> bool,
    ) -> Result<(Capability, ObjectRef)> {
        let cap = self.lookup_cap(locked, root, addr)?;
        let object = self.object(&cap, accept)?;
        Ok((cap, object))
    }

    /// Store `cap` in the slot `addr` names.
    pub(crate) fn store_cap(&self, locked: &WaitLocked<'_>, root: &Root, addr: Addr, cap: Capability) -> Result<()> {
        let target = self.lookup(locked, root, addr, LookupMode::Slot)?;
        if !target.writable {
            return Err(Error::PermissionDenied);
        }
        let slot = target.slot.ok_or(Error::InvalidArgument)?;
        self.slot_write(locked, &slot, cap)
    }

    /// The capability `addr` designates in the address space of
    /// `thread`.
    pub fn cap_lookup(&self, thread: &Capability, addr: Addr) -> Result<Capability> {
        let locked = self.lock_read();
        let root = self.thread_root(thread)?;
        self.lookup_cap(&locked, &root, addr)
    }

    /// Copy the capability in slot `source` into slot `target`, both in
    /// the address space of `thread`.
    pub fn cap_copy(
        &self,
        thread: &Capability,
        target: Addr,
        source: Addr,
        flags: CapCopyFlags,
        properties: &CapProperties,
    ) -> Result<()> {
        let locked = self.lock();
        let root = self.thread_root(thread)?;
        self.cap_copy_locked(&locked, &root, target, source, flags, properties)
    }

    pub(crate) fn cap_copy_locked(
        &self,
        locked: &WaitLocked<'_>,
        root: &Root,
        target: Addr,
        source: Addr,
        flags: CapCopyFlags,
        properties: &CapProperties,
    ) -> Result<()> {
        let target = self.lookup(locked, root, target, LookupMode::Slot)?;
        if !target.writable {
            return Err(Error::PermissionDenied);
        }
        let source = self.lookup(locked, root, source, LookupMode::Slot)?.cap;
        if !self.is_live(&source) {
            return Err(Error::NoObject);
        }
        let (new, _) = Capability::copy_from(&target.cap, &source, flags, properties)?;
        let slot = target.slot.ok_or(Error::InvalidArgument)?;
        self.slot_write(locked, &slot, new)
    }

    /// The user view of the capability in slot `addr`. A dead
    /// capability reads as void.
    pub fn cap_read(&self, thread: &Capability, addr: Addr) -> Result<UserCapability> {
        let locked = self.lock_read();
        let root = self.thread_root(thread)?;
        self.cap_read_locked(&locked, &root, addr)
    }

    pub(crate) fn cap_read_locked(&self, locked: &impl AsLocked, root: &Root, addr: Addr) -> Result<UserCapability> {
        let cap = self.lookup(locked, root, addr, LookupMode::Slot)?.cap;
        if self.is_live(&cap) {
            Ok(cap.to_user())
        } else {
            Ok(UserCapability::VOID)
        }
    }

    /// Translation cache statistics: entries, hits and entries shot
    /// down.
    pub fn shadow_stats(&self) -> (usize, u64, u64) {
        let shadow = self.shadow.lock();
        (shadow.len(), shadow.hits(), shadow.shot_down())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BootInfo, KernelConfig};
    use viengoos_abi::{addr_trans::CapAddrTrans, cap::ObjectPolicy, folio::FolioPolicy};

    fn boot() -> (Kernel, BootInfo) {
        Kernel::bootstrap(KernelConfig::default()).unwrap()
    }

    fn slot(index: u64) -> Addr {
        Addr::from_bits(index, 8)
    }

    #[test]
    fn test_lookup_root_slots() {
        let (kernel, boot) = boot();
        assert_eq!(Ok(boot.thread), kernel.cap_lookup(&boot.thread, slot(2)));
        assert_eq!(Err(Error::NoObject), kernel.cap_lookup(&boot.thread, slot(200)));
        assert_eq!(
            Err(Error::InvalidArgument),
            kernel.cap_lookup(&boot.thread, Addr::VOID)
        );
        // The root itself, at depth zero.
        assert_eq!(Ok(boot.aspace), kernel.cap_lookup(&boot.thread, Addr::VOID_ROOT));
    }

    #[test]
    fn test_walk_through_thread_slots() {
        let (kernel, boot) = boot();
        // Slot 2 holds the thread; its slot 1 holds the activity.
        let addr = slot(2).extend(ThreadSlot::Activity.index() as u64, THREAD_SLOTS_LOG2);
        assert_eq!(Ok(boot.activity), kernel.cap_lookup(&boot.thread, addr));
    }

    #[test]
    fn test_guarded_cappage() {
        let (kernel, boot) = boot();
        let folio = kernel.folio_alloc(&boot.activity, FolioPolicy::default()).unwrap();
        let (cappage, _) = kernel
            .folio_object_alloc(&folio, 0, CapType::CapPage, ObjectPolicy::default(), 0)
            .unwrap();
        let (page, _) = kernel
            .folio_object_alloc(&folio, 1, CapType::Page, ObjectPolicy::default(), 0)
            .unwrap();
        {
            let locked = kernel.lock();
            let root = kernel.thread_root(&boot.thread).unwrap();
            // Root slot 10 holds the cappage behind a 4 bit guard 0b1010.
            let guarded = Capability {
                properties: CapProperties::new(
                    ObjectPolicy::default(),
                    CapAddrTrans::new(0b1010, 4, 0, 1).unwrap(),
                ),
                ..cappage
            };
            kernel.store_cap(&locked, &root, slot(10), guarded).unwrap();
            let inner = Root::detached(cappage);
            kernel.store_cap(&locked, &inner, slot(5), page).unwrap();
        }

        let addr = slot(10).extend(0b1010, 4).extend(5, 8);
        assert_eq!(Ok(page), kernel.cap_lookup(&boot.thread, addr));
        let wrong_guard = slot(10).extend(0b1011, 4).extend(5, 8);
        assert_eq!(Err(Error::NoObject), kernel.cap_lookup(&boot.thread, wrong_guard));
    }

    #[test]
    fn test_walk_limit() {
        let config = KernelConfig {
            max_walk_steps: 1,
            ..Default::default()
        };
        let (kernel, boot) = Kernel::bootstrap(config).unwrap();
        assert_eq!(Err(Error::NoObject), kernel.cap_lookup(&boot.thread, slot(2)));
    }

    #[test]
    fn test_cap_read_reports_dead_as_void() {
        let (kernel, boot) = boot();
        let folio = kernel.folio_alloc(&boot.activity, FolioPolicy::default()).unwrap();
        let (page, _) = kernel
            .folio_object_alloc(&folio, 0, CapType::Page, ObjectPolicy::new(true, 3), 0)
            .unwrap();
        {
            let locked = kernel.lock();
            let root = kernel.thread_root(&boot.thread).unwrap();
            kernel.store_cap(&locked, &root, slot(20), page).unwrap();
        }
        let user = kernel.cap_read(&boot.thread, slot(20)).unwrap();
        assert_eq!(CapType::Page, user.cap_type);
        assert_eq!(ObjectPolicy::new(true, 3), user.properties.policy);

        kernel.folio_free(&folio, 0).unwrap();
        assert_eq!(Ok(UserCapability::VOID), kernel.cap_read(&boot.thread, slot(20)));
    }

    #[test]
    fn test_cap_copy_needs_live_source() {
        let (kernel, boot) = boot();
        assert_eq!(
            Err(Error::NoObject),
            kernel.cap_copy(
                &boot.thread,
                slot(30),
                slot(31),
                CapCopyFlags::empty(),
                &CapProperties::default()
            )
        );
        kernel
            .cap_copy(
                &boot.thread,
                slot(30),
                slot(4),
                CapCopyFlags::empty(),
                &CapProperties::default(),
            )
            .unwrap();
        assert_eq!(Ok(boot.messenger), kernel.cap_lookup(&boot.thread, slot(30)));
    }
}
