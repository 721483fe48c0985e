/*!
Folios and the folio arena

A folio is the unit of storage allocation: a header of per object
metadata followed by [`FOLIO_OBJECTS`] object pages. It is charged to
the activity that allocated it and sits on that activity's folio list
until it is freed.

Folio headers live in an arena indexed by the folio's position; a freed
folio is kept in the arena, not live, and is the first candidate for
reuse. Its version and the versions of its objects survive the reuse, so
capabilities from a previous life never resolve again.
*/
use alloc::{sync::Arc, vec::Vec};

use spin::{Mutex, RwLock};
use viengoos_abi::{
    cap::{CapType, ObjectPolicy},
    error::{Error, Result},
    folio::{FolioPolicy, FolioPolicyFlags, FOLIO_OBJECTS},
};

use crate::{
    activity::Activity,
    cap::Capability,
    kernel::WaitLocked,
    messenger::Messenger,
    object::{new_cap_slots, MetaFlags, ObjectBody, ObjectMeta, Oid, PageObject},
    thread::Thread,
    wait_queue::WaitHead,
    Kernel,
};

/// A folio header.
#[derive(Debug, CopyGetters)]
pub struct Folio {
    #[getset(get_copy = "pub")]
    pub(crate) live: bool,
    /// Bumped when the folio is freed.
    #[getset(get_copy = "pub")]
    pub(crate) version: u64,
    /// The activity charged for this folio.
    #[getset(get_copy = "pub")]
    pub(crate) owner: Oid,
    #[getset(get_copy = "pub")]
    pub(crate) policy: FolioPolicy,
    /// Links in the owner's folio list, by arena index.
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    /// Wait queue of the folio itself.
    pub(crate) wait: WaitHead,
    pub(crate) objects: Vec<ObjectMeta>,
}

impl Folio {
    fn new() -> Folio {
        Folio {
            live: false,
            version: 0,
            owner: Oid::default(),
            policy: FolioPolicy::default(),
            prev: None,
            next: None,
            wait: WaitHead::default(),
            objects: (0..FOLIO_OBJECTS).map(|_| ObjectMeta::default()).collect(),
        }
    }

    /// Metadata of object `index`.
    pub fn object(&self, index: usize) -> &ObjectMeta {
        &self.objects[index]
    }

    /// The wait queue anchor of `oid`, which is this folio or one of its
    /// objects.
    pub(crate) fn wait_head_mut(&mut self, oid: Oid) -> &mut WaitHead {
        match oid.object_index() {
            Some(index) => &mut self.objects[index].wait,
            None => &mut self.wait,
        }
    }
}

/// The folio arena.
pub struct FolioStore {
    folios: RwLock<Vec<Arc<Mutex<Folio>>>>,
}

impl FolioStore {
    pub fn new() -> FolioStore {
        FolioStore {
            folios: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, index: usize) -> Option<Arc<Mutex<Folio>>> {
        self.folios.read().get(index).cloned()
    }

    /// Mark a folio live and return its index: a free one if there is
    /// one, a new one while the arena holds fewer than `limit`.
    pub fn claim(&self, limit: usize) -> Result<usize> {
        let mut folios = self.folios.write();
        for (index, folio) in folios.iter().enumerate() {
            let mut folio = folio.lock();
            if !folio.live {
                folio.live = true;
                return Ok(index);
            }
        }
        if folios.len() >= limit {
            return Err(Error::OutOfResources);
        }
        let mut folio = Folio::new();
        folio.live = true;
        folios.push(Arc::new(Mutex::new(folio)));
        Ok(folios.len() - 1)
    }

    pub fn live_count(&self) -> usize {
        self.folios
            .read()
            .iter()
            .filter(|folio| folio.lock().live)
            .count()
    }

    pub fn len(&self) -> usize {
        self.folios.read().len()
    }
}

impl Default for FolioStore {
    fn default() -> Self {
        FolioStore::new()
    }
}

impl Kernel {
    pub fn folio_alloc(&self, activity: &Capability, policy: FolioPolicy) -> Result<Capability> {
        let locked = self.lock();
        self.folio_alloc_locked(&locked, activity, policy)
    }

    /// Allocate a folio charged to `activity` and all of its ancestors.
    pub(crate) fn folio_alloc_locked(
        &self,
        locked: &WaitLocked<'_>,
        activity: &Capability,
        policy: FolioPolicy,
    ) -> Result<Capability> {
        let (activity, _) = self.activity_object(activity)?;
        self.quota_check(activity.oid)?;
        let folio = self.folio_create(locked, policy)?;
        self.folio_adopt(locked, folio.oid.folio_index(), activity.oid)?;
        debug!("folio {} allocated to {}", folio.oid, activity.oid);
        Ok(folio)
    }

    /// Claim an unowned folio.
    pub(crate) fn folio_create(
        &self,
        _locked: &WaitLocked<'_>,
        policy: FolioPolicy,
    ) -> Result<Capability> {
        let index = self.folios.claim(self.config().max_folios)?;
        let folio = self.folios.get(index).ok_or(Error::NoObject)?;
        let mut folio = folio.lock();
        folio.policy = policy;
        folio.prev = None;
        folio.next = None;
        Ok(Capability::new(
            CapType::Folio,
            Oid::folio(index),
            folio.version,
            ObjectPolicy::default(),
        ))
    }

    /// Make `owner` the owner of folio `index`: link it into the owner's
    /// folio list and charge the owner chain.
    pub(crate) fn folio_adopt(&self, _locked: &WaitLocked<'_>, index: usize, owner: Oid) -> Result<()> {
        let activity = self.activity_by_oid(owner).ok_or(Error::NoObject)?;
        let old_head = activity.lock().folios.replace(index);

        let folio = self.folios.get(index).ok_or(Error::NoObject)?;
        {
            let mut folio = folio.lock();
            folio.owner = owner;
            folio.prev = None;
            folio.next = old_head;
        }
        if let Some(head) = old_head.and_then(|head| self.folios.get(head)) {
            head.lock().prev = Some(index);
        }
        self.charge(owner, 1);
        Ok(())
    }

    /// Free `folio`. Everything waiting on it or on one of its objects
    /// is woken with `return_code`.
    pub fn folio_free(&self, folio: &Capability, return_code: u64) -> Result<()> {
        let locked = self.lock();
        self.folio_free_locked(&locked, folio, return_code)
    }

    pub(crate) fn folio_free_locked(
        &self,
        locked: &WaitLocked<'_>,
        folio: &Capability,
        return_code: u64,
    ) -> Result<()> {
        let folio = self.object(folio, |t| t == CapType::Folio)?;
        self.folio_release(locked, folio.oid.folio_index(), return_code);
        Ok(())
    }

    /// Destroy every object of folio `index`, wake the folio's waiters,
    /// retire the folio and uncharge its owner.
    pub(crate) fn folio_release(&self, locked: &WaitLocked<'_>, index: usize, return_code: u64) {
        let folio = match self.folios.get(index) {
            Some(folio) => folio,
            None => return,
        };
        if !folio.lock().live {
            return;
        }

        for object in 0..FOLIO_OBJECTS {
            self.destroy_object(locked, Oid::object(index, object), return_code);
        }
        self.wake_all(locked, Oid::folio(index), return_code);

        // Destroying the owner activity, which may live in this very
        // folio, frees the folio on the way.
        let (owner, prev, next) = {
            let mut folio = folio.lock();
            if !folio.live {
                return;
            }
            folio.live = false;
            folio.version += 1;
            (folio.owner, folio.prev.take(), folio.next.take())
        };
        self.shadow.lock().shootdown_object(Oid::folio(index));

        match prev.and_then(|prev| self.folios.get(prev)) {
            Some(prev) => prev.lock().next = next,
            None => {
                if let Some(activity) = self.activity_by_oid(owner) {
                    activity.lock().folios = next;
                }
            }
        }
        if let Some(next) = next.and_then(|next| self.folios.get(next)) {
            next.lock().prev = prev;
        }
        self.uncharge(owner, 1);
        debug!("folio {} freed", Oid::folio(index));
    }

    pub fn folio_object_alloc(
        &self,
        folio: &Capability,
        index: usize,
        cap_type: CapType,
        policy: ObjectPolicy,
        return_code: u64,
    ) -> Result<(Capability, Capability)> {
        let locked = self.lock();
        self.folio_object_alloc_locked(&locked, folio, index, cap_type, policy, return_code)
    }

    /// Destroy whatever occupies object `index` of `folio` and, unless
    /// `cap_type` is void, install a fresh object of that type. Returns
    /// the strong and weak capabilities of the new object.
    pub(crate) fn folio_object_alloc_locked(
        &self,
        locked: &WaitLocked<'_>,
        folio: &Capability,
        index: usize,
        cap_type: CapType,
        policy: ObjectPolicy,
        return_code: u64,
    ) -> Result<(Capability, Capability)> {
        let folio = self.object(folio, |t| t == CapType::Folio)?;
        if index >= FOLIO_OBJECTS || cap_type == CapType::Folio {
            return Err(Error::InvalidArgument);
        }
        let folio_index = folio.oid.folio_index();
        let oid = Oid::object(folio_index, index);

        self.destroy_object(locked, oid, return_code);
        if cap_type == CapType::Void {
            return Ok((Capability::VOID, Capability::VOID));
        }

        let cap_type = cap_type.strengthen();
        let body = match cap_type {
            CapType::Page => ObjectBody::Page(Arc::new(Mutex::new(PageObject::default()))),
            CapType::CapPage => ObjectBody::CapPage(Arc::new(Mutex::new(new_cap_slots()))),
            CapType::ActivityControl => {
                let owner = self
                    .folios
                    .get(folio_index)
                    .ok_or(Error::NoObject)?
                    .lock()
                    .owner;
                let parent = self.activity_by_oid(owner).ok_or(Error::NoObject)?;
                parent.lock().children.push(oid);
                let activity = Activity::new(Some(owner), Default::default());
                ObjectBody::Activity(Arc::new(Mutex::new(activity)))
            }
            CapType::Thread => {
                ObjectBody::Thread(Arc::new(Mutex::new(Thread::new(self.alloc_thread_id()))))
            }
            CapType::Messenger => ObjectBody::Messenger(Arc::new(Mutex::new(Messenger::new()))),
            _ => return Err(Error::InvalidArgument),
        };

        let strong = self.object_install(locked, oid, cap_type, body, policy)?;
        Ok((strong, strong.weakened()))
    }

    /// Install `body` in the empty slot `oid`.
    pub(crate) fn object_install(
        &self,
        _locked: &WaitLocked<'_>,
        oid: Oid,
        cap_type: CapType,
        body: ObjectBody,
        policy: ObjectPolicy,
    ) -> Result<Capability> {
        let version = self
            .with_meta(oid, |meta| {
                invariant!(
                    meta.cap_type == CapType::Void,
                    "installing over the live object {}",
                    oid
                );
                meta.cap_type = cap_type;
                meta.flags = MetaFlags::empty();
                meta.policy = policy;
                meta.checksum = None;
                meta.body = body;
                meta.version
            })
            .ok_or(Error::NoObject)?;
        debug!("{} {} allocated, version {}", cap_type, oid, version);
        Ok(Capability::new(cap_type, oid, version, policy))
    }

    /// Destroy the object in slot `oid`, if any.
    ///
    /// Its version is bumped first, so every capability naming it dies
    /// at once, then cached translations are shot down, type specific
    /// teardown runs and every waiter is woken with `return_code`. The
    /// slot stays reserved until the end so that teardown, which may
    /// recurse into this folio, can still find the object.
    pub(crate) fn destroy_object(&self, locked: &WaitLocked<'_>, oid: Oid, return_code: u64) {
        let dying = self.with_meta(oid, |meta| {
            if meta.cap_type == CapType::Void || meta.flags.contains(MetaFlags::DYING) {
                return None;
            }
            meta.flags.insert(MetaFlags::DYING);
            meta.version += 1;
            Some((meta.cap_type, meta.body.clone()))
        });
        let (cap_type, body) = match dying.flatten() {
            Some(dying) => dying,
            None => return,
        };

        self.shadow.lock().shootdown_object(oid);
        match &body {
            ObjectBody::Activity(activity) => self.activity_teardown(locked, oid, activity, return_code),
            ObjectBody::Thread(thread) => self.thread_teardown(locked, thread),
            ObjectBody::Messenger(messenger) => {
                self.wait_dequeue(locked, oid);
                let thread = messenger.lock().thread;
                self.messenger_settled(oid, &thread);
            }
            _ => {}
        }
        self.wake_all(locked, oid, return_code);

        self.with_meta(oid, |meta| {
            meta.cap_type = CapType::Void;
            meta.flags = MetaFlags::empty();
            meta.checksum = None;
            meta.body = ObjectBody::Void;
        });
        debug!("{} {} destroyed", cap_type, oid);
    }

    pub fn folio_policy(
        &self,
        folio: &Capability,
        flags: FolioPolicyFlags,
        policy: FolioPolicy,
    ) -> Result<FolioPolicy> {
        let locked = self.lock();
        self.folio_policy_locked(&locked, folio, flags, policy)
    }

    /// Apply the fields of `policy` selected by `flags`. Returns the
    /// policy as it was before.
    pub(crate) fn folio_policy_locked(
        &self,
        _locked: &WaitLocked<'_>,
        folio: &Capability,
        flags: FolioPolicyFlags,
        policy: FolioPolicy,
    ) -> Result<FolioPolicy> {
        let folio = self.object(folio, |t| t == CapType::Folio)?;
        let folio = self
            .folios
            .get(folio.oid.folio_index())
            .ok_or(Error::NoObject)?;
        let mut folio = folio.lock();
        let old = folio.policy;
        if flags.contains(FolioPolicyFlags::DISCARDABLE_SET) {
            folio.policy.discardable = policy.discardable;
        }
        if flags.contains(FolioPolicyFlags::GROUP_SET) {
            folio.policy.group = policy.group;
        }
        if flags.contains(FolioPolicyFlags::PRIORITY_SET) {
            folio.policy.priority = policy.priority;
        }
        Ok(old)
    }
}
