/*!
Object identifiers and per object state

Every folio is followed, in identifier space, by its objects: the folio
with arena index `f` has oid `f * 129` and its object `i` has oid
`f * 129 + i + 1`. The folio is therefore object "-1" of itself, which
is how wait queues and versions treat it.

The state of an object is split in two. [`ObjectMeta`] lives in the
folio and holds the type, version, paging bits and wait queue head; it
is protected by the folio lock. The content ([`ObjectBody`]) sits behind
its own lock and is shared out by `Arc` so that it can be used after the
folio lock is dropped.
*/
use alloc::{boxed::Box, sync::Arc};
use core::fmt;

use spin::Mutex;
use viengoos_abi::{
    addr_trans::CAPPAGE_SLOTS,
    cap::{CapType, ObjectPolicy},
    error::{Error, Result},
    folio::{ObjectStatus, FOLIO_OBJECTS},
    message::Message,
    PAGESIZE,
};

use crate::{
    activity::Activity,
    cap::Capability,
    kernel::WaitLocked,
    messenger::Messenger,
    thread::Thread,
    wait_queue::{WaitHead, WaitReason},
    Kernel,
};

const FOLIO_STRIDE: u64 = FOLIO_OBJECTS as u64 + 1;

/// Object identifier. See module level documentation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(u64);

impl Oid {
    /// The oid of the folio at arena index `folio`.
    pub const fn folio(folio: usize) -> Oid {
        Oid(folio as u64 * FOLIO_STRIDE)
    }

    /// The oid of object `index` of the folio at arena index `folio`.
    pub fn object(folio: usize, index: usize) -> Oid {
        assert!(index < FOLIO_OBJECTS, "object index {} out of range", index);
        Oid(folio as u64 * FOLIO_STRIDE + index as u64 + 1)
    }

    pub const fn from_raw(raw: u64) -> Oid {
        Oid(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Arena index of the containing folio.
    pub const fn folio_index(self) -> usize {
        (self.0 / FOLIO_STRIDE) as usize
    }

    /// Index within the folio, or `None` for the folio itself.
    pub const fn object_index(self) -> Option<usize> {
        match self.0 % FOLIO_STRIDE {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    pub const fn is_folio(self) -> bool {
        self.0 % FOLIO_STRIDE == 0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_index() {
            Some(index) => write!(f, "{}.{}", self.folio_index(), index),
            None => write!(f, "{}.F", self.folio_index()),
        }
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self)
    }
}

/// Content of a data page. Storage is only materialized on first access.
#[derive(Default)]
pub struct PageObject {
    data: Option<Box<[u8; PAGESIZE]>>,
}

impl PageObject {
    pub fn is_materialized(&self) -> bool {
        self.data.is_some()
    }

    pub fn bytes(&mut self) -> &[u8; PAGESIZE] {
        self.bytes_mut()
    }

    /// The page's bytes, zero filled on first use.
    pub fn bytes_mut(&mut self) -> &mut [u8; PAGESIZE] {
        self.data.get_or_insert_with(|| Box::new([0u8; PAGESIZE]))
    }

    /// Drop the content.
    pub fn discard(&mut self) {
        self.data = None;
    }

    /// FNV-1a over the content. An unmaterialized page hashes as zeros.
    pub fn checksum(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let zeros = [0u8; PAGESIZE];
        let bytes = self.data.as_deref().unwrap_or(&zeros);
        bytes
            .iter()
            .fold(OFFSET, |hash, byte| (hash ^ *byte as u64).wrapping_mul(PRIME))
    }
}

impl fmt::Debug for PageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageObject")
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// The slots of a cappage.
pub type CapSlots = Box<[Capability; CAPPAGE_SLOTS]>;

pub fn new_cap_slots() -> CapSlots {
    Box::new([Capability::VOID; CAPPAGE_SLOTS])
}

/// Content of an object.
#[derive(Clone)]
pub enum ObjectBody {
    Void,
    /// A folio has no content beyond its metadata.
    Folio,
    Page(Arc<Mutex<PageObject>>),
    CapPage(Arc<Mutex<CapSlots>>),
    Activity(Arc<Mutex<Activity>>),
    Thread(Arc<Mutex<Thread>>),
    Messenger(Arc<Mutex<Messenger>>),
}

impl Default for ObjectBody {
    fn default() -> Self {
        ObjectBody::Void
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectBody::Void => "Void",
            ObjectBody::Folio => "Folio",
            ObjectBody::Page(_) => "Page",
            ObjectBody::CapPage(_) => "CapPage",
            ObjectBody::Activity(_) => "Activity",
            ObjectBody::Thread(_) => "Thread",
            ObjectBody::Messenger(_) => "Messenger",
        };
        f.write_str(name)
    }
}

macro_rules! object_body_accessors {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        paste! {
            impl ObjectBody {
                $(
                    pub fn [< as_ $variant:snake >](&self) -> Result<&Arc<Mutex<$ty>>> {
                        match self {
                            ObjectBody::$variant(object) => Ok(object),
                            _ => Err(Error::WrongType),
                        }
                    }
                )*
            }
        }
    };
}

object_body_accessors!(
    Page => PageObject,
    CapPage => CapSlots,
    Activity => Activity,
    Thread => Thread,
    Messenger => Messenger,
);

bitflags! {
    /// Paging and content state of an object.
    #[derive(Default)]
    pub struct MetaFlags: u8 {
        /// The content has been initialized.
        const CONTENT = 1 << 0;
        const DIRTY = 1 << 1;
        const REFERENCED = 1 << 2;
        /// The content was dropped and the loss not yet acknowledged.
        const DISCARDED = 1 << 3;
        /// Destruction is in progress.
        const DYING = 1 << 4;
    }
}

/// Per object metadata kept in the folio.
#[derive(Debug, Default, CopyGetters)]
pub struct ObjectMeta {
    #[getset(get_copy = "pub")]
    pub(crate) cap_type: CapType,
    /// Bumped every time the object is destroyed. Survives folio reuse.
    #[getset(get_copy = "pub")]
    pub(crate) version: u64,
    #[getset(get_copy = "pub")]
    pub(crate) flags: MetaFlags,
    #[getset(get_copy = "pub")]
    pub(crate) policy: ObjectPolicy,
    /// Content checksum taken when the object was last cleaned.
    pub(crate) checksum: Option<u64>,
    pub(crate) wait: WaitHead,
    pub(crate) body: ObjectBody,
}

/// A resolved capability: the designated object as seen through the
/// capability that named it.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub oid: Oid,
    pub version: u64,
    /// Type of the designating capability; may be weaker than the object.
    pub cap_type: CapType,
    pub body: ObjectBody,
}

impl Kernel {
    /// Run `f` on the metadata of the live object `object` refers to.
    fn with_live_meta<R>(&self, object: &ObjectRef, f: impl FnOnce(&mut ObjectMeta) -> Result<R>) -> Result<R> {
        self.with_meta(object.oid, |meta| {
            if meta.cap_type == CapType::Void || meta.version != object.version {
                return Err(Error::NoObject);
            }
            f(meta)
        })
        .ok_or(Error::NoObject)?
    }

    fn any_object(&self, cap: &Capability) -> Result<ObjectRef> {
        let object = self.object(cap, |_| true)?;
        if object.oid.is_folio() {
            return Err(Error::WrongType);
        }
        Ok(object)
    }

    /// Acknowledge the loss of the content of `cap`'s object.
    pub fn object_discarded_clear(&self, cap: &Capability) -> Result<()> {
        let object = self.any_object(cap)?;
        self.with_live_meta(&object, |meta| {
            meta.flags.remove(MetaFlags::DISCARDED);
            Ok(())
        })
    }

    /// Drop the content of a discardable page. Until the loss is
    /// acknowledged, accesses fail with `Discarded`.
    pub fn object_discard(&self, cap: &Capability) -> Result<()> {
        let object = self.object(cap, CapType::is_page)?;
        if object.cap_type != CapType::Page {
            return Err(Error::PermissionDenied);
        }
        let page = object.body.as_page()?.clone();
        self.with_live_meta(&object, |meta| {
            if !meta.policy.discardable {
                return Err(Error::InvalidArgument);
            }
            meta.flags.remove(MetaFlags::CONTENT | MetaFlags::DIRTY | MetaFlags::REFERENCED);
            meta.flags.insert(MetaFlags::DISCARDED);
            meta.checksum = None;
            Ok(())
        })?;
        page.lock().discard();

        let owner = self
            .folios
            .get(object.oid.folio_index())
            .map(|folio| folio.lock().owner);
        if let Some(activity) = owner.and_then(|owner| self.activity_by_oid(owner)) {
            activity.lock().discarded += 1;
        }
        debug!("{} discarded", object.oid);
        Ok(())
    }

    /// The referenced and dirty bits of `cap`'s object. With `clear`,
    /// reset them and take a checksum of the now clean content.
    pub fn object_status(&self, cap: &Capability, clear: bool) -> Result<ObjectStatus> {
        let object = self.any_object(cap)?;
        let page = object.body.as_page().ok().cloned();
        self.with_live_meta(&object, |meta| {
            let mut status = ObjectStatus::empty();
            status.set(ObjectStatus::REFERENCED, meta.flags.contains(MetaFlags::REFERENCED));
            status.set(ObjectStatus::DIRTY, meta.flags.contains(MetaFlags::DIRTY));

            let checksum = page.as_ref().map(|page| page.lock().checksum());
            if let (Some(recorded), Some(current)) = (meta.checksum, checksum) {
                if !meta.flags.contains(MetaFlags::DIRTY) && recorded != current {
                    debug_panic!("{} changed without being dirtied", object.oid);
                }
            }
            if clear {
                meta.flags.remove(MetaFlags::REFERENCED | MetaFlags::DIRTY);
                meta.checksum = checksum;
            }
            Ok(status)
        })
    }

    /// Queue `reply` on `cap`'s object. It is completed, with the
    /// destroyer's return code, when the object is destroyed.
    pub fn object_reply_on_destruction(&self, cap: &Capability, reply: &Capability) -> Result<()> {
        let locked = self.lock();
        let reply = self.idle_messenger(reply)?;
        self.object_reply_on_destruction_locked(&locked, cap, reply)
    }

    pub(crate) fn object_reply_on_destruction_locked(
        &self,
        locked: &WaitLocked<'_>,
        cap: &Capability,
        reply: Oid,
    ) -> Result<()> {
        let object = self.resolve(cap).ok_or(Error::NoObject)?;
        self.wait_enqueue(locked, object.oid, reply, WaitReason::Destruction);
        debug!("{} waits for the destruction of {}", reply, object.oid);
        Ok(())
    }

    /// Access the page `cap` designates, marking it referenced, and
    /// dirty if `write`.
    fn page_access<R>(&self, cap: &Capability, write: bool, f: impl FnOnce(&mut PageObject) -> R) -> Result<R> {
        let object = self.object(cap, CapType::is_page)?;
        if write && object.cap_type != CapType::Page {
            return Err(Error::PermissionDenied);
        }
        let page = object.body.as_page()?.clone();
        self.with_live_meta(&object, |meta| {
            if meta.flags.contains(MetaFlags::DISCARDED) {
                return Err(Error::Discarded);
            }
            meta.flags.insert(MetaFlags::CONTENT | MetaFlags::REFERENCED);
            if write {
                meta.flags.insert(MetaFlags::DIRTY);
            }
            Ok(())
        })?;
        let mut page = page.lock();
        Ok(f(&mut page))
    }

    /// Copy bytes of the page `cap` designates, starting at `offset`,
    /// into `buf`.
    pub fn page_read(&self, cap: &Capability, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = page_range(offset, buf.len())?;
        self.page_access(cap, false, |page| buf.copy_from_slice(&page.bytes()[offset..end]))
    }

    /// Copy `data` into the page `cap` designates, starting at `offset`.
    pub fn page_write(&self, cap: &Capability, offset: usize, data: &[u8]) -> Result<()> {
        let end = page_range(offset, data.len())?;
        self.page_access(cap, true, |page| page.bytes_mut()[offset..end].copy_from_slice(data))
    }

    /// The message held in the page `cap` designates.
    pub(crate) fn page_load_message(&self, cap: &Capability) -> Result<Message> {
        self.page_access(cap, false, |page| Message::from_bytes(page.bytes()))
    }

    pub(crate) fn page_store_message(&self, cap: &Capability, msg: &Message) -> Result<()> {
        self.page_access(cap, true, |page| page.bytes_mut().copy_from_slice(msg.as_bytes()))
    }
}

/// End of the byte range `offset..offset + len`, if it lies in a page.
fn page_range(offset: usize, len: usize) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGESIZE => Ok(end),
        _ => Err(Error::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_layout() {
        assert_eq!(0, Oid::folio(0).into_raw());
        assert_eq!(1, Oid::object(0, 0).into_raw());
        assert_eq!(129, Oid::folio(1).into_raw());
        assert_eq!(Some(127), Oid::object(3, 127).object_index());
        assert_eq!(3, Oid::object(3, 127).folio_index());
        assert!(Oid::folio(7).is_folio());
        assert_eq!(None, Oid::folio(7).object_index());
        assert!(!Oid::object(7, 0).is_folio());
    }

    #[test]
    fn test_page_materialization() {
        let mut page = PageObject::default();
        let blank = page.checksum();
        assert!(!page.is_materialized());
        assert_eq!(0, page.bytes()[17]);
        assert!(page.is_materialized());
        assert_eq!(blank, page.checksum());
        page.bytes_mut()[17] = 1;
        assert_ne!(blank, page.checksum());
        page.discard();
        assert!(!page.is_materialized());
    }

    #[test]
    fn test_body_accessors() {
        let body = ObjectBody::Page(Arc::new(Mutex::new(PageObject::default())));
        assert!(body.as_page().is_ok());
        assert_eq!(Some(Error::WrongType), body.as_messenger().err());
    }

    fn page(kernel: &Kernel, boot: &crate::BootInfo, policy: ObjectPolicy) -> Capability {
        let folio = kernel.folio_alloc(&boot.activity, Default::default()).unwrap();
        kernel
            .folio_object_alloc(&folio, 0, CapType::Page, policy, 0)
            .unwrap()
            .0
    }

    #[test]
    fn test_page_access() {
        let (kernel, boot) = Kernel::bootstrap(Default::default()).unwrap();
        let page = page(&kernel, &boot, ObjectPolicy::default());
        assert_eq!(Ok(ObjectStatus::empty()), kernel.object_status(&page, false));

        let mut buf = [0u8; 4];
        kernel.page_read(&page, 100, &mut buf).unwrap();
        assert_eq!([0; 4], buf);
        assert_eq!(Ok(ObjectStatus::REFERENCED), kernel.object_status(&page, false));

        kernel.page_write(&page, 100, &[1, 2, 3, 4]).unwrap();
        kernel.page_read(&page, 101, &mut buf[..2]).unwrap();
        assert_eq!([2, 3], buf[..2]);
        assert_eq!(
            Ok(ObjectStatus::REFERENCED | ObjectStatus::DIRTY),
            kernel.object_status(&page, true)
        );
        assert_eq!(Ok(ObjectStatus::empty()), kernel.object_status(&page, false));

        assert_eq!(
            Err(Error::InvalidArgument),
            kernel.page_write(&page, PAGESIZE - 1, &[0, 0])
        );
        assert_eq!(
            Err(Error::PermissionDenied),
            kernel.page_write(&page.weakened(), 0, &[1])
        );
        assert!(kernel.page_read(&page.weakened(), 0, &mut buf).is_ok());
        assert_eq!(Err(Error::WrongType), kernel.page_read(&boot.thread, 0, &mut buf));
    }

    #[test]
    fn test_discard() {
        let (kernel, boot) = Kernel::bootstrap(Default::default()).unwrap();
        let fixed = page(&kernel, &boot, ObjectPolicy::default());
        assert_eq!(Err(Error::InvalidArgument), kernel.object_discard(&fixed));

        let page = page(&kernel, &boot, ObjectPolicy::new(true, 0));
        kernel.page_write(&page, 0, &[9]).unwrap();
        kernel.object_discard(&page).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(Err(Error::Discarded), kernel.page_read(&page, 0, &mut buf));

        kernel.object_discarded_clear(&page).unwrap();
        kernel.page_read(&page, 0, &mut buf).unwrap();
        assert_eq!([0], buf);
    }
}
