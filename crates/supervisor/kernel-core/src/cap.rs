/*!
Kernel capabilities

The kernel's capability names its object by [`Oid`] and version. User
space only ever sees the [`UserCapability`] projection: type and
properties, never the designation.

A capability is live while its version equals the object's and its type
is compatible with the type recorded for the object. Nothing is done to
capabilities when their object dies: they simply stop resolving.
*/
use core::fmt;

use viengoos_abi::{
    addr_trans::CapAddrTrans,
    cap::{CapCopyFlags, CapProperties, CapType, ObjectPolicy, UserCapability},
    error::{Error, Result},
};

use crate::object::Oid;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capability {
    pub cap_type: CapType,
    pub oid: Oid,
    pub version: u64,
    pub properties: CapProperties,
}

impl Capability {
    pub const VOID: Capability = Capability {
        cap_type: CapType::Void,
        oid: Oid::from_raw(0),
        version: 0,
        properties: UserCapability::VOID.properties,
    };

    pub fn new(cap_type: CapType, oid: Oid, version: u64, policy: ObjectPolicy) -> Self {
        Self {
            cap_type,
            oid,
            version,
            properties: CapProperties::new(policy, CapAddrTrans::IDENTITY),
        }
    }

    pub fn is_void(&self) -> bool {
        self.cap_type == CapType::Void
    }

    pub fn addr_trans(&self) -> &CapAddrTrans {
        &self.properties.addr_trans
    }

    /// The same designation with the weak type.
    pub fn weakened(&self) -> Capability {
        Capability {
            cap_type: self.cap_type.weaken(),
            ..*self
        }
    }

    /// Whether the address space walk can pass through objects of this
    /// capability's type.
    pub fn is_traversable(&self) -> bool {
        matches!(
            self.cap_type,
            CapType::CapPage | CapType::ReadOnlyCapPage | CapType::Thread
        )
    }

    /// Validated conversion from the user view plus a designation. A
    /// void capability must not designate anything and anything else
    /// must.
    pub fn from_user(user: &UserCapability, oid: Option<Oid>, version: u64) -> Result<Capability> {
        if !user.properties.addr_trans.valid() {
            return Err(Error::InvalidArgument);
        }
        match (user.cap_type, oid) {
            (CapType::Void, None) => Ok(Capability::VOID),
            (CapType::Void, Some(_)) | (_, None) => Err(Error::InvalidArgument),
            (cap_type, Some(oid)) => Ok(Capability {
                cap_type,
                oid,
                version,
                properties: user.properties,
            }),
        }
    }

    pub fn to_user(&self) -> UserCapability {
        UserCapability {
            cap_type: self.cap_type,
            properties: self.properties,
        }
    }

    /// Compute what `cap_copy` stores in a slot holding `target` when
    /// copying `source` into it.
    ///
    /// Returns the new slot content and whether cached translations
    /// through the slot must be shot down. On error nothing is to be
    /// written.
    pub fn copy_from(
        target: &Capability,
        source: &Capability,
        flags: CapCopyFlags,
        properties: &CapProperties,
    ) -> Result<(Capability, bool)> {
        let source_trans = source.addr_trans();
        let (guard, gdepth) = if flags.contains(CapCopyFlags::COPY_ADDR_TRANS_GUARD) {
            let trans = &properties.addr_trans;
            (trans.guard(), trans.guard_bits())
        } else if flags.contains(CapCopyFlags::COPY_SOURCE_GUARD) {
            (source_trans.guard(), source_trans.guard_bits())
        } else {
            (target.addr_trans().guard(), target.addr_trans().guard_bits())
        };

        let (subpage, subpages) = if flags.contains(CapCopyFlags::COPY_ADDR_TRANS_SUBPAGE) {
            let trans = &properties.addr_trans;
            if !source.cap_type.is_cappage() || !trans.subpage_within(source_trans) {
                return Err(Error::InvalidArgument);
            }
            (trans.subpage(), trans.subpages())
        } else {
            (source_trans.subpage(), source_trans.subpages())
        };

        let addr_trans =
            CapAddrTrans::new(guard, gdepth, subpage, subpages).ok_or(Error::InvalidArgument)?;

        let mut policy = source.properties.policy;
        if flags.contains(CapCopyFlags::DISCARDABLE_SET) {
            policy.discardable = properties.policy.discardable;
        }
        if flags.contains(CapCopyFlags::PRIORITY_SET) {
            policy.priority = properties.policy.priority;
        }

        let cap_type = if flags.contains(CapCopyFlags::WEAKEN) {
            source.cap_type.weaken()
        } else {
            source.cap_type
        };

        let new = Capability {
            cap_type,
            oid: source.oid,
            version: source.version,
            properties: CapProperties::new(policy, addr_trans),
        };
        Ok((new, target.needs_shootdown(&new)))
    }

    /// Whether replacing `self` by `new` in a slot invalidates cached
    /// translations through that slot. Cached walks hold the capability
    /// they found, so any change counts, filling an empty slot and
    /// weakening in place included.
    pub fn needs_shootdown(&self, new: &Capability) -> bool {
        if self.is_void() && new.is_void() {
            return false;
        }
        self != new
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            return write!(f, "Capability(void)");
        }
        write!(
            f,
            "Capability({} {} v{} {:?})",
            self.cap_type,
            self.oid,
            self.version,
            self.properties.addr_trans
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cappage(trans: CapAddrTrans) -> Capability {
        Capability {
            cap_type: CapType::CapPage,
            oid: Oid::object(1, 2),
            version: 3,
            properties: CapProperties::new(ObjectPolicy::default(), trans),
        }
    }

    fn props(trans: CapAddrTrans) -> CapProperties {
        CapProperties::new(ObjectPolicy::new(true, 5), trans)
    }

    #[test]
    fn test_guard_selection() {
        let source = cappage(CapAddrTrans::new(0b11, 2, 0, 1).unwrap());
        let target = cappage(CapAddrTrans::new(0b1, 1, 0, 1).unwrap());
        let supplied = props(CapAddrTrans::new(0b101, 3, 0, 1).unwrap());

        let (new, _) = Capability::copy_from(&target, &source, CapCopyFlags::empty(), &supplied).unwrap();
        assert_eq!((0b1, 1), (new.addr_trans().guard(), new.addr_trans().guard_bits()));

        let (new, _) =
            Capability::copy_from(&target, &source, CapCopyFlags::COPY_SOURCE_GUARD, &supplied).unwrap();
        assert_eq!((0b11, 2), (new.addr_trans().guard(), new.addr_trans().guard_bits()));

        let (new, _) = Capability::copy_from(
            &target,
            &source,
            CapCopyFlags::COPY_SOURCE_GUARD | CapCopyFlags::COPY_ADDR_TRANS_GUARD,
            &supplied,
        )
        .unwrap();
        assert_eq!((0b101, 3), (new.addr_trans().guard(), new.addr_trans().guard_bits()));
        // The source policy is kept unless asked otherwise.
        assert_eq!(ObjectPolicy::default(), new.properties.policy);
    }

    #[test]
    fn test_subpage_narrowing() {
        let source = cappage(CapAddrTrans::new(0, 0, 1, 2).unwrap());
        let within = props(CapAddrTrans::new(0, 0, 2, 4).unwrap());
        let (new, _) = Capability::copy_from(
            &Capability::VOID,
            &source,
            CapCopyFlags::COPY_ADDR_TRANS_SUBPAGE,
            &within,
        )
        .unwrap();
        assert_eq!((2, 4), (new.addr_trans().subpage(), new.addr_trans().subpages()));

        let same = props(*source.addr_trans());
        assert!(Capability::copy_from(
            &Capability::VOID,
            &source,
            CapCopyFlags::COPY_ADDR_TRANS_SUBPAGE,
            &same
        )
        .is_ok());

        let outside = props(CapAddrTrans::new(0, 0, 0, 4).unwrap());
        assert_eq!(
            Err(Error::InvalidArgument),
            Capability::copy_from(
                &Capability::VOID,
                &source,
                CapCopyFlags::COPY_ADDR_TRANS_SUBPAGE,
                &outside
            )
        );

        let page = Capability {
            cap_type: CapType::Page,
            ..source
        };
        assert_eq!(
            Err(Error::InvalidArgument),
            Capability::copy_from(
                &Capability::VOID,
                &page,
                CapCopyFlags::COPY_ADDR_TRANS_SUBPAGE,
                &within
            )
        );
    }

    #[test]
    fn test_encoding_bound() {
        let source = cappage(CapAddrTrans::new(0, 0, 0, 256).unwrap());
        let wide_guard = props(CapAddrTrans::new(0, 20, 0, 1).unwrap());
        assert_eq!(
            Err(Error::InvalidArgument),
            Capability::copy_from(
                &Capability::VOID,
                &source,
                CapCopyFlags::COPY_ADDR_TRANS_GUARD,
                &wide_guard
            )
        );
    }

    #[test]
    fn test_weaken_and_policy() {
        let page = Capability::new(CapType::Page, Oid::object(0, 4), 1, ObjectPolicy::default());
        let (new, shootdown) = Capability::copy_from(
            &page,
            &page,
            CapCopyFlags::WEAKEN | CapCopyFlags::PRIORITY_SET,
            &props(CapAddrTrans::IDENTITY),
        )
        .unwrap();
        assert_eq!(CapType::ReadOnlyPage, new.cap_type);
        assert_eq!(5, new.properties.policy.priority);
        assert!(!new.properties.policy.discardable);
        assert!(shootdown);

        let cp = cappage(CapAddrTrans::IDENTITY);
        let (weak, shootdown) =
            Capability::copy_from(&cp, &cp, CapCopyFlags::WEAKEN, &CapProperties::default()).unwrap();
        assert_eq!(CapType::ReadOnlyCapPage, weak.cap_type);
        assert!(shootdown);
    }

    #[test]
    fn test_shootdown_rules() {
        let page = Capability::new(CapType::Page, Oid::object(0, 4), 1, ObjectPolicy::default());
        assert!(Capability::VOID.needs_shootdown(&page));
        assert!(!page.needs_shootdown(&page));
        assert!(!Capability::VOID.needs_shootdown(&Capability { version: 3, ..Capability::VOID }));
        assert!(page.needs_shootdown(&page.weakened()));
        assert!(page.needs_shootdown(&Capability { version: 2, ..page }));
        assert!(page.needs_shootdown(&Capability::VOID));
        let guarded = Capability {
            properties: props(CapAddrTrans::new(1, 1, 0, 1).unwrap()),
            ..page
        };
        assert!(page.needs_shootdown(&guarded));
    }

    #[test]
    fn test_user_conversion() {
        let page = Capability::new(CapType::Page, Oid::object(2, 0), 9, ObjectPolicy::new(true, 1));
        let user = page.to_user();
        assert_eq!(Ok(page), Capability::from_user(&user, Some(page.oid), 9));
        assert_eq!(Err(Error::InvalidArgument), Capability::from_user(&user, None, 0));
        assert_eq!(
            Err(Error::InvalidArgument),
            Capability::from_user(&UserCapability::VOID, Some(page.oid), 0)
        );
        assert_eq!(Ok(Capability::VOID), Capability::from_user(&UserCapability::VOID, None, 0));
    }
}
