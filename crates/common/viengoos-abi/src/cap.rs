//! Capability types and the user visible view of a capability.
use core::convert::TryFrom;
use core::fmt;

use crate::addr_trans::CapAddrTrans;
use crate::error::Error;

/// The type of object a capability designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CapType {
    Void = 0,
    Page = 1,
    /// Weak view of a page.
    ReadOnlyPage = 2,
    CapPage = 3,
    /// Weak view of a cappage.
    ReadOnlyCapPage = 4,
    Folio = 5,
    /// Weak view of an activity: may be used for accounting but not control.
    Activity = 6,
    ActivityControl = 7,
    Thread = 8,
    Messenger = 9,
}

impl Default for CapType {
    fn default() -> Self {
        Self::Void
    }
}

impl CapType {
    pub const COUNT: usize = 10;

    pub const ALL: [CapType; Self::COUNT] = [
        CapType::Void,
        CapType::Page,
        CapType::ReadOnlyPage,
        CapType::CapPage,
        CapType::ReadOnlyCapPage,
        CapType::Folio,
        CapType::Activity,
        CapType::ActivityControl,
        CapType::Thread,
        CapType::Messenger,
    ];

    /// Whether this is the weak half of a strong/weak pair.
    pub const fn is_weak(self) -> bool {
        matches!(
            self,
            CapType::ReadOnlyPage | CapType::ReadOnlyCapPage | CapType::Activity
        )
    }

    /// The weak counterpart. Types without one are returned unchanged.
    pub const fn weaken(self) -> CapType {
        match self {
            CapType::Page => CapType::ReadOnlyPage,
            CapType::CapPage => CapType::ReadOnlyCapPage,
            CapType::ActivityControl => CapType::Activity,
            other => other,
        }
    }

    /// The strong counterpart. Types without one are returned unchanged.
    pub const fn strengthen(self) -> CapType {
        match self {
            CapType::ReadOnlyPage => CapType::Page,
            CapType::ReadOnlyCapPage => CapType::CapPage,
            CapType::Activity => CapType::ActivityControl,
            other => other,
        }
    }

    /// Whether capabilities of types `a` and `b` may designate the same
    /// object: they are equal or form a strong/weak pair.
    pub fn compatible(a: CapType, b: CapType) -> bool {
        a.strengthen() == b.strengthen()
    }

    pub const fn is_cappage(self) -> bool {
        matches!(self, CapType::CapPage | CapType::ReadOnlyCapPage)
    }

    pub const fn is_page(self) -> bool {
        matches!(self, CapType::Page | CapType::ReadOnlyPage)
    }

    pub const fn is_activity(self) -> bool {
        matches!(self, CapType::Activity | CapType::ActivityControl)
    }

    pub const fn name(self) -> &'static str {
        match self {
            CapType::Void => "void",
            CapType::Page => "page",
            CapType::ReadOnlyPage => "rpage",
            CapType::CapPage => "cappage",
            CapType::ReadOnlyCapPage => "rcappage",
            CapType::Folio => "folio",
            CapType::Activity => "activity",
            CapType::ActivityControl => "activity_control",
            CapType::Thread => "thread",
            CapType::Messenger => "messenger",
        }
    }
}

impl fmt::Display for CapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u64> for CapType {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        CapType::ALL
            .get(value as usize)
            .copied()
            .filter(|_| value < CapType::COUNT as u64)
            .ok_or(Error::InvalidArgument)
    }
}

/// Lowest object priority.
pub const OBJECT_PRIORITY_MIN: i8 = -64;
/// Highest object priority.
pub const OBJECT_PRIORITY_MAX: i8 = 63;
/// Priority of objects managed in plain LRU order.
pub const OBJECT_PRIORITY_DEFAULT: i8 = 0;

/// Per object paging policy carried by capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectPolicy {
    /// The object's content may be dropped under memory pressure.
    pub discardable: bool,
    pub priority: i8,
}

impl Default for ObjectPolicy {
    fn default() -> Self {
        Self {
            discardable: false,
            priority: OBJECT_PRIORITY_DEFAULT,
        }
    }
}

impl ObjectPolicy {
    pub const fn new(discardable: bool, priority: i8) -> Self {
        Self {
            discardable,
            priority,
        }
    }

    pub fn to_raw(&self) -> u64 {
        (self.priority as u8 as u64) | (self.discardable as u64) << 8
    }

    pub fn from_raw(raw: u64) -> Result<Self, Error> {
        let priority = raw as u8 as i8;
        if raw >> 9 != 0 || !(OBJECT_PRIORITY_MIN..=OBJECT_PRIORITY_MAX).contains(&priority) {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            discardable: raw & (1 << 8) != 0,
            priority,
        })
    }
}

/// The properties of a capability which are not the designation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapProperties {
    pub policy: ObjectPolicy,
    pub addr_trans: CapAddrTrans,
}

impl CapProperties {
    pub const fn new(policy: ObjectPolicy, addr_trans: CapAddrTrans) -> Self {
        Self { policy, addr_trans }
    }
}

/// A capability as user space sees it: what it is and how it translates,
/// but not which object it designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserCapability {
    pub cap_type: CapType,
    pub properties: CapProperties,
}

impl UserCapability {
    pub const VOID: UserCapability = UserCapability {
        cap_type: CapType::Void,
        properties: CapProperties {
            policy: ObjectPolicy::new(false, OBJECT_PRIORITY_DEFAULT),
            addr_trans: CapAddrTrans::IDENTITY,
        },
    };
}

bitflags! {
    /// How `cap_copy` combines the source capability with the supplied
    /// properties.
    #[derive(Default)]
    pub struct CapCopyFlags: u32 {
        /// Take the subpage from the supplied properties. Only valid for
        /// cappages, and only to narrow the source's window.
        const COPY_ADDR_TRANS_SUBPAGE = 1 << 0;
        /// Take the guard from the supplied properties.
        const COPY_ADDR_TRANS_GUARD = 1 << 1;
        /// Take the guard from the source rather than keeping the target's.
        const COPY_SOURCE_GUARD = 1 << 2;
        /// Store the weak form of the source.
        const WEAKEN = 1 << 3;
        /// Take the discardable bit from the supplied properties.
        const DISCARDABLE_SET = 1 << 4;
        /// Take the priority from the supplied properties.
        const PRIORITY_SET = 1 << 5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weaken_idempotent() {
        for t in CapType::ALL.iter().copied() {
            assert_eq!(t.weaken(), t.weaken().weaken());
            assert!(CapType::compatible(t, t.weaken()));
        }
    }

    #[test]
    fn test_weaken_fixed_points() {
        for t in [CapType::Void, CapType::Folio, CapType::Thread, CapType::Messenger] {
            assert_eq!(t, t.weaken());
            assert!(!t.is_weak());
        }
        assert_eq!(CapType::ReadOnlyPage, CapType::Page.weaken());
        assert_eq!(CapType::ReadOnlyCapPage, CapType::CapPage.weaken());
        assert_eq!(CapType::Activity, CapType::ActivityControl.weaken());
    }

    #[test]
    fn test_weak_types() {
        let weak: Vec<_> = CapType::ALL.iter().filter(|t| t.is_weak()).collect();
        assert_eq!(3, weak.len());
        for t in weak {
            assert_eq!(*t, t.weaken());
            assert_ne!(*t, t.strengthen());
        }
    }

    #[test]
    fn test_types_compatible() {
        let mut pairs = 0;
        for a in CapType::ALL.iter().copied() {
            for b in CapType::ALL.iter().copied() {
                if a != b && CapType::compatible(a, b) {
                    pairs += 1;
                }
            }
        }
        // Three unordered pairs, counted in both orders.
        assert_eq!(6, pairs);
        assert!(!CapType::compatible(CapType::Page, CapType::CapPage));
        assert!(CapType::compatible(CapType::ReadOnlyPage, CapType::Page));
    }

    #[test]
    fn test_cap_type_raw() {
        for t in CapType::ALL.iter().copied() {
            assert_eq!(Ok(t), CapType::try_from(t as u64));
        }
        assert_eq!(Err(Error::InvalidArgument), CapType::try_from(10));
    }

    #[test]
    fn test_object_policy_raw() {
        for policy in [
            ObjectPolicy::new(true, OBJECT_PRIORITY_MIN),
            ObjectPolicy::new(false, OBJECT_PRIORITY_MAX),
            ObjectPolicy::default(),
        ] {
            assert_eq!(Ok(policy), ObjectPolicy::from_raw(policy.to_raw()));
        }
        assert!(ObjectPolicy::from_raw(100).is_err());
        assert!(ObjectPolicy::from_raw(1 << 12).is_err());
    }
}
