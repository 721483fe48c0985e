//! Folio constants and policies.
use crate::error::{Error, Result};

/// Number of objects in a folio.
pub const FOLIO_OBJECTS: usize = 128;

/// Priority of folios managed in plain LRU order.
pub const FOLIO_PRIORITY_LRU: i8 = 0;

/// Storage policy for a whole folio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FolioPolicy {
    pub discardable: bool,
    /// Folios of a group are paged together.
    pub group: u32,
    pub priority: i8,
}

impl Default for FolioPolicy {
    fn default() -> Self {
        Self {
            discardable: false,
            group: 0,
            priority: FOLIO_PRIORITY_LRU,
        }
    }
}

impl FolioPolicy {
    pub fn to_raw(&self) -> u64 {
        (self.priority as u8 as u64) | (self.discardable as u64) << 8 | (self.group as u64) << 32
    }

    pub fn from_raw(raw: u64) -> Result<Self> {
        if (raw >> 9) & 0x7f_ffff != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            priority: raw as u8 as i8,
            discardable: raw & (1 << 8) != 0,
            group: (raw >> 32) as u32,
        })
    }
}

bitflags! {
    /// Which fields `folio_policy` reports or changes.
    #[derive(Default)]
    pub struct FolioPolicyFlags: u32 {
        /// Return the policy as it was before this call.
        const DELIVER = 1 << 0;
        const DISCARDABLE_SET = 1 << 1;
        const GROUP_SET = 1 << 2;
        const PRIORITY_SET = 1 << 3;
    }
}

bitflags! {
    /// Paging status of an object, as reported by `object_status`.
    #[derive(Default)]
    pub struct ObjectStatus: u32 {
        const REFERENCED = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folio_policy_raw() {
        let policy = FolioPolicy {
            discardable: true,
            group: 0xdead,
            priority: -3,
        };
        assert_eq!(Ok(policy), FolioPolicy::from_raw(policy.to_raw()));
        assert_eq!(Ok(FolioPolicy::default()), FolioPolicy::from_raw(0));
        assert!(FolioPolicy::from_raw(1 << 20).is_err());
    }
}
