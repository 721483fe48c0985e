/*!
Activity policies and statistics

An activity is charged for the storage it allocates. Its parent
arbitrates between its children using each child's sibling relative
policy; the activity itself arbitrates between its own allocations and
those of its children using its child relative policy.
*/
use crate::error::{Error, Result};

/// Number of statistics periods an activity keeps and `activity_info`
/// returns.
pub const ACTIVITY_STATS_PERIODS: usize = 2;

/// Priority and weight of one side of an arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityMemoryPolicy {
    pub priority: i16,
    pub weight: u16,
}

impl Default for ActivityMemoryPolicy {
    fn default() -> Self {
        Self {
            priority: 0,
            weight: 1,
        }
    }
}

impl ActivityMemoryPolicy {
    pub fn to_raw(&self) -> u64 {
        (self.priority as u16 as u64) | (self.weight as u64) << 16
    }

    pub fn from_raw(raw: u64) -> Result<Self> {
        if raw >> 32 != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            priority: raw as u16 as i16,
            weight: (raw >> 16) as u16,
        })
    }
}

/// The policy of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActivityPolicy {
    /// Used by the parent to arbitrate among its children.
    pub sibling_rel: ActivityMemoryPolicy,
    /// Used to arbitrate between this activity and its children.
    pub child_rel: ActivityMemoryPolicy,
    /// Maximum number of folios, including those of descendants. Zero
    /// means unlimited.
    pub folios: u32,
}

bitflags! {
    /// Which policy fields `activity_policy` changes.
    #[derive(Default)]
    pub struct ActivityPolicyFlags: u32 {
        const CHILD_REL_PRIORITY_SET = 1 << 0;
        const CHILD_REL_WEIGHT_SET = 1 << 1;
        const SIBLING_REL_PRIORITY_SET = 1 << 2;
        const SIBLING_REL_WEIGHT_SET = 1 << 3;
        const STORAGE_SET = 1 << 4;

        const CHILD_REL_SET = Self::CHILD_REL_PRIORITY_SET.bits | Self::CHILD_REL_WEIGHT_SET.bits;
        const SIBLING_REL_SET = Self::SIBLING_REL_PRIORITY_SET.bits | Self::SIBLING_REL_WEIGHT_SET.bits;
        /// Fields only an activity control capability may change.
        const CONTROL = Self::SIBLING_REL_SET.bits | Self::STORAGE_SET.bits;
    }
}

impl ActivityPolicy {
    /// Copy the fields selected by `flags` from `update`.
    pub fn apply(&mut self, flags: ActivityPolicyFlags, update: &ActivityPolicy) {
        if flags.contains(ActivityPolicyFlags::CHILD_REL_PRIORITY_SET) {
            self.child_rel.priority = update.child_rel.priority;
        }
        if flags.contains(ActivityPolicyFlags::CHILD_REL_WEIGHT_SET) {
            self.child_rel.weight = update.child_rel.weight;
        }
        if flags.contains(ActivityPolicyFlags::SIBLING_REL_PRIORITY_SET) {
            self.sibling_rel.priority = update.sibling_rel.priority;
        }
        if flags.contains(ActivityPolicyFlags::SIBLING_REL_WEIGHT_SET) {
            self.sibling_rel.weight = update.sibling_rel.weight;
        }
        if flags.contains(ActivityPolicyFlags::STORAGE_SET) {
            self.folios = update.folios;
        }
    }
}

/// One period's sample of an activity's memory use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActivityStats {
    /// The period this sample was taken in.
    pub period: u32,
    /// Folios the activity could still allocate.
    pub available: u32,
    /// Memory pressure, 0 (none) to 100 (quota exhausted).
    pub pressure: u8,
    pub clean: u32,
    pub dirty: u32,
    pub pending_eviction: u32,
    /// Pages referenced during the period.
    pub active: u32,
    /// Pages not referenced during the period.
    pub inactive: u32,
    /// Pages evicted during the period.
    pub evicted: u32,
    /// Pages discarded during the period.
    pub discarded: u32,
}

impl ActivityStats {
    /// Number of words in the marshalled form.
    pub const WORDS: usize = 5;

    pub fn to_words(&self) -> [u64; Self::WORDS] {
        [
            self.period as u64 | (self.available as u64) << 32,
            self.pressure as u64 | (self.pending_eviction as u64) << 32,
            self.clean as u64 | (self.dirty as u64) << 32,
            self.active as u64 | (self.inactive as u64) << 32,
            self.evicted as u64 | (self.discarded as u64) << 32,
        ]
    }

    pub fn from_words(words: [u64; Self::WORDS]) -> Self {
        Self {
            period: words[0] as u32,
            available: (words[0] >> 32) as u32,
            pressure: words[1] as u8,
            pending_eviction: (words[1] >> 32) as u32,
            clean: words[2] as u32,
            dirty: (words[2] >> 32) as u32,
            active: words[3] as u32,
            inactive: (words[3] >> 32) as u32,
            evicted: words[4] as u32,
            discarded: (words[4] >> 32) as u32,
        }
    }
}

bitflags! {
    /// What `activity_info` reports.
    #[derive(Default)]
    pub struct ActivityInfoFlags: u32 {
        /// Statistics for periods at or after `until_period`.
        const STATS = 1 << 0;
        /// Report once the activity is under memory pressure.
        const PRESSURE = 1 << 1;
    }
}

/// Reply of `activity_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityInfo {
    /// The most recent samples, newest first.
    Stats {
        count: u8,
        stats: [ActivityStats; ACTIVITY_STATS_PERIODS],
    },
    /// The activity is under pressure of the given amount.
    Pressure { amount: u8 },
}

impl ActivityInfo {
    /// The valid samples of a `Stats` reply.
    pub fn samples(&self) -> &[ActivityStats] {
        match self {
            ActivityInfo::Stats { count, stats } => &stats[..(*count as usize).min(stats.len())],
            ActivityInfo::Pressure { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_only_flagged_fields() {
        let mut policy = ActivityPolicy::default();
        let update = ActivityPolicy {
            sibling_rel: ActivityMemoryPolicy {
                priority: -2,
                weight: 9,
            },
            child_rel: ActivityMemoryPolicy {
                priority: 4,
                weight: 5,
            },
            folios: 100,
        };

        policy.apply(ActivityPolicyFlags::CHILD_REL_WEIGHT_SET, &update);
        assert_eq!(5, policy.child_rel.weight);
        assert_eq!(0, policy.child_rel.priority);
        assert_eq!(ActivityMemoryPolicy::default(), policy.sibling_rel);
        assert_eq!(0, policy.folios);

        policy.apply(ActivityPolicyFlags::all(), &update);
        assert_eq!(update, policy);
    }

    #[test]
    fn test_control_flags() {
        assert!(ActivityPolicyFlags::CONTROL.contains(ActivityPolicyFlags::STORAGE_SET));
        assert!(ActivityPolicyFlags::CONTROL.contains(ActivityPolicyFlags::SIBLING_REL_WEIGHT_SET));
        assert!(!ActivityPolicyFlags::CONTROL.intersects(ActivityPolicyFlags::CHILD_REL_SET));
    }

    #[test]
    fn test_stats_words() {
        let stats = ActivityStats {
            period: 7,
            available: 12,
            pressure: 40,
            clean: 1,
            dirty: 2,
            pending_eviction: 3,
            active: 4,
            inactive: 5,
            evicted: 6,
            discarded: 8,
        };
        assert_eq!(stats, ActivityStats::from_words(stats.to_words()));
    }

    #[test]
    fn test_memory_policy_raw() {
        let policy = ActivityMemoryPolicy {
            priority: -7,
            weight: 300,
        };
        assert_eq!(Ok(policy), ActivityMemoryPolicy::from_raw(policy.to_raw()));
        assert!(ActivityMemoryPolicy::from_raw(1 << 40).is_err());
    }
}
