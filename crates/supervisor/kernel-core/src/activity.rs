/*!
Activities

An activity is the principal storage is charged to. Activities form a
tree rooted at the activity bootstrap creates; every folio is charged to
its owner and to all of the owner's ancestors, and a quota anywhere on
that chain caps the whole subtree.

Periodically the sampler ([`Kernel::sample_activities`]) records a
statistics sample per activity and wakes callers of `activity_info`
waiting for it.
*/
use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;
use viengoos_abi::{
    activity::{
        ActivityInfo, ActivityInfoFlags, ActivityPolicy, ActivityPolicyFlags, ActivityStats,
        ACTIVITY_STATS_PERIODS,
    },
    cap::CapType,
    error::{Error, Result},
    rpc,
};

use crate::{
    cap::Capability,
    kernel::WaitLocked,
    object::{MetaFlags, Oid},
    wait_queue::WaitReason,
    Kernel,
};

/// Bound on the depth of the activity tree, used to catch cycles.
const MAX_ACTIVITY_DEPTH: usize = 1 << 16;

#[derive(Debug, CopyGetters)]
pub struct Activity {
    /// `None` for the root activity.
    #[getset(get_copy = "pub")]
    parent: Option<Oid>,
    pub(crate) children: Vec<Oid>,
    #[getset(get_copy = "pub")]
    policy: ActivityPolicy,
    /// Folios charged, including those of descendants.
    #[getset(get_copy = "pub")]
    folio_count: u32,
    /// Head of the list of folios this activity owns.
    pub(crate) folios: Option<usize>,
    /// Most recent samples, newest first.
    stats: [ActivityStats; ACTIVITY_STATS_PERIODS],
    samples: usize,
    #[getset(get_copy = "pub")]
    period: u32,
    /// Pages discarded since the last sample.
    pub(crate) discarded: u32,
}

impl Activity {
    pub fn new(parent: Option<Oid>, policy: ActivityPolicy) -> Activity {
        Activity {
            parent,
            children: Vec::new(),
            policy,
            folio_count: 0,
            folios: None,
            stats: Default::default(),
            samples: 0,
            period: 0,
            discarded: 0,
        }
    }

    /// Whether one more folio fits under this activity's own quota.
    pub fn has_room(&self) -> bool {
        self.policy.folios == 0 || self.folio_count < self.policy.folios
    }

    pub fn latest(&self) -> Option<&ActivityStats> {
        self.stats[..self.samples].first()
    }

    fn record(&mut self, sample: ActivityStats) {
        self.stats.rotate_right(1);
        self.stats[0] = sample;
        self.samples = (self.samples + 1).min(ACTIVITY_STATS_PERIODS);
    }

    /// The recorded samples, newest first.
    pub fn info(&self) -> ActivityInfo {
        ActivityInfo::Stats {
            count: self.samples as u8,
            stats: self.stats,
        }
    }

    pub fn pressure(&self) -> u8 {
        self.latest().map_or(0, |stats| stats.pressure)
    }
}

impl Kernel {
    /// The activity `oid` and its ancestors, nearest first.
    fn activity_chain(&self, oid: Oid) -> Vec<Arc<Mutex<Activity>>> {
        let mut chain = Vec::new();
        let mut next = Some(oid);
        while let Some(oid) = next {
            invariant!(
                chain.len() < MAX_ACTIVITY_DEPTH,
                "activity tree through {} does not end",
                oid
            );
            let activity = match self.activity_by_oid(oid) {
                Some(activity) => activity,
                None => break,
            };
            next = activity.lock().parent;
            chain.push(activity);
        }
        chain
    }

    /// `OutOfResources` if charging one folio to `oid` would exceed a
    /// quota on its chain.
    pub(crate) fn quota_check(&self, oid: Oid) -> Result<()> {
        if self.activity_chain(oid).iter().all(|a| a.lock().has_room()) {
            Ok(())
        } else {
            Err(Error::OutOfResources)
        }
    }

    pub(crate) fn charge(&self, oid: Oid, folios: u32) {
        for activity in self.activity_chain(oid) {
            activity.lock().folio_count += folios;
        }
    }

    pub(crate) fn uncharge(&self, oid: Oid, folios: u32) {
        for activity in self.activity_chain(oid) {
            let mut activity = activity.lock();
            if activity.folio_count < folios {
                debug_panic!("activity uncharged below zero");
            }
            activity.folio_count = activity.folio_count.saturating_sub(folios);
        }
    }

    /// Release everything an activity holds: its folios, its children
    /// and its place in its parent.
    pub(crate) fn activity_teardown(
        &self,
        locked: &WaitLocked<'_>,
        oid: Oid,
        activity: &Arc<Mutex<Activity>>,
        return_code: u64,
    ) {
        loop {
            let head = activity.lock().folios;
            let index = match head {
                Some(index) => index,
                None => break,
            };
            self.folio_release(locked, index, return_code);
            invariant!(
                activity.lock().folios != Some(index),
                "folio {} stuck on the list of {}",
                index,
                oid
            );
        }

        let children = core::mem::take(&mut activity.lock().children);
        for child in children {
            self.destroy_object(locked, child, return_code);
        }

        let (parent, remaining) = {
            let activity = activity.lock();
            (activity.parent, activity.folio_count)
        };
        if remaining != 0 {
            debug_panic!("destroyed activity {} still charged {} folios", oid, remaining);
        }
        if let Some(parent) = parent.and_then(|parent| self.activity_by_oid(parent)) {
            parent.lock().children.retain(|child| *child != oid);
        }
    }

    /// Get and set the policy of `activity`. Returns the policy as it
    /// was before the update.
    pub fn activity_policy(
        &self,
        activity: &Capability,
        flags: ActivityPolicyFlags,
        policy: &ActivityPolicy,
    ) -> Result<ActivityPolicy> {
        let locked = self.lock();
        self.activity_policy_locked(&locked, activity, flags, policy)
    }

    pub(crate) fn activity_policy_locked(
        &self,
        _locked: &WaitLocked<'_>,
        activity: &Capability,
        flags: ActivityPolicyFlags,
        policy: &ActivityPolicy,
    ) -> Result<ActivityPolicy> {
        let (object, activity) = self.activity_object(activity)?;
        if flags.intersects(ActivityPolicyFlags::CONTROL)
            && object.cap_type != CapType::ActivityControl
        {
            return Err(Error::PermissionDenied);
        }
        let mut activity = activity.lock();
        let old = activity.policy;
        activity.policy.apply(flags, policy);
        Ok(old)
    }

    /// Report statistics or pressure of `activity`.
    ///
    /// When there is nothing to report yet, the reply is deferred: the
    /// `reply` messenger is queued on the activity and completed by the
    /// sampler. `Ok(None)` means the reply was deferred.
    pub fn activity_info(
        &self,
        activity: &Capability,
        flags: ActivityInfoFlags,
        until_period: u32,
        reply: Option<&Capability>,
    ) -> Result<Option<ActivityInfo>> {
        let locked = self.lock();
        let reply = match reply {
            Some(reply) => Some(self.idle_messenger(reply)?),
            None => None,
        };
        self.activity_info_locked(&locked, activity, flags, until_period, reply)
    }

    pub(crate) fn activity_info_locked(
        &self,
        locked: &WaitLocked<'_>,
        activity: &Capability,
        flags: ActivityInfoFlags,
        until_period: u32,
        reply: Option<Oid>,
    ) -> Result<Option<ActivityInfo>> {
        let (object, activity) = self.activity_object(activity)?;
        let reason = if flags.contains(ActivityInfoFlags::STATS) {
            let activity = activity.lock();
            match activity.latest() {
                Some(latest) if latest.period >= until_period => {
                    return Ok(Some(activity.info()))
                }
                _ => WaitReason::ActivityInfo { until_period },
            }
        } else if flags.contains(ActivityInfoFlags::PRESSURE) {
            let amount = activity.lock().pressure();
            if amount > 0 {
                return Ok(Some(ActivityInfo::Pressure { amount }));
            }
            WaitReason::ActivityPressure
        } else {
            return Err(Error::InvalidArgument);
        };

        let reply = reply.ok_or(Error::WouldBlock)?;
        self.wait_enqueue(locked, object.oid, reply, reason);
        debug!("{} waits for {:?} of {}", reply, reason, object.oid);
        Ok(None)
    }

    /// Every live activity.
    fn live_activities(&self) -> Vec<(Oid, Arc<Mutex<Activity>>)> {
        let mut activities = Vec::new();
        for index in 0..self.folios.len() {
            let folio = match self.folios.get(index) {
                Some(folio) => folio,
                None => continue,
            };
            let folio = folio.lock();
            if !folio.live {
                continue;
            }
            for (object, meta) in folio.objects.iter().enumerate() {
                if meta.cap_type != CapType::ActivityControl
                    || meta.flags.contains(MetaFlags::DYING)
                {
                    continue;
                }
                if let Ok(activity) = meta.body.as_activity() {
                    activities.push((Oid::object(index, object), activity.clone()));
                }
            }
        }
        activities
    }

    /// Page counts over the folios `activity` owns, ageing the
    /// referenced bits on the way.
    fn activity_pages(&self, activity: &Arc<Mutex<Activity>>) -> ActivityStats {
        let mut stats = ActivityStats::default();
        let mut next = activity.lock().folios;
        while let Some(index) = next {
            let folio = match self.folios.get(index) {
                Some(folio) => folio,
                None => break,
            };
            let mut folio = folio.lock();
            for meta in folio.objects.iter_mut() {
                if meta.cap_type != CapType::Page || !meta.flags.contains(MetaFlags::CONTENT) {
                    continue;
                }
                if meta.flags.contains(MetaFlags::DIRTY) {
                    stats.dirty += 1;
                } else {
                    stats.clean += 1;
                }
                if meta.flags.contains(MetaFlags::REFERENCED) {
                    stats.active += 1;
                    meta.flags.remove(MetaFlags::REFERENCED);
                } else {
                    stats.inactive += 1;
                }
            }
            next = folio.next;
        }
        stats
    }

    /// Take a sample of every live activity and answer the
    /// `activity_info` callers it satisfies. Returns the number of
    /// activities sampled.
    pub fn sample_activities(&self) -> usize {
        let locked = self.lock();
        let max_folios = self.config().max_folios as u32;
        let live_folios = self.folios.live_count() as u32;
        let activities = self.live_activities();

        for (oid, activity) in activities.iter() {
            let pages = self.activity_pages(activity);
            let sample = {
                let mut activity = activity.lock();
                activity.period += 1;
                let (quota, count) = (activity.policy.folios, activity.folio_count);
                let (available, pressure) = if quota == 0 {
                    let available = max_folios.saturating_sub(live_folios);
                    (available, pressure_of(live_folios, max_folios))
                } else {
                    (quota.saturating_sub(count), pressure_of(count, quota))
                };
                let sample = ActivityStats {
                    period: activity.period,
                    available,
                    pressure,
                    discarded: core::mem::take(&mut activity.discarded),
                    ..pages
                };
                activity.record(sample);
                sample
            };
            trace!("{} sampled: {:?}", oid, sample);
            self.activity_wake(&locked, *oid, activity, &sample);
        }
        debug!("sampled {} activities", activities.len());
        activities.len()
    }

    fn activity_wake(
        &self,
        locked: &WaitLocked<'_>,
        oid: Oid,
        activity: &Arc<Mutex<Activity>>,
        sample: &ActivityStats,
    ) {
        for (messenger, reason) in self.wait_queue(oid) {
            let info = match reason {
                WaitReason::ActivityInfo { until_period } if sample.period >= until_period => {
                    activity.lock().info()
                }
                WaitReason::ActivityPressure if sample.pressure > 0 => ActivityInfo::Pressure {
                    amount: sample.pressure,
                },
                _ => continue,
            };
            self.wait_dequeue(locked, messenger);
            self.messenger_complete(locked, messenger, &rpc::reply(&Ok(info)));
        }
    }
}

/// `used` as a percentage of `limit`, capped at 100.
fn pressure_of(used: u32, limit: u32) -> u8 {
    if limit == 0 {
        return 100;
    }
    (used as u64 * 100 / limit as u64).min(100) as u8
}
