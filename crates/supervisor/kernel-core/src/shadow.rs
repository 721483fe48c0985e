/*!
Translation cache

Address space walks are memoized per thread, address and lookup mode.
Each entry remembers the path the walk took: every slot it read and
every object it passed through. A slot write that changes the
capability in a slot, or the destruction of an object, drops every
entry whose path contains that slot or object (a shootdown). Entries
are evicted oldest first once the cache is full.
*/
use alloc::{collections::VecDeque, vec::Vec};

use viengoos_abi::addr::Addr;

use crate::{
    aspace::{Lookup, LookupMode, SlotLoc},
    object::Oid,
};

/// The slots and objects a walk went through.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Path {
    pub(crate) slots: Vec<SlotLoc>,
    pub(crate) objects: Vec<Oid>,
}

impl Path {
    fn contains_slot(&self, slot: &SlotLoc) -> bool {
        self.slots.iter().any(|s| s == slot)
    }

    fn contains_object(&self, oid: Oid) -> bool {
        self.objects.contains(&oid) || self.slots.iter().any(|slot| slot.container() == oid)
    }
}

#[derive(Debug)]
struct Entry {
    thread: Oid,
    addr: Addr,
    mode: LookupMode,
    result: Lookup,
    path: Path,
}

#[derive(Debug, CopyGetters)]
pub struct ShadowCache {
    entries: VecDeque<Entry>,
    #[getset(get_copy = "pub")]
    capacity: usize,
    #[getset(get_copy = "pub")]
    hits: u64,
    #[getset(get_copy = "pub")]
    misses: u64,
    /// Entries dropped by shootdowns.
    #[getset(get_copy = "pub")]
    shot_down: u64,
}

impl ShadowCache {
    pub fn new(capacity: usize) -> ShadowCache {
        ShadowCache {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
            shot_down: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, thread: Oid, addr: Addr, mode: LookupMode) -> Option<Lookup> {
        let found = self
            .entries
            .iter()
            .find(|e| e.thread == thread && e.addr == addr && e.mode == mode)
            .map(|e| e.result);
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    pub fn insert(&mut self, thread: Oid, addr: Addr, mode: LookupMode, result: Lookup, path: Path) {
        if self.capacity == 0 {
            return;
        }
        self.entries
            .retain(|e| !(e.thread == thread && e.addr == addr && e.mode == mode));
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            thread,
            addr,
            mode,
            result,
            path,
        });
    }

    fn drop_where(&mut self, hit: impl Fn(&Path) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !hit(&e.path));
        let dropped = before - self.entries.len();
        self.shot_down += dropped as u64;
        dropped
    }

    /// Drop every entry whose walk read `slot`.
    pub fn shootdown_slot(&mut self, slot: &SlotLoc) -> usize {
        let dropped = self.drop_where(|path| path.contains_slot(slot));
        if dropped > 0 {
            trace!("shootdown of {:?}: {} entries", slot, dropped);
        }
        dropped
    }

    /// Drop every entry whose walk passed through `oid` or one of its
    /// slots.
    pub fn shootdown_object(&mut self, oid: Oid) -> usize {
        let dropped = self.drop_where(|path| path.contains_object(oid));
        if dropped > 0 {
            trace!("shootdown of {}: {} entries", oid, dropped);
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::Capability;

    fn slot(index: usize) -> SlotLoc {
        SlotLoc::CapPage {
            oid: Oid::object(0, 2),
            version: 0,
            index,
        }
    }

    fn lookup() -> Lookup {
        Lookup {
            cap: Capability::VOID,
            slot: None,
            writable: true,
        }
    }

    fn path(slots: &[SlotLoc], objects: &[Oid]) -> Path {
        Path {
            slots: slots.to_vec(),
            objects: objects.to_vec(),
        }
    }

    #[test]
    fn test_hits_and_misses() {
        let mut cache = ShadowCache::new(4);
        let thread = Oid::object(0, 1);
        let addr = Addr::from_bits(1, 8);
        assert!(cache.get(thread, addr, LookupMode::Object).is_none());
        cache.insert(thread, addr, LookupMode::Object, lookup(), Path::default());
        assert!(cache.get(thread, addr, LookupMode::Object).is_some());
        assert!(cache.get(thread, addr, LookupMode::Slot).is_none());
        assert_eq!((1, 2), (cache.hits(), cache.misses()));
    }

    #[test]
    fn test_oldest_entries_evicted() {
        let mut cache = ShadowCache::new(2);
        let thread = Oid::object(0, 1);
        for bits in 0..3 {
            let addr = Addr::from_bits(bits, 8);
            cache.insert(thread, addr, LookupMode::Object, lookup(), Path::default());
        }
        assert_eq!(2, cache.len());
        assert!(cache.get(thread, Addr::from_bits(0, 8), LookupMode::Object).is_none());
        assert!(cache.get(thread, Addr::from_bits(2, 8), LookupMode::Object).is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = ShadowCache::new(0);
        cache.insert(Oid::object(0, 1), Addr::VOID_ROOT, LookupMode::Slot, lookup(), Path::default());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shootdowns() {
        let mut cache = ShadowCache::new(8);
        let thread = Oid::object(0, 1);
        let page = Oid::object(1, 0);
        cache.insert(thread, Addr::from_bits(1, 8), LookupMode::Object, lookup(), path(&[slot(1)], &[]));
        cache.insert(thread, Addr::from_bits(2, 8), LookupMode::Object, lookup(), path(&[slot(2)], &[page]));
        cache.insert(thread, Addr::from_bits(3, 8), LookupMode::Object, lookup(), path(&[slot(3)], &[]));

        assert_eq!(1, cache.shootdown_slot(&slot(1)));
        assert_eq!(1, cache.shootdown_object(page));
        assert_eq!(0, cache.shootdown_slot(&slot(1)));
        // Destroying the cappage drops everything read from its slots.
        assert_eq!(1, cache.shootdown_object(Oid::object(0, 2)));
        assert!(cache.is_empty());
        assert_eq!(3, cache.shot_down());
    }
}
