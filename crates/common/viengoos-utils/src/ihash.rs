/*!
Integer keyed hash table

Maps `u64` keys to values with open addressing and quadratic
(triangular) probing over a power of two sized table. Removal leaves a
tombstone so that probe chains stay intact; tombstones are dropped on
the next resize.

Two extras make the table useful for capability bookkeeping:

* A location handle ([`Locp`]) returned by [`IHash::insert`] lets the
  owner remove the entry later without hashing the key again. A handle
  is only good until the table is resized; stale handles are detected
  and rejected.
* An optional cleanup hook runs on every value leaving the table,
  whether by [`IHash::remove`], replacement, [`IHash::clear`] or drop.
*/
use alloc::{boxed::Box, vec::Vec};
use core::mem;

pub type Key = u64;

/// Smallest table the hash grows to on first insertion.
const MIN_SIZE: usize = 8;
/// Grow when live entries plus tombstones exceed this percentage.
const MAX_LOAD_PERCENT: usize = 75;

/// Hook run on each value as it leaves the table.
pub type Cleanup<V> = Box<dyn FnMut(Key, &mut V) + Send>;

enum Slot<V> {
    Empty,
    Deleted,
    Full(Key, V),
}

/// Fast removal handle for an entry. See module level documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locp {
    index: usize,
    generation: u32,
}

/// An integer keyed hash table.
pub struct IHash<V> {
    slots: Vec<Slot<V>>,
    items: usize,
    tombstones: usize,
    /// Bumped whenever slots move, invalidating outstanding [`Locp`]s.
    generation: u32,
    cleanup: Option<Cleanup<V>>,
}

impl<V> Default for IHash<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> core::fmt::Debug for IHash<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IHash")
            .field("items", &self.items)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

#[inline]
fn hash(key: Key) -> usize {
    // Fibonacci hashing; the high bits are the best mixed.
    (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

impl<V> IHash<V> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            items: 0,
            tombstones: 0,
            generation: 0,
            cleanup: None,
        }
    }

    /// Create a table which runs `cleanup` on every value removed from it.
    pub fn with_cleanup<F>(cleanup: F) -> Self
    where
        F: FnMut(Key, &mut V) + Send + 'static,
    {
        let mut table = Self::new();
        table.cleanup = Some(Box::new(cleanup));
        table
    }

    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Find the slot index holding `key`.
    fn probe(&self, key: Key) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let start = hash(key);
        for i in 0..self.slots.len() {
            let index = (start + i * (i + 1) / 2) & mask;
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Full(k, _) if *k == key => return Some(index),
                _ => {}
            }
        }
        None
    }

    /// Find the first free (empty or deleted) slot for `key`. The caller
    /// guarantees `key` is not present and the table has room.
    fn probe_free(&self, key: Key) -> usize {
        let mask = self.slots.len() - 1;
        let start = hash(key);
        for i in 0..self.slots.len() {
            let index = (start + i * (i + 1) / 2) & mask;
            if !matches!(self.slots[index], Slot::Full(..)) {
                return index;
            }
        }
        // Triangular probing visits every slot of a power of two table.
        unreachable!("hash table has no free slot despite load limit")
    }

    fn needs_grow(&self) -> bool {
        self.slots.is_empty()
            || (self.items + self.tombstones + 1) * 100 > self.slots.len() * MAX_LOAD_PERCENT
    }

    fn resize(&mut self) {
        let mut new_size = MIN_SIZE.max(self.slots.len());
        while (self.items + 1) * 100 > new_size * MAX_LOAD_PERCENT / 2 {
            new_size *= 2;
        }

        let mut fresh = Vec::with_capacity(new_size);
        fresh.resize_with(new_size, || Slot::Empty);
        let old = mem::replace(&mut self.slots, fresh);
        self.tombstones = 0;
        self.generation = self.generation.wrapping_add(1);

        for slot in old {
            if let Slot::Full(key, value) = slot {
                let index = self.probe_free(key);
                self.slots[index] = Slot::Full(key, value);
            }
        }
    }

    fn run_cleanup(&mut self, key: Key, value: &mut V) {
        if let Some(cleanup) = self.cleanup.as_mut() {
            cleanup(key, value);
        }
    }

    /// Insert `value` under `key`, replacing (and cleaning up) any value
    /// already stored there. Returns a location handle for the entry.
    pub fn insert(&mut self, key: Key, value: V) -> Locp {
        if let Some(index) = self.probe(key) {
            let old = mem::replace(&mut self.slots[index], Slot::Full(key, value));
            if let Slot::Full(_, mut old_value) = old {
                self.run_cleanup(key, &mut old_value);
            }
            return Locp {
                index,
                generation: self.generation,
            };
        }

        if self.needs_grow() {
            self.resize();
        }

        let index = self.probe_free(key);
        if matches!(self.slots[index], Slot::Deleted) {
            self.tombstones -= 1;
        }
        self.slots[index] = Slot::Full(key, value);
        self.items += 1;
        Locp {
            index,
            generation: self.generation,
        }
    }

    pub fn find(&self, key: Key) -> Option<&V> {
        self.probe(key).and_then(|index| match &self.slots[index] {
            Slot::Full(_, value) => Some(value),
            _ => None,
        })
    }

    pub fn find_mut(&mut self, key: Key) -> Option<&mut V> {
        match self.probe(key) {
            Some(index) => match &mut self.slots[index] {
                Slot::Full(_, value) => Some(value),
                _ => None,
            },
            None => None,
        }
    }

    pub fn contains_key(&self, key: Key) -> bool {
        self.probe(key).is_some()
    }

    fn take(&mut self, index: usize) -> Option<V> {
        match mem::replace(&mut self.slots[index], Slot::Deleted) {
            Slot::Full(key, mut value) => {
                self.items -= 1;
                self.tombstones += 1;
                self.run_cleanup(key, &mut value);
                Some(value)
            }
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Remove `key`. The cleanup hook has run on the value by the time it
    /// is returned.
    pub fn remove(&mut self, key: Key) -> Option<V> {
        let index = self.probe(key)?;
        self.take(index)
    }

    /// Remove the entry at a location handle. Returns `None` if the handle
    /// predates a resize or the entry is already gone.
    pub fn locp_remove(&mut self, locp: Locp) -> Option<V> {
        if locp.generation != self.generation || locp.index >= self.slots.len() {
            return None;
        }
        self.take(locp.index)
    }

    /// Remove every entry, running the cleanup hook on each.
    pub fn clear(&mut self) {
        let old = mem::take(&mut self.slots);
        self.items = 0;
        self.tombstones = 0;
        self.generation = self.generation.wrapping_add(1);
        for slot in old {
            if let Slot::Full(key, mut value) = slot {
                self.run_cleanup(key, &mut value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &V)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full(key, value) => Some((*key, value)),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|(key, _)| key)
    }
}

impl<V> Drop for IHash<V> {
    fn drop(&mut self) {
        if self.cleanup.is_some() {
            self.clear();
        }
    }
}
