/*!
Unlock, relock, revalidate

Two locks with a fixed order (inner before outer) sometimes need to be
taken starting from the outer one: a client table entry names an object,
and tearing the entry down needs the object's lock. The way out is to
read what is needed under the outer lock, let it go, take the inner lock
and then take the outer lock again, checking that nothing changed in
between.

[`OptimisticHandle`] packages that dance. [`OptimisticHandle::acquire`]
reads a stamp and a provisional reference under the outer lock and
releases it. The caller then takes its inner lock through the
provisional reference and calls [`OptimisticHandle::commit`], which
relocks the outer lock and applies the change only if the stamp still
matches.
*/
use spin::Mutex;

/// A stamp taken under a lock, to be checked when it is retaken.
#[must_use = "an optimistic handle does nothing unless committed"]
pub struct OptimisticHandle<'a, O, S> {
    outer: &'a Mutex<O>,
    stamp: S,
}

impl<'a, O, S: PartialEq> OptimisticHandle<'a, O, S> {
    /// Run `probe` under `outer`'s lock. `probe` returns the stamp to
    /// revalidate against later and a provisional reference for the
    /// caller. The lock is released before this returns.
    pub fn acquire<P>(outer: &'a Mutex<O>, probe: impl FnOnce(&mut O) -> Option<(S, P)>) -> Option<(Self, P)> {
        let (stamp, provisional) = probe(&mut outer.lock())?;
        Some((Self { outer, stamp }, provisional))
    }

    pub fn stamp(&self) -> &S {
        &self.stamp
    }

    /// Relock the outer lock. If `current` still reports the stamp taken
    /// by [`acquire`](Self::acquire), run `commit` under the lock and
    /// return its result. Otherwise return `None` and change nothing.
    pub fn commit<R>(self, current: impl FnOnce(&O) -> Option<S>, commit: impl FnOnce(&mut O) -> R) -> Option<R> {
        let mut outer = self.outer.lock();
        if current(&outer).as_ref() == Some(&self.stamp) {
            Some(commit(&mut outer))
        } else {
            None
        }
    }
}
