/*!
Fixed size object pools

A [`Slab`] hands out boxed objects of one type and takes them back for
reuse. Objects are constructed in bursts when the pool runs dry and
destroyed only when the pool is reaped, so the constructor and
destructor run once per object lifetime in the pool rather than once
per allocation.

Constructor failures are reported to the allocating caller. The object
that failed is handed to the destructor before it is dropped, so a
constructor must leave the object in a state the destructor can handle.
*/
use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Constructor run on every object as the pool grows.
pub type Constructor<T, E> = Box<dyn Fn(&mut T) -> Result<(), E> + Send + Sync>;
/// Destructor run on every object as the pool shrinks.
pub type Destructor<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// A pool of `T`s. See module level documentation.
pub struct Slab<T, E = ()> {
    free: Mutex<Vec<Box<T>>>,
    /// Number of objects to construct whenever the pool is empty.
    burst: usize,
    /// Objects currently handed out.
    in_use: AtomicUsize,
    constructor: Option<Constructor<T, E>>,
    destructor: Option<Destructor<T>>,
}

impl<T, E> core::fmt::Debug for Slab<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slab")
            .field("free", &self.free.lock().len())
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .field("burst", &self.burst)
            .finish()
    }
}

impl<T: Default, E> Slab<T, E> {
    /// Create an empty pool which grows by `burst` objects at a time.
    pub fn new(burst: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            burst: burst.max(1),
            in_use: AtomicUsize::new(0),
            constructor: None,
            destructor: None,
        }
    }

    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&mut T) -> Result<(), E> + Send + Sync + 'static,
    {
        self.constructor = Some(Box::new(constructor));
        self
    }

    pub fn with_destructor<F>(mut self, destructor: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.destructor = Some(Box::new(destructor));
        self
    }

    fn destroy(&self, object: &mut T) {
        if let Some(destructor) = &self.destructor {
            destructor(object);
        }
    }

    /// Construct a burst of objects into `free`.
    fn grow(&self, free: &mut Vec<Box<T>>) -> Result<(), E> {
        free.reserve(self.burst);
        for _ in 0..self.burst {
            let mut object = Box::new(T::default());
            if let Some(constructor) = &self.constructor {
                if let Err(error) = constructor(&mut object) {
                    self.destroy(&mut object);
                    return Err(error);
                }
            }
            free.push(object);
        }
        Ok(())
    }

    /// Take an object out of the pool, growing it if necessary.
    pub fn alloc(&self) -> Result<Box<T>, E> {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.grow(&mut free)?;
        }
        match free.pop() {
            Some(object) => {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                Ok(object)
            }
            // `grow` either fails or pushes at least one object.
            None => unreachable!("slab grew without producing an object"),
        }
    }

    /// Return an object to the pool. It is not destroyed until the next reap.
    pub fn dealloc(&self, object: Box<T>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(object);
    }

    /// Destroy every object sitting in the pool. Returns how many went.
    pub fn reap(&self) -> usize {
        let reaped: Vec<Box<T>> = core::mem::take(&mut *self.free.lock());
        let count = reaped.len();
        for mut object in reaped {
            self.destroy(&mut object);
        }
        count
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl<T, E> Drop for Slab<T, E> {
    fn drop(&mut self) {
        let free = core::mem::take(self.free.get_mut());
        if let Some(destructor) = &self.destructor {
            for mut object in free {
                destructor(&mut object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counted {
        constructed: bool,
        value: u32,
    }

    #[test]
    fn test_alloc_grows_in_bursts() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = constructed.clone();
        let slab: Slab<Counted> = Slab::new(4).with_constructor(move |object: &mut Counted| {
            counter.fetch_add(1, Ordering::SeqCst);
            object.constructed = true;
            Ok(())
        });

        let first = slab.alloc().unwrap();
        assert!(first.constructed);
        assert_eq!(4, constructed.load(Ordering::SeqCst));
        assert_eq!(3, slab.free_count());
        assert_eq!(1, slab.in_use());

        let others: Vec<_> = (0..3).map(|_| slab.alloc().unwrap()).collect();
        assert_eq!(4, constructed.load(Ordering::SeqCst));
        let _fifth = slab.alloc().unwrap();
        assert_eq!(8, constructed.load(Ordering::SeqCst));

        slab.dealloc(first);
        for object in others {
            slab.dealloc(object);
        }
        assert_eq!(1, slab.in_use());
    }

    #[test]
    fn test_dealloc_reuses_object() {
        let slab: Slab<Counted> = Slab::new(1);
        let mut object = slab.alloc().unwrap();
        object.value = 7;
        slab.dealloc(object);
        let again = slab.alloc().unwrap();
        assert_eq!(7, again.value);
    }

    #[test]
    fn test_constructor_failure_runs_destructor() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let slab: Slab<Counted, &'static str> = Slab::new(2)
            .with_constructor(|_| Err("no memory"))
            .with_destructor(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert_eq!(Err("no memory"), slab.alloc().map(|_| ()));
        assert_eq!(1, destroyed.load(Ordering::SeqCst));
        assert_eq!(0, slab.in_use());
    }

    #[test]
    fn test_reap_destroys_free_objects() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let slab: Slab<Counted> = Slab::new(3).with_destructor(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let object = slab.alloc().unwrap();
        assert_eq!(2, slab.reap());
        assert_eq!(2, destroyed.load(Ordering::SeqCst));

        slab.dealloc(object);
        core::mem::drop(slab);
        assert_eq!(3, destroyed.load(Ordering::SeqCst));
    }
}
