/*!
Capability server

A server exports objects of one [`ObjectClass`] to its clients through a
[`Bucket`]. Each client (a task) gets a table mapping the capability ids
it was handed to the objects behind them; the same object handed to the
same client twice reuses one id and counts external references.

# Locking

Every object has its own lock over its reference count, its alive flag
and its data. Every client has its own lock over its table. The order is
object, then client: a client lock is never held while an object lock is
taken. Tearing a table entry down starts from the client side, so it
goes through [`OptimisticHandle`]: read the entry, drop the client lock,
lock the object, relock the client and check the entry is unchanged.

The last reference to an object is dropped optimistically: the dropper
marks the object dying, lets its lock go, then retakes it and frees the
object only if nobody took a new reference in the meantime.
*/
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};
use viengoos_abi::{
    error::{Error, Result},
    message::Message,
};
use viengoos_utils::{ihash::IHash, slab::Slab};

use crate::revalidate::OptimisticHandle;

pub type TaskId = u64;
pub type CapId = u64;

/// Objects handed out per slab refill.
const SLAB_BURST: usize = 8;

/// Dispatches RPCs on objects of a class.
pub trait Demuxer<T>: Send + Sync {
    /// Perform method `label` on `object`. Labels the class does not
    /// know fail with `NotSupported`.
    fn demux(&self, object: &mut T, label: u64, msg: &Message) -> Result<Message>;
}

impl<T, F> Demuxer<T> for F
where
    F: Fn(&mut T, u64, &Message) -> Result<Message> + Send + Sync,
{
    fn demux(&self, object: &mut T, label: u64, msg: &Message) -> Result<Message> {
        self(object, label, msg)
    }
}

struct ObjectState<T> {
    refs: usize,
    /// Set while the last reference is being dropped.
    dying: bool,
    /// `None` once the object went back to the pool.
    data: Option<Box<T>>,
}

/// An object exported by a server.
pub struct CapObject<T> {
    id: u64,
    state: Mutex<ObjectState<T>>,
}

pub type Obj<T> = Arc<CapObject<T>>;

impl<T> CapObject<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().data.is_some()
    }

    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    /// Take a new reference, if the object is still alive. This may race
    /// with the drop of the last reference; the dropper then backs off.
    pub fn try_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.data.is_none() {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Run `f` on the object's data.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut state = self.state.lock();
        state.data.as_deref_mut().map(f).ok_or(Error::NoObject)
    }
}

impl<T> core::fmt::Debug for CapObject<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CapObject")
            .field("id", &self.id)
            .field("refs", &state.refs)
            .field("dying", &state.dying)
            .field("alive", &state.data.is_some())
            .finish()
    }
}

/// A pool of objects of one type and the RPCs they answer.
pub struct ObjectClass<T> {
    slab: Slab<T, Error>,
    reinit: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    demuxer: Box<dyn Demuxer<T>>,
    next_id: AtomicU64,
}

impl<T: Default + Send + 'static> ObjectClass<T> {
    pub fn new(demuxer: impl Demuxer<T> + 'static) -> Self {
        Self {
            slab: Slab::new(SLAB_BURST),
            reinit: None,
            demuxer: Box::new(demuxer),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `constructor` on objects as the pool grows.
    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    {
        self.slab = self.slab.with_constructor(constructor);
        self
    }

    /// Run `destructor` on objects as the pool is reaped.
    pub fn with_destructor<F>(mut self, destructor: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.slab = self.slab.with_destructor(destructor);
        self
    }

    /// Run `reinit` on every object returning to the pool.
    pub fn with_reinit<F>(mut self, reinit: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reinit = Some(Box::new(reinit));
        self
    }

    /// Allocate an object. The caller holds its only reference.
    pub fn alloc(&self) -> Result<Obj<T>> {
        let data = self.slab.alloc()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("object {} allocated", id);
        Ok(Arc::new(CapObject {
            id,
            state: Mutex::new(ObjectState {
                refs: 1,
                dying: false,
                data: Some(data),
            }),
        }))
    }

    /// Drop one reference to `obj`.
    pub fn drop_ref(&self, obj: &Obj<T>) {
        self.drop_locked(obj, obj.state.lock());
    }

    /// Drop one reference to `obj` whose lock the caller holds.
    fn drop_locked(&self, obj: &Obj<T>, mut state: MutexGuard<'_, ObjectState<T>>) {
        invariant!(state.refs > 0, "object {} dropped without a reference", obj.id);
        if state.refs > 1 {
            state.refs -= 1;
            return;
        }

        state.dying = true;
        drop(state);

        let mut state = obj.state.lock();
        state.dying = false;
        if state.refs > 1 {
            // Someone took a reference while the lock was down.
            state.refs -= 1;
            return;
        }
        state.refs = 0;
        let data = state.data.take();
        drop(state);

        if let Some(mut data) = data {
            if let Some(reinit) = &self.reinit {
                reinit(&mut data);
            }
            self.slab.dealloc(data);
            debug!("object {} destroyed", obj.id);
        }
    }

    /// Perform an RPC on `obj`.
    pub fn demux(&self, obj: &Obj<T>, label: u64, msg: &Message) -> Result<Message> {
        let mut state = obj.state.lock();
        let data = state.data.as_deref_mut().ok_or(Error::NoObject)?;
        self.demuxer.demux(data, label, msg)
    }

    /// Destroy the pooled objects nobody uses.
    pub fn reap(&self) -> usize {
        self.slab.reap()
    }

    /// Objects allocated and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.slab.in_use()
    }
}

struct Entry<T> {
    object: Obj<T>,
    /// References the client holds.
    refs: u64,
}

struct ClientTable<T> {
    caps: IHash<Entry<T>>,
    /// Object id to the client's capability id for it.
    by_object: IHash<CapId>,
    next_id: CapId,
}

impl<T> ClientTable<T> {
    /// What a revalidation compares: the object and the reference count.
    fn stamp(&self, cap_id: CapId) -> Option<(u64, u64)> {
        self.caps.find(cap_id).map(|e| (e.object.id, e.refs))
    }

    fn remove(&mut self, cap_id: CapId) -> Option<Entry<T>> {
        let entry = self.caps.remove(cap_id)?;
        self.by_object.remove(entry.object.id);
        Some(entry)
    }
}

/// A task holding capabilities of a bucket.
pub struct Client<T> {
    task: TaskId,
    table: Mutex<ClientTable<T>>,
}

impl<T> Client<T> {
    fn new(task: TaskId) -> Self {
        Self {
            task,
            table: Mutex::new(ClientTable {
                caps: IHash::new(),
                by_object: IHash::new(),
                next_id: 1,
            }),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Capability ids the client holds.
    pub fn caps(&self) -> Vec<CapId> {
        self.table.lock().caps.keys().collect()
    }
}

#[derive(Debug, Default)]
struct Gate {
    inhibited: bool,
    in_flight: usize,
}

/// The clients of one class of objects. See module level documentation.
pub struct Bucket<T> {
    class: Arc<ObjectClass<T>>,
    clients: Mutex<IHash<Arc<Client<T>>>>,
    gate: Mutex<Gate>,
}

/// An object looked up for an RPC. Holds a reference until dropped.
pub struct RpcHandle<'a, T: Default + Send + 'static> {
    bucket: &'a Bucket<T>,
    object: Obj<T>,
}

impl<'a, T: Default + Send + 'static> RpcHandle<'a, T> {
    pub fn object(&self) -> &Obj<T> {
        &self.object
    }
}

impl<'a, T: Default + Send + 'static> Drop for RpcHandle<'a, T> {
    fn drop(&mut self) {
        self.bucket.class.drop_ref(&self.object);
        self.bucket.gate.lock().in_flight -= 1;
    }
}

impl<T: Default + Send + 'static> Bucket<T> {
    pub fn new(class: Arc<ObjectClass<T>>) -> Self {
        Self {
            class,
            clients: Mutex::new(IHash::new()),
            gate: Mutex::new(Gate::default()),
        }
    }

    pub fn class(&self) -> &Arc<ObjectClass<T>> {
        &self.class
    }

    pub fn client(&self, task: TaskId) -> Option<Arc<Client<T>>> {
        self.clients.lock().find(task).cloned()
    }

    pub fn clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Give `task` a capability for `obj`. Returns the capability id,
    /// which is the one the task already holds for `obj` if any.
    pub fn inject(&self, obj: &Obj<T>, task: TaskId) -> Result<CapId> {
        let mut state = obj.state.lock();
        if state.data.is_none() {
            return Err(Error::NoObject);
        }
        let client = {
            let mut clients = self.clients.lock();
            if let Some(client) = clients.find(task) {
                client.clone()
            } else {
                let client = Arc::new(Client::new(task));
                clients.insert(task, client.clone());
                debug!("new client {}", task);
                client
            }
        };

        let mut table = client.table.lock();
        if let Some(cap_id) = table.by_object.find(obj.id).copied() {
            if let Some(entry) = table.caps.find_mut(cap_id) {
                entry.refs += 1;
                return Ok(cap_id);
            }
        }
        let cap_id = table.next_id;
        table.next_id += 1;
        table.caps.insert(
            cap_id,
            Entry {
                object: obj.clone(),
                refs: 1,
            },
        );
        table.by_object.insert(obj.id, cap_id);
        state.refs += 1;
        trace!("object {} is capability {} of client {}", obj.id, cap_id, task);
        Ok(cap_id)
    }

    /// Resolve `task`'s capability `cap_id` for an RPC.
    pub fn lookup(&self, task: TaskId, cap_id: CapId) -> Result<RpcHandle<'_, T>> {
        {
            let mut gate = self.gate.lock();
            if gate.inhibited {
                return Err(Error::WouldBlock);
            }
            gate.in_flight += 1;
        }
        let object = self.client(task).and_then(|client| {
            let table = client.table.lock();
            table.caps.find(cap_id).map(|e| e.object.clone())
        });
        match object {
            Some(object) if object.try_ref() => Ok(RpcHandle { bucket: self, object }),
            _ => {
                self.gate.lock().in_flight -= 1;
                Err(Error::NoObject)
            }
        }
    }

    /// Perform RPC `label` on `task`'s capability `cap_id`.
    pub fn handle(&self, task: TaskId, cap_id: CapId, label: u64, msg: &Message) -> Result<Message> {
        let handle = self.lookup(task, cap_id)?;
        self.class.demux(handle.object(), label, msg)
    }

    /// Drop `refs` of `task`'s references to `cap_id`. The capability
    /// goes away with its last reference.
    pub fn release(&self, task: TaskId, cap_id: CapId, refs: u64) -> Result<()> {
        let client = self.client(task).ok_or(Error::NoObject)?;
        loop {
            let (handle, object) = OptimisticHandle::acquire(&client.table, |table| {
                let stamp = table.stamp(cap_id)?;
                table.caps.find(cap_id).map(|e| (stamp, e.object.clone()))
            })
            .ok_or(Error::NoObject)?;
            let (_, held) = *handle.stamp();
            if refs > held {
                return Err(Error::InvalidArgument);
            }

            if refs < held {
                let done = handle.commit(
                    |table| table.stamp(cap_id),
                    |table| {
                        if let Some(entry) = table.caps.find_mut(cap_id) {
                            entry.refs -= refs;
                        }
                    },
                );
                if done.is_some() {
                    return Ok(());
                }
                continue;
            }

            let state = object.state.lock();
            match handle.commit(|table| table.stamp(cap_id), |table| table.remove(cap_id)) {
                Some(_) => {
                    trace!("client {} released capability {}", task, cap_id);
                    self.class.drop_locked(&object, state);
                    return Ok(());
                }
                None => continue,
            }
        }
    }

    /// Remove every entry of `client`. Returns how many went.
    fn teardown(&self, client: &Client<T>) -> usize {
        let mut removed = 0;
        loop {
            let acquired = OptimisticHandle::acquire(&client.table, |table| {
                let cap_id = table.caps.keys().next()?;
                let stamp = table.stamp(cap_id)?;
                table.caps.find(cap_id).map(|e| ((cap_id, stamp), e.object.clone()))
            });
            let (handle, object) = match acquired {
                Some(acquired) => acquired,
                None => return removed,
            };
            let (cap_id, _) = *handle.stamp();

            let state = object.state.lock();
            let committed = handle.commit(
                |table| table.stamp(cap_id).map(|stamp| (cap_id, stamp)),
                |table| table.remove(cap_id),
            );
            match committed {
                Some(_) => {
                    self.class.drop_locked(&object, state);
                    removed += 1;
                }
                // Changed under us. Look again.
                None => drop(state),
            }
        }
    }

    /// Tear down `task`'s client: every capability it holds is released.
    pub fn client_dealloc(&self, task: TaskId) -> Result<usize> {
        let client = self.clients.lock().remove(task).ok_or(Error::NoObject)?;
        let removed = self.teardown(&client);
        debug!("client {} deallocated, {} capabilities released", task, removed);
        Ok(removed)
    }

    /// `task` died. Drops its client, if it had one.
    pub fn task_death(&self, task: TaskId) -> usize {
        match self.client_dealloc(task) {
            Ok(removed) => removed,
            Err(_) => 0,
        }
    }

    /// Stop new RPCs. Fails with `OutOfResources` while RPCs are in
    /// flight.
    pub fn inhibit(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.in_flight > 0 {
            return Err(Error::OutOfResources);
        }
        gate.inhibited = true;
        Ok(())
    }

    pub fn resume(&self) {
        self.gate.lock().inhibited = false;
    }

    /// RPCs currently holding an object.
    pub fn in_flight(&self) -> usize {
        self.gate.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Default)]
    struct Counter {
        value: u64,
    }

    const GET: u64 = 1;
    const ADD: u64 = 2;

    fn counter_demux(counter: &mut Counter, label: u64, msg: &Message) -> Result<Message> {
        match label {
            GET => {}
            ADD => counter.value += msg.words().next().ok_or(Error::InvalidArgument)?,
            _ => return Err(Error::NotSupported),
        }
        let mut out = Message::new();
        out.append_word(counter.value);
        Ok(out)
    }

    fn bucket() -> Bucket<Counter> {
        let class = ObjectClass::<Counter>::new(counter_demux).with_reinit(|c: &mut Counter| c.value = 0);
        Bucket::new(Arc::new(class))
    }

    fn words(values: &[u64]) -> Message {
        let mut msg = Message::new();
        for value in values {
            msg.append_word(*value);
        }
        msg
    }

    #[test]
    fn test_inject_reuses_entry() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        let first = bucket.inject(&obj, 10).unwrap();
        let second = bucket.inject(&obj, 10).unwrap();
        let other = bucket.inject(&obj, 11).unwrap();
        assert_eq!(first, second);
        assert_eq!(1, other);
        // The server's own reference plus one per client.
        assert_eq!(3, obj.refs());
        assert_eq!(2, bucket.clients());
    }

    #[test]
    fn test_rpc_through_bucket() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        let cap = bucket.inject(&obj, 10).unwrap();
        let reply = bucket.handle(10, cap, ADD, &words(&[5])).unwrap();
        assert_eq!(5, reply.word(0));
        assert_eq!(Err(Error::NotSupported), bucket.handle(10, cap, 99, &words(&[])));
        assert_eq!(Err(Error::NoObject), bucket.handle(10, cap + 1, GET, &words(&[])));
        assert_eq!(Err(Error::NoObject), bucket.handle(11, cap, GET, &words(&[])));
        assert_eq!(0, bucket.in_flight());
    }

    #[test]
    fn test_release_drops_last_reference() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        let cap = bucket.inject(&obj, 10).unwrap();
        bucket.inject(&obj, 10).unwrap();
        bucket.class().drop_ref(&obj);

        assert_eq!(Err(Error::InvalidArgument), bucket.release(10, cap, 3));
        bucket.release(10, cap, 1).unwrap();
        assert!(obj.is_alive());
        bucket.release(10, cap, 1).unwrap();
        assert!(!obj.is_alive());
        assert_eq!(0, bucket.class().live_objects());
        assert_eq!(Err(Error::NoObject), bucket.release(10, cap, 1));
    }

    #[test]
    fn test_pool_reinitializes_objects() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        obj.with(|c| c.value = 9).unwrap();
        bucket.class().drop_ref(&obj);
        assert_eq!(Err(Error::NoObject), obj.with(|c| c.value));
        assert!(!obj.try_ref());

        let again = bucket.class().alloc().unwrap();
        assert_eq!(Ok(0), again.with(|c| c.value));
    }

    #[test]
    fn test_rpc_handle_keeps_object_alive() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        let cap = bucket.inject(&obj, 10).unwrap();
        bucket.class().drop_ref(&obj);

        let handle = bucket.lookup(10, cap).unwrap();
        bucket.release(10, cap, 1).unwrap();
        assert!(handle.object().is_alive());
        drop(handle);
        assert!(!obj.is_alive());
    }

    #[test]
    fn test_client_dealloc() {
        let bucket = bucket();
        let objects: Vec<_> = (0..5).map(|_| bucket.class().alloc().unwrap()).collect();
        for obj in &objects {
            bucket.inject(obj, 10).unwrap();
            bucket.class().drop_ref(obj);
        }
        assert_eq!(5, bucket.client(10).unwrap().caps().len());

        assert_eq!(Ok(5), bucket.client_dealloc(10));
        assert!(objects.iter().all(|obj| !obj.is_alive()));
        assert_eq!(Err(Error::NoObject), bucket.client_dealloc(10));
        assert_eq!(0, bucket.task_death(10));
    }

    #[test]
    fn test_inhibit_waits_for_rpcs() {
        let bucket = bucket();
        let obj = bucket.class().alloc().unwrap();
        let cap = bucket.inject(&obj, 10).unwrap();

        let handle = bucket.lookup(10, cap).unwrap();
        assert_eq!(Err(Error::OutOfResources), bucket.inhibit());
        drop(handle);

        bucket.inhibit().unwrap();
        assert!(matches!(bucket.lookup(10, cap), Err(Error::WouldBlock)));
        bucket.resume();
        assert_eq!(0, bucket.handle(10, cap, GET, &words(&[])).unwrap().word(0));
    }

    #[test]
    fn test_concurrent_release_and_dealloc() {
        for _ in 0..20 {
            let bucket = Arc::new(bucket());
            let objects: Vec<_> = (0..16).map(|_| bucket.class().alloc().unwrap()).collect();
            let caps: Vec<_> = objects
                .iter()
                .map(|obj| {
                    let cap = bucket.inject(obj, 7).unwrap();
                    bucket.inject(obj, 7).unwrap();
                    bucket.class().drop_ref(obj);
                    cap
                })
                .collect();

            let releaser = {
                let bucket = bucket.clone();
                let caps = caps.clone();
                thread::spawn(move || {
                    for cap in caps {
                        let _ = bucket.release(7, cap, 1);
                    }
                })
            };
            let dealloc = {
                let bucket = bucket.clone();
                thread::spawn(move || bucket.task_death(7))
            };
            releaser.join().unwrap();
            dealloc.join().unwrap();

            assert!(objects.iter().all(|obj| !obj.is_alive()));
            assert_eq!(0, bucket.class().live_objects());
            assert_eq!(0, bucket.clients());
        }
    }

    #[test]
    fn test_racing_reference_survives_drop() {
        let class = Arc::new(ObjectClass::<Counter>::new(counter_demux));
        for _ in 0..50 {
            let obj = class.alloc().unwrap();
            let taker = {
                let obj = obj.clone();
                thread::spawn(move || obj.try_ref())
            };
            class.drop_ref(&obj);
            if taker.join().unwrap() {
                // The late reference won; the object lives until it goes.
                assert!(obj.is_alive());
                class.drop_ref(&obj);
            }
            assert!(!obj.is_alive());
        }
        assert_eq!(0, class.live_objects());
    }
}
