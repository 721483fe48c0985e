/*!
Capability client bookkeeping

A task talking to capability servers keeps one [`Connection`] per server
in a [`ServerConnections`] registry. A connection maps the capability ids
the server handed out to [`CapHandle`]s, counting the references the task
holds. Once the count drops to zero the handle leaves its connection and
the task owes the server one `release` of the capability; the connection
goes when its last handle does.

Handles removed from a connection, whether by release or by the death of
the server, are marked dead by the connection table's cleanup hook.
*/
use alloc::sync::Arc;

use spin::Mutex;
use viengoos_abi::error::{Error, Result};
use viengoos_utils::ihash::IHash;

use crate::cap_server::{CapId, TaskId};

#[derive(Debug)]
struct HandleState {
    refs: u64,
    dead: bool,
}

/// A task's reference to a capability of a server.
#[derive(Debug)]
pub struct CapHandle {
    server: TaskId,
    cap_id: CapId,
    state: Mutex<HandleState>,
}

impl CapHandle {
    pub fn server(&self) -> TaskId {
        self.server
    }

    pub fn cap_id(&self) -> CapId {
        self.cap_id
    }

    pub fn refs(&self) -> u64 {
        self.state.lock().refs
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }
}

/// The capabilities a task holds from one server.
pub struct Connection {
    server: TaskId,
    caps: Mutex<IHash<Arc<CapHandle>>>,
}

impl Connection {
    fn new(server: TaskId) -> Self {
        let caps = IHash::with_cleanup(|_, handle: &mut Arc<CapHandle>| {
            handle.state.lock().dead = true;
        });
        Self {
            server,
            caps: Mutex::new(caps),
        }
    }

    pub fn server(&self) -> TaskId {
        self.server
    }

    pub fn len(&self) -> usize {
        self.caps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.lock().is_empty()
    }
}

/// Every server a task is connected to. See module level documentation.
#[derive(Default)]
pub struct ServerConnections {
    servers: Mutex<IHash<Arc<Connection>>>,
}

impl ServerConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self, server: TaskId) -> Option<Arc<Connection>> {
        self.servers.lock().find(server).cloned()
    }

    pub fn servers(&self) -> usize {
        self.servers.lock().len()
    }

    /// Record a reference to capability `cap_id` received from `server`.
    pub fn cap_get(&self, server: TaskId, cap_id: CapId) -> Arc<CapHandle> {
        let mut servers = self.servers.lock();
        let connection = match servers.find(server) {
            Some(connection) => connection.clone(),
            None => {
                let connection = Arc::new(Connection::new(server));
                servers.insert(server, connection.clone());
                debug!("connected to server {}", server);
                connection
            }
        };

        let mut caps = connection.caps.lock();
        if let Some(handle) = caps.find(cap_id) {
            handle.state.lock().refs += 1;
            return handle.clone();
        }
        let handle = Arc::new(CapHandle {
            server,
            cap_id,
            state: Mutex::new(HandleState { refs: 1, dead: false }),
        });
        caps.insert(cap_id, handle.clone());
        handle
    }

    /// Adjust the references held through `handle` by `delta`. Returns
    /// the references left; at zero the handle is dead.
    pub fn cap_mod_refs(&self, handle: &CapHandle, delta: i64) -> Result<u64> {
        let mut servers = self.servers.lock();
        let connection = servers.find(handle.server).cloned().ok_or(Error::NoObject)?;
        let mut caps = connection.caps.lock();

        let refs = {
            let mut state = handle.state.lock();
            if state.dead {
                return Err(Error::NoObject);
            }
            let refs = if delta < 0 {
                state.refs.checked_sub(delta.unsigned_abs())
            } else {
                state.refs.checked_add(delta as u64)
            };
            state.refs = refs.ok_or(Error::InvalidArgument)?;
            state.refs
        };

        if refs == 0 {
            caps.remove(handle.cap_id);
            trace!("capability {} of server {} released", handle.cap_id, handle.server);
            if caps.is_empty() {
                drop(caps);
                servers.remove(handle.server);
                debug!("disconnected from server {}", handle.server);
            }
        }
        Ok(refs)
    }

    /// Drop every reference held through `handle`.
    pub fn cap_deallocate(&self, handle: &CapHandle) -> Result<()> {
        let refs = handle.refs();
        self.cap_mod_refs(handle, -(refs as i64)).map(|_| ())
    }

    /// `server` died. Every handle from it is dead. Returns how many.
    pub fn server_death(&self, server: TaskId) -> usize {
        let connection = match self.servers.lock().remove(server) {
            Some(connection) => connection,
            None => return 0,
        };
        let mut caps = connection.caps.lock();
        let lost = caps.len();
        caps.clear();
        debug!("server {} died, {} capabilities lost", server, lost);
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap_server::{Bucket, ObjectClass};
    use viengoos_abi::message::Message;

    #[test]
    fn test_get_counts_references() {
        let connections = ServerConnections::new();
        let first = connections.cap_get(3, 1);
        let second = connections.cap_get(3, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(2, first.refs());
        connections.cap_get(3, 2);
        assert_eq!(2, connections.connection(3).unwrap().len());
        assert_eq!(1, connections.servers());
    }

    #[test]
    fn test_mod_refs() {
        let connections = ServerConnections::new();
        let handle = connections.cap_get(3, 1);
        assert_eq!(Ok(4), connections.cap_mod_refs(&handle, 3));
        assert_eq!(Err(Error::InvalidArgument), connections.cap_mod_refs(&handle, -5));
        assert_eq!(4, handle.refs());
        assert_eq!(Ok(0), connections.cap_mod_refs(&handle, -4));
        assert!(handle.is_dead());
        assert_eq!(0, connections.servers());
        assert_eq!(Err(Error::NoObject), connections.cap_mod_refs(&handle, 1));
    }

    #[test]
    fn test_deallocate_keeps_other_handles() {
        let connections = ServerConnections::new();
        let one = connections.cap_get(3, 1);
        let two = connections.cap_get(3, 2);
        connections.cap_get(3, 1);
        connections.cap_deallocate(&one).unwrap();
        assert!(one.is_dead());
        assert!(!two.is_dead());
        assert_eq!(1, connections.connection(3).unwrap().len());
    }

    #[test]
    fn test_server_death_kills_handles() {
        let connections = ServerConnections::new();
        let handles: Vec<_> = (0..4).map(|id| connections.cap_get(9, id)).collect();
        let other = connections.cap_get(10, 0);
        assert_eq!(4, connections.server_death(9));
        assert!(handles.iter().all(|h| h.is_dead()));
        assert!(!other.is_dead());
        assert_eq!(0, connections.server_death(9));
        assert_eq!(Err(Error::NoObject), connections.cap_mod_refs(&handles[0], -1));
    }

    fn unsupported(_: &mut u64, _: u64, _: &Message) -> Result<Message> {
        Err(Error::NotSupported)
    }

    #[test]
    fn test_release_reaches_server() {
        const SERVER: TaskId = 1;
        const CLIENT: TaskId = 2;
        let class = ObjectClass::<u64>::new(unsupported);
        let bucket = Bucket::new(Arc::new(class));
        let obj = bucket.class().alloc().unwrap();
        let connections = ServerConnections::new();

        let cap_id = bucket.inject(&obj, CLIENT).unwrap();
        let handle = connections.cap_get(SERVER, cap_id);
        bucket.class().drop_ref(&obj);

        if connections.cap_mod_refs(&handle, -1).unwrap() == 0 {
            bucket.release(CLIENT, handle.cap_id(), 1).unwrap();
        }
        assert!(!obj.is_alive());
    }
}
