/*!
Messengers

A messenger is the rendezvous point of IPC. It is bound to a thread,
which it activates on completion, to an address space root, in which the
capabilities it transfers are looked up and stored, and to a buffer:
either a page holding a full [`Message`], or the inline payload kept in
the messenger itself.

A messenger is either blocked or ready to receive. Senders that find
their target blocked queue on it.
*/
use alloc::sync::Arc;

use spin::Mutex;
use viengoos_abi::{
    addr::Addr,
    error::{Error, Result},
    ipc::InlineMessage,
    message::Message,
};

use crate::{cap::Capability, kernel::WaitLocked, object::Oid, wait_queue::WaitLink, Kernel};

#[derive(Debug, CopyGetters)]
pub struct Messenger {
    /// Chosen by user space, reported on activation.
    #[getset(get_copy = "pub")]
    id: u64,
    /// Thread activated on completion.
    pub(crate) thread: Capability,
    /// Root of the address space transferred capabilities live in.
    pub(crate) as_root: Capability,
    /// Message page, unless `out_of_band`.
    pub(crate) buffer: Capability,
    /// The message is the inline payload.
    pub(crate) out_of_band: bool,
    pub(crate) inline: InlineMessage,
    /// Where an inline capability is stored on receipt.
    pub(crate) inline_cap_slot: Addr,
    /// Not ready to receive.
    #[getset(get_copy = "pub")]
    pub(crate) blocked: bool,
    pub(crate) activate_on_send: bool,
    pub(crate) activate_on_receive: bool,
    pub(crate) wait: WaitLink,
}

impl Messenger {
    pub fn new() -> Messenger {
        Messenger {
            id: 0,
            thread: Capability::VOID,
            as_root: Capability::VOID,
            buffer: Capability::VOID,
            out_of_band: false,
            inline: InlineMessage::default(),
            inline_cap_slot: Addr::VOID,
            blocked: true,
            activate_on_send: false,
            activate_on_receive: false,
            wait: WaitLink::default(),
        }
    }

    pub(crate) fn bind(&mut self, thread: Capability, as_root: Capability) {
        self.thread = thread;
        self.as_root = as_root;
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Messenger::new()
    }
}

impl Kernel {
    /// Write `msg` into the buffer of `messenger`: the bound page, or
    /// the inline payload, in which case `Overflow` if it does not fit.
    pub(crate) fn messenger_store(&self, messenger: &Arc<Mutex<Messenger>>, msg: &Message) -> Result<()> {
        let (out_of_band, buffer) = {
            let m = messenger.lock();
            (m.out_of_band, m.buffer)
        };
        if out_of_band {
            let inline = InlineMessage::from_message(msg).ok_or(Error::Overflow)?;
            messenger.lock().inline = inline;
            Ok(())
        } else {
            self.page_store_message(&buffer, msg)
        }
    }

    /// Deliver `reply` into the buffer of `messenger`, then activate its
    /// thread.
    ///
    /// A reply that does not fit an inline messenger is replaced by an
    /// `Overflow` error reply.
    pub(crate) fn messenger_complete(&self, locked: &WaitLocked<'_>, messenger: Oid, reply: &Message) {
        let m = match self.messenger_by_oid(messenger) {
            Some(m) => m,
            None => {
                warn!("reply to vanished messenger {} dropped", messenger);
                return;
            }
        };
        let thread = {
            let mut m = m.lock();
            m.blocked = true;
            m.thread
        };

        match self.messenger_store(&m, reply) {
            Ok(()) => {}
            Err(Error::Overflow) => {
                warn!("reply to {} does not fit inline", messenger);
                let overflow = viengoos_abi::rpc::reply::<()>(&Err(Error::Overflow));
                match InlineMessage::from_message(&overflow) {
                    Some(inline) => m.lock().inline = inline,
                    None => debug_panic!("error reply does not fit inline"),
                }
            }
            Err(error) => warn!("reply to {} dropped: {}", messenger, error),
        }

        self.messenger_settled(messenger, &thread);
        self.activate(locked, &thread, messenger);
    }

    /// Forget that the thread is blocked in `messenger`.
    pub(crate) fn messenger_settled(&self, messenger: Oid, thread: &Capability) {
        if let Ok((_, thread)) = self.thread_object(thread) {
            let mut thread = thread.lock();
            if thread.pending_send == Some(messenger) {
                thread.pending_send = None;
            }
            if thread.pending_receive == Some(messenger) {
                thread.pending_receive = None;
            }
        }
    }

    /// Set the id of `messenger`. Returns the old one.
    pub fn messenger_id(&self, messenger: &Capability, id: u64) -> Result<u64> {
        let (_, messenger) = self.messenger_object(messenger)?;
        let mut messenger = messenger.lock();
        Ok(core::mem::replace(&mut messenger.id, id))
    }

    /// The message currently in the buffer of `messenger`.
    pub fn messenger_message(&self, messenger: &Capability) -> Result<Message> {
        let (_, messenger) = self.messenger_object(messenger)?;
        let (out_of_band, inline, buffer) = {
            let m = messenger.lock();
            (m.out_of_band, m.inline.clone(), m.buffer)
        };
        if out_of_band {
            Ok(inline.to_message())
        } else {
            self.page_load_message(&buffer)
        }
    }

    /// Resolve `messenger` as a reply messenger: it must not already
    /// wait on some queue.
    pub(crate) fn idle_messenger(&self, messenger: &Capability) -> Result<Oid> {
        let (oid, m) = self.messenger_object(messenger)?;
        let queued = m.lock().wait.queued;
        if queued {
            return Err(Error::InvalidArgument);
        }
        Ok(oid)
    }

    /// Whether `messenger` is ready to receive.
    pub fn messenger_ready(&self, messenger: &Capability) -> Result<bool> {
        let (_, messenger) = self.messenger_object(messenger)?;
        let blocked = messenger.lock().blocked;
        Ok(!blocked)
    }

    /// Whether `messenger` waits on some object's queue.
    pub fn messenger_queued(&self, messenger: &Capability) -> Result<bool> {
        let (_, messenger) = self.messenger_object(messenger)?;
        let queued = messenger.lock().wait.queued;
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_messenger_is_blocked() {
        let messenger = Messenger::new();
        assert!(messenger.blocked());
        assert_eq!(0, messenger.id());
        assert!(!messenger.wait.queued);
        assert!(messenger.thread.is_void());
    }

    #[test]
    fn test_bind() {
        let mut messenger = Messenger::default();
        let thread = Capability::new(
            viengoos_abi::cap::CapType::Thread,
            Oid::object(0, 1),
            0,
            Default::default(),
        );
        messenger.bind(thread, Capability::VOID);
        assert_eq!(thread, messenger.thread);
    }
}
