/*!
IPC

An IPC runs up to three phases, each selected by a flag of
[`IpcFlags`]:

1. receive: bind a buffer to a messenger and make it ready. A sender
   already queued on it is delivered at once.
2. send: bind the payload to a send messenger and deliver it to the
   target messenger if that is ready, or queue the sender on the target.
3. return: without it the calling thread is suspended until an
   activation resumes it, unless one already arrived during the call.

A failing phase ends the IPC with its error; the effects of earlier
phases stay.

Delivery looks up the capabilities the message names in the sender's
address space and stores them in the slots the receiver's buffer names,
or in the receiver's inline capability slot. The data is copied as is.
*/
use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;
use viengoos_abi::{
    addr::Addr,
    cap::CapType,
    error::{Error, Result},
    ipc::{InlineMessage, IpcFlags, IpcRequest},
    message::Message,
};

use crate::{
    aspace::Root,
    cap::Capability,
    kernel::WaitLocked,
    messenger::Messenger,
    object::Oid,
    thread::ThreadState,
    wait_queue::WaitReason,
    Kernel,
};

/// How an IPC left the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcOutcome {
    /// `RETURN` was given: the thread continues.
    Returned,
    /// An activation was posted to the thread during the call.
    Activated,
    /// The thread waits for an activation.
    Suspended,
}

/// What a receiver gets.
enum Delivery {
    Inline(InlineMessage),
    Buffer(Message),
}

impl Kernel {
    /// Perform an IPC on behalf of `thread`. Every address in `request`
    /// is looked up in the thread's address space.
    pub fn ipc(&self, thread: &Capability, request: &IpcRequest) -> Result<IpcOutcome> {
        let locked = self.lock();
        let root = self.thread_root(thread)?;
        let (_, caller) = self.thread_object(thread)?;
        let activations = caller.lock().activations;
        let flags = request.flags;

        if flags.contains(IpcFlags::RECEIVE) {
            self.ipc_receive(&locked, thread, &root, request)?;
        }
        if flags.contains(IpcFlags::SEND) {
            self.ipc_send(&locked, thread, &root, request)?;
        }
        if flags.contains(IpcFlags::RETURN) {
            return Ok(IpcOutcome::Returned);
        }

        let mut caller = caller.lock();
        if caller.activations != activations {
            Ok(IpcOutcome::Activated)
        } else {
            caller.set_state(ThreadState::Suspended);
            Ok(IpcOutcome::Suspended)
        }
    }

    fn ipc_messenger(
        &self,
        locked: &WaitLocked<'_>,
        root: &Root,
        addr: Addr,
    ) -> Result<(Oid, Arc<Mutex<Messenger>>)> {
        let (_, object) = self.lookup_object(locked, root, addr, |t| t == CapType::Messenger)?;
        let messenger = object.body.as_messenger()?.clone();
        if messenger.lock().wait.queued {
            return Err(Error::InvalidArgument);
        }
        Ok((object.oid, messenger))
    }

    fn ipc_receive(
        &self,
        locked: &WaitLocked<'_>,
        thread: &Capability,
        root: &Root,
        request: &IpcRequest,
    ) -> Result<()> {
        let flags = request.flags;
        let (oid, messenger) = self.ipc_messenger(locked, root, request.recv_messenger)?;
        let buffer = if flags.contains(IpcFlags::RECEIVE_INLINE) || request.recv_buf.is_void() {
            None
        } else {
            Some(self.lookup_object(locked, root, request.recv_buf, |t| t == CapType::Page)?.0)
        };

        let bound = {
            let mut m = messenger.lock();
            if flags.contains(IpcFlags::RECEIVE_INLINE) {
                m.out_of_band = true;
                m.inline_cap_slot = if flags.contains(IpcFlags::RECEIVE_INLINE_CAP1) {
                    request.recv_inline_cap
                } else {
                    Addr::VOID
                };
            } else if let Some(buffer) = buffer {
                m.out_of_band = false;
                m.buffer = buffer;
            }
            if flags.contains(IpcFlags::RECEIVE_SET_THREAD_TO_CALLER) {
                m.thread = *thread;
            }
            if flags.contains(IpcFlags::RECEIVE_SET_ASROOT_TO_CALLERS) {
                m.as_root = root.cap();
            }
            m.activate_on_receive = flags.contains(IpcFlags::RECEIVE_ACTIVATE);
            m.blocked = false;
            m.thread
        };
        if let Ok((_, bound)) = self.thread_object(&bound) {
            bound.lock().pending_receive = Some(oid);
        }

        let senders = self
            .wait_queue(oid)
            .into_iter()
            .filter(|(_, reason)| *reason == WaitReason::Send)
            .map(|(sender, _)| sender);
        for sender in senders.collect::<Vec<_>>() {
            self.wait_dequeue(locked, sender);
            match self.deliver(locked, sender, oid) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!("queued send from {} to {} failed: {}", sender, oid, error);
                    self.send_failed(locked, sender, error);
                }
            }
        }

        if flags.contains(IpcFlags::RECEIVE_NONBLOCKING) {
            messenger.lock().blocked = true;
            self.messenger_settled(oid, &bound);
            return Err(Error::WouldBlock);
        }
        trace!("{} ready to receive", oid);
        Ok(())
    }

    fn ipc_send(
        &self,
        locked: &WaitLocked<'_>,
        thread: &Capability,
        root: &Root,
        request: &IpcRequest,
    ) -> Result<()> {
        let flags = request.flags;
        let (target, target_messenger) = self
            .lookup_object(locked, root, request.target_messenger, |t| t == CapType::Messenger)
            .and_then(|(_, object)| Ok((object.oid, object.body.as_messenger()?.clone())))?;
        let (oid, messenger) = self.ipc_messenger(locked, root, request.send_messenger)?;
        let buffer = if flags.contains(IpcFlags::SEND_INLINE) || request.send_buf.is_void() {
            None
        } else {
            Some(self.lookup_object(locked, root, request.send_buf, CapType::is_page)?.0)
        };

        let bound = {
            let mut m = messenger.lock();
            if flags.contains(IpcFlags::SEND_INLINE) {
                let inline = &request.inline;
                m.out_of_band = true;
                m.inline = InlineMessage::from_flags(
                    flags,
                    inline.words.first().copied().unwrap_or(0),
                    inline.words.get(1).copied().unwrap_or(0),
                    inline.caps.first().copied().unwrap_or(Addr::VOID),
                );
            } else if let Some(buffer) = buffer {
                m.out_of_band = false;
                m.buffer = buffer;
            }
            if flags.contains(IpcFlags::SEND_SET_THREAD_TO_CALLER) {
                m.thread = *thread;
            }
            if flags.contains(IpcFlags::SEND_SET_ASROOT_TO_CALLERS) {
                m.as_root = root.cap();
            }
            m.activate_on_send = flags.contains(IpcFlags::SEND_ACTIVATE);
            m.thread
        };

        let ready = !target_messenger.lock().blocked;
        if ready {
            return self.deliver(locked, oid, target);
        }
        if flags.contains(IpcFlags::SEND_NONBLOCKING) {
            return Err(Error::WouldBlock);
        }
        self.wait_enqueue(locked, target, oid, WaitReason::Send);
        if let Ok((_, bound)) = self.thread_object(&bound) {
            bound.lock().pending_send = Some(oid);
        }
        trace!("{} blocks sending to {}", oid, target);
        Ok(())
    }

    /// Tell a queued sender its message could not be delivered.
    fn send_failed(&self, locked: &WaitLocked<'_>, sender: Oid, error: Error) {
        let mut reply = Message::new();
        reply.append_word(error.code());
        self.messenger_complete(locked, sender, &reply);
    }

    /// Move the message of `sender` into the ready messenger `target`
    /// and complete both sides.
    ///
    /// Fails with `Overflow` if the message does not fit an inline
    /// target, which is left ready.
    fn deliver(&self, locked: &WaitLocked<'_>, sender: Oid, target: Oid) -> Result<()> {
        let sender_m = self.messenger_by_oid(sender).ok_or(Error::NoObject)?;
        let target_m = self.messenger_by_oid(target).ok_or(Error::NoObject)?;

        let (out_of_band, inline, buffer, as_root) = {
            let m = sender_m.lock();
            (m.out_of_band, m.inline.clone(), m.buffer, m.as_root)
        };
        let msg = if out_of_band {
            inline.to_message()
        } else {
            self.page_load_message(&buffer)?
        };
        let sender_root = Root::detached(as_root);
        let caps: Vec<Capability> = msg
            .caps()
            .map(|addr| {
                self.lookup_cap(locked, &sender_root, addr)
                    .unwrap_or(Capability::VOID)
            })
            .collect();

        let (out_of_band, buffer, as_root, inline_cap_slot) = {
            let m = target_m.lock();
            (m.out_of_band, m.buffer, m.as_root, m.inline_cap_slot)
        };
        let target_root = Root::detached(as_root);
        let delivery = if out_of_band {
            let mut inline = InlineMessage::from_message(&msg).ok_or(Error::Overflow)?;
            if let (Some(cap), Some(slot)) = (caps.first(), inline.caps.first_mut()) {
                *slot = inline_cap_slot;
                if !inline_cap_slot.is_void() {
                    self.transfer(locked, &target_root, inline_cap_slot, *cap);
                }
            }
            Delivery::Inline(inline)
        } else {
            let slots: Vec<Addr> = self.page_load_message(&buffer)?.caps().collect();
            let count = slots.len().min(caps.len());
            for (slot, cap) in slots.iter().zip(caps.iter()) {
                self.transfer(locked, &target_root, *slot, *cap);
            }
            let mut out = Message::new();
            out.append_caps(&slots[..count]);
            out.append_data(msg.data());
            Delivery::Buffer(out)
        };

        let (target_thread, activate_target) = {
            let mut m = target_m.lock();
            m.blocked = true;
            (m.thread, m.activate_on_receive)
        };
        match delivery {
            Delivery::Inline(inline) => target_m.lock().inline = inline,
            Delivery::Buffer(out) => {
                if let Err(error) = self.page_store_message(&buffer, &out) {
                    warn!("message to {} lost: {}", target, error);
                }
            }
        }
        self.messenger_settled(target, &target_thread);
        if activate_target {
            self.activate(locked, &target_thread, target);
        }

        let (sender_thread, activate_sender) = {
            let m = sender_m.lock();
            (m.thread, m.activate_on_send)
        };
        self.messenger_settled(sender, &sender_thread);
        if activate_sender {
            self.activate(locked, &sender_thread, sender);
        }
        debug!("{} delivered to {} ({} caps)", sender, target, caps.len());
        Ok(())
    }

    /// Store a transferred capability in the receiver's address space.
    fn transfer(&self, locked: &WaitLocked<'_>, root: &Root, slot: Addr, cap: Capability) {
        if let Err(error) = self.store_cap(locked, root, slot, cap) {
            warn!("capability transfer to {} failed: {}", slot, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BootInfo, KernelConfig};
    use viengoos_abi::{cap::ObjectPolicy, folio::FolioPolicy};

    fn slot(index: u64) -> Addr {
        Addr::from_bits(index, 8)
    }

    /// A second messenger at root slot 5, bound to the first thread.
    fn setup() -> (Kernel, BootInfo, Capability) {
        let (kernel, boot) = Kernel::bootstrap(KernelConfig::default()).unwrap();
        let folio = kernel.folio_alloc(&boot.activity, FolioPolicy::default()).unwrap();
        let (messenger, _) = kernel
            .folio_object_alloc(&folio, 0, CapType::Messenger, ObjectPolicy::default(), 0)
            .unwrap();
        {
            let locked = kernel.lock();
            let root = kernel.thread_root(&boot.thread).unwrap();
            kernel.store_cap(&locked, &root, slot(5), messenger).unwrap();
        }
        (kernel, boot, messenger)
    }

    fn receive_inline(flags: IpcFlags) -> IpcRequest {
        IpcRequest {
            recv_messenger: slot(5),
            ..IpcRequest::new(
                IpcFlags::RECEIVE
                    | IpcFlags::RECEIVE_INLINE
                    | IpcFlags::RECEIVE_SET_THREAD_TO_CALLER
                    | IpcFlags::RECEIVE_SET_ASROOT_TO_CALLERS
                    | flags,
            )
        }
    }

    fn send_inline(words: &[u64]) -> IpcRequest {
        let mut flags = IpcFlags::SEND | IpcFlags::SEND_INLINE | IpcFlags::RETURN;
        if !words.is_empty() {
            flags |= IpcFlags::SEND_INLINE_WORD1;
        }
        if words.len() > 1 {
            flags |= IpcFlags::SEND_INLINE_WORD2;
        }
        IpcRequest {
            target_messenger: slot(5),
            send_messenger: slot(4),
            inline: InlineMessage::new(words, None).unwrap(),
            ..IpcRequest::new(flags)
        }
    }

    #[test]
    fn test_nonblocking_receive() {
        let (kernel, boot, messenger) = setup();
        let request = receive_inline(IpcFlags::RECEIVE_NONBLOCKING | IpcFlags::RETURN);
        assert_eq!(Err(Error::WouldBlock), kernel.ipc(&boot.thread, &request));
        assert_eq!(Ok(false), kernel.messenger_ready(&messenger));
    }

    #[test]
    fn test_nonblocking_send() {
        let (kernel, boot, _) = setup();
        let mut request = send_inline(&[1]);
        request.flags |= IpcFlags::SEND_NONBLOCKING;
        assert_eq!(Err(Error::WouldBlock), kernel.ipc(&boot.thread, &request));
    }

    #[test]
    fn test_receive_then_send_inline() {
        let (kernel, boot, messenger) = setup();
        let request = receive_inline(IpcFlags::RECEIVE_ACTIVATE | IpcFlags::RETURN);
        assert_eq!(Ok(IpcOutcome::Returned), kernel.ipc(&boot.thread, &request));
        assert_eq!(Ok(true), kernel.messenger_ready(&messenger));
        kernel.messenger_id(&messenger, 77).unwrap();

        assert_eq!(Ok(IpcOutcome::Returned), kernel.ipc(&boot.thread, &send_inline(&[7, 8])));
        assert_eq!(Ok(false), kernel.messenger_ready(&messenger));
        let utcb = kernel.thread_utcb(&boot.thread).unwrap();
        assert_eq!(77, utcb.messenger_id);
        assert_eq!(&[7, 8], &utcb.inline.words[..]);
    }

    #[test]
    fn test_queued_sender_delivered_on_receive() {
        let (kernel, boot, messenger) = setup();
        assert_eq!(Ok(IpcOutcome::Returned), kernel.ipc(&boot.thread, &send_inline(&[3])));
        assert_eq!(Ok(true), kernel.messenger_queued(&boot.messenger));

        let request = receive_inline(IpcFlags::RETURN);
        assert_eq!(Ok(IpcOutcome::Returned), kernel.ipc(&boot.thread, &request));
        assert_eq!(Ok(false), kernel.messenger_queued(&boot.messenger));
        let msg = kernel.messenger_message(&messenger).unwrap();
        assert_eq!(vec![3], msg.words().collect::<Vec<_>>());
    }

    #[test]
    fn test_suspend_without_return() {
        let (kernel, boot, _) = setup();
        let mut request = receive_inline(IpcFlags::empty());
        request.flags.remove(IpcFlags::RETURN);
        assert_eq!(Ok(IpcOutcome::Suspended), kernel.ipc(&boot.thread, &request));
        assert_eq!(Ok(ThreadState::Suspended), kernel.thread_state(&boot.thread));
    }

    #[test]
    fn test_buffer_message_overflows_inline_receiver() {
        let (kernel, boot, messenger) = setup();
        let folio = kernel.folio_alloc(&boot.activity, FolioPolicy::default()).unwrap();
        let (page, _) = kernel
            .folio_object_alloc(&folio, 0, CapType::Page, ObjectPolicy::default(), 0)
            .unwrap();
        let mut big = Message::new();
        for word in 0..3 {
            big.append_word(word);
        }
        {
            let locked = kernel.lock();
            let root = kernel.thread_root(&boot.thread).unwrap();
            kernel.store_cap(&locked, &root, slot(6), page).unwrap();
        }
        kernel.page_store_message(&page, &big).unwrap();

        let request = receive_inline(IpcFlags::RETURN);
        kernel.ipc(&boot.thread, &request).unwrap();
        let send = IpcRequest {
            target_messenger: slot(5),
            send_messenger: slot(4),
            send_buf: slot(6),
            ..IpcRequest::new(IpcFlags::SEND | IpcFlags::RETURN)
        };
        assert_eq!(Err(Error::Overflow), kernel.ipc(&boot.thread, &send));
        assert_eq!(Ok(true), kernel.messenger_ready(&messenger));
    }
}
