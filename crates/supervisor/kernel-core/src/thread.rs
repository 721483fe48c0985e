/*!
Threads and activations

A thread is a capability container of four slots (address space root,
activity, exception messenger, UTCB) plus the register state the kernel
keeps for it. There is no real CPU here: `ip` and `sp` are what would be
loaded when the thread runs, and `state` says whether it would.

Messages are announced to a thread by activation. An activation saves
the thread's IP and SP in the UTCB and redirects it to its activation
handler; a thread already in activated mode gets the activation queued
instead and collects it with `thread_activation_collect`.
*/
use alloc::{collections::VecDeque, sync::Arc};

use spin::Mutex;
use viengoos_abi::{
    cap::{CapCopyFlags, CapProperties, CapType},
    error::{Error, Result},
    ipc::InlineMessage,
    message::Message,
    thread::{ExregsFlags, ExregsOut, ThreadSlot, Utcb, UtcbMode, THREAD_SLOTS},
};

use crate::{aspace::SlotLoc, cap::Capability, kernel::WaitLocked, object::Oid, Kernel};

/// Whether a thread would run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Stopped,
    Running,
    /// Blocked in an IPC until an activation.
    Suspended,
}

#[derive(Debug, Getters, CopyGetters)]
pub struct Thread {
    /// Kernel assigned identifier, unique for the kernel's lifetime.
    #[getset(get_copy = "pub")]
    id: u64,
    pub(crate) slots: [Capability; THREAD_SLOTS],
    #[getset(get_copy = "pub")]
    state: ThreadState,
    #[getset(get_copy = "pub")]
    ip: u64,
    #[getset(get_copy = "pub")]
    sp: u64,
    #[getset(get = "pub")]
    utcb: Utcb,
    /// Messengers whose activation waits for the thread to leave
    /// activated mode.
    pub(crate) pending: VecDeque<Oid>,
    /// Messenger blocked sending on the thread's behalf.
    pub(crate) pending_send: Option<Oid>,
    /// Messenger ready to receive on the thread's behalf.
    pub(crate) pending_receive: Option<Oid>,
    /// Bumped on every activation.
    pub(crate) activations: u64,
}

impl Thread {
    pub fn new(id: u64) -> Thread {
        Thread {
            id,
            slots: [Capability::VOID; THREAD_SLOTS],
            state: ThreadState::Stopped,
            ip: 0,
            sp: 0,
            utcb: Utcb::default(),
            pending: VecDeque::new(),
            pending_send: None,
            pending_receive: None,
            activations: 0,
        }
    }

    pub fn slot(&self, slot: ThreadSlot) -> &Capability {
        &self.slots[slot.index()]
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Announce `messenger`, carrying `id` and `inline`, to the thread.
    fn activate(&mut self, messenger: Oid, id: u64, inline: &InlineMessage) {
        if self.utcb.mode.contains(UtcbMode::ACTIVATED) {
            self.pending.push_back(messenger);
            self.utcb.mode.insert(UtcbMode::PENDING_MESSAGE);
        } else {
            self.utcb.saved_ip = self.ip;
            self.utcb.saved_sp = self.sp;
            self.ip = self.utcb.activation_handler_ip;
            self.sp = self.utcb.activation_handler_sp;
            self.utcb.mode.insert(UtcbMode::ACTIVATED);
            self.utcb.messenger_id = id;
            self.utcb.inline = inline.clone();
        }
        if self.state == ThreadState::Suspended {
            self.state = ThreadState::Running;
        }
        self.activations += 1;
    }
}

/// Capabilities `thread_exregs` installs, already looked up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExregsCaps {
    pub aspace: Capability,
    pub aspace_properties: CapProperties,
    pub activity: Capability,
    pub exception_messenger: Capability,
    pub utcb: Capability,
    pub sp: u64,
    pub ip: u64,
}

impl Kernel {
    /// Activate the thread `thread` for `messenger`.
    pub(crate) fn activate(&self, _locked: &WaitLocked<'_>, thread: &Capability, messenger: Oid) {
        let thread = match self.thread_object(thread) {
            Ok((_, thread)) => thread,
            Err(_) => {
                warn!("activation for {} lost: its thread is gone", messenger);
                return;
            }
        };
        let (id, inline) = match self.messenger_by_oid(messenger) {
            Some(m) => {
                let m = m.lock();
                (m.id(), m.inline.clone())
            }
            None => {
                warn!("activation for vanished messenger {}", messenger);
                return;
            }
        };
        let mut thread = thread.lock();
        thread.activate(messenger, id, &inline);
        trace!(
            "thread {} activated by {} (mode {:?})",
            thread.id,
            messenger,
            thread.utcb.mode
        );
    }

    /// Fail the IPC `messenger` is blocked in with `Interrupted`, which
    /// wakes its thread.
    pub(crate) fn abort_messenger(&self, locked: &WaitLocked<'_>, messenger: Oid) {
        let mut reply = Message::new();
        reply.append_word(Error::Interrupted.code());
        self.messenger_complete(locked, messenger, &reply);
    }

    /// Drop whatever IPC the thread is involved in.
    pub(crate) fn thread_teardown(&self, locked: &WaitLocked<'_>, thread: &Arc<Mutex<Thread>>) {
        let (send, receive) = {
            let mut thread = thread.lock();
            thread.pending.clear();
            (thread.pending_send.take(), thread.pending_receive.take())
        };
        if let Some(send) = send {
            self.wait_dequeue(locked, send);
        }
        if let Some(m) = receive.and_then(|receive| self.messenger_by_oid(receive)) {
            m.lock().blocked = true;
        }
    }

    pub fn thread_exregs(
        &self,
        thread: &Capability,
        control: ExregsFlags,
        regs: &ExregsCaps,
    ) -> Result<ExregsOut> {
        let locked = self.lock();
        self.thread_exregs_locked(&locked, thread, control, regs)
    }

    /// Exchange registers: install slots, set SP and IP, abort IPC and
    /// start or stop the thread. Returns SP and IP as they were before
    /// the call when `GET_REGS` is set.
    pub(crate) fn thread_exregs_locked(
        &self,
        locked: &WaitLocked<'_>,
        thread_cap: &Capability,
        control: ExregsFlags,
        regs: &ExregsCaps,
    ) -> Result<ExregsOut> {
        let (oid, thread) = self.thread_object(thread_cap)?;
        let slot = |slot| SlotLoc::Thread {
            oid,
            version: thread_cap.version,
            slot,
        };

        let accepts = |cap: &Capability, ok: fn(CapType) -> bool| {
            if cap.is_void() || ok(cap.cap_type) {
                Ok(())
            } else {
                Err(Error::WrongType)
            }
        };
        if control.contains(ExregsFlags::SET_ACTIVITY) {
            accepts(&regs.activity, CapType::is_activity)?;
        }
        if control.contains(ExregsFlags::SET_EXCEPTION_MESSENGER) {
            accepts(&regs.exception_messenger, |t| t == CapType::Messenger)?;
        }
        if control.contains(ExregsFlags::SET_UTCB) {
            accepts(&regs.utcb, |t| t == CapType::Page)?;
        }

        let (old_sp, old_ip, pending_send, pending_receive) = {
            let thread = thread.lock();
            (thread.sp, thread.ip, thread.pending_send, thread.pending_receive)
        };

        if control.contains(ExregsFlags::SET_ASPACE) {
            let old = self.slot_read(&slot(ThreadSlot::Aspace))?;
            let (aspace, _) = Capability::copy_from(
                &old,
                &regs.aspace,
                CapCopyFlags::COPY_ADDR_TRANS_GUARD,
                &regs.aspace_properties,
            )?;
            self.slot_write(locked, &slot(ThreadSlot::Aspace), aspace)?;
        }
        for (flag, which, cap) in [
            (ExregsFlags::SET_ACTIVITY, ThreadSlot::Activity, regs.activity),
            (
                ExregsFlags::SET_EXCEPTION_MESSENGER,
                ThreadSlot::ExceptionMessenger,
                regs.exception_messenger,
            ),
            (ExregsFlags::SET_UTCB, ThreadSlot::Utcb, regs.utcb),
        ] {
            if control.contains(flag) {
                self.slot_write(locked, &slot(which), cap)?;
            }
        }

        {
            let mut thread = thread.lock();
            if control.contains(ExregsFlags::SET_SP) {
                thread.sp = regs.sp;
            }
            if control.contains(ExregsFlags::SET_IP) {
                thread.ip = regs.ip;
            }
        }

        if control.contains(ExregsFlags::ABORT_SEND) {
            if let Some(send) = pending_send {
                thread.lock().pending_send = None;
                if self.wait_dequeue(locked, send).is_some() {
                    warn!("send of {} aborted", send);
                    self.abort_messenger(locked, send);
                }
            }
        }
        if control.contains(ExregsFlags::ABORT_RECEIVE) {
            if let Some(receive) = pending_receive {
                thread.lock().pending_receive = None;
                let ready = self
                    .messenger_by_oid(receive)
                    .map_or(false, |m| !m.lock().blocked);
                if ready {
                    warn!("receive on {} aborted", receive);
                    self.abort_messenger(locked, receive);
                }
            }
        }

        {
            let mut thread = thread.lock();
            if control.contains(ExregsFlags::STOP) {
                thread.state = ThreadState::Stopped;
            } else if control.contains(ExregsFlags::START) && thread.state == ThreadState::Stopped {
                thread.state = ThreadState::Running;
            }
        }

        Ok(if control.contains(ExregsFlags::GET_REGS) {
            ExregsOut {
                sp: old_sp,
                ip: old_ip,
            }
        } else {
            ExregsOut::default()
        })
    }

    pub fn thread_id(&self, thread: &Capability) -> Result<u64> {
        let (_, thread) = self.thread_object(thread)?;
        let id = thread.lock().id;
        Ok(id)
    }

    pub fn thread_activation_collect(&self, thread: &Capability) -> Result<usize> {
        let locked = self.lock();
        self.thread_activation_collect_locked(&locked, thread)
    }

    /// Deliver the next queued activation, or leave activated mode when
    /// there is none. Returns the number still queued.
    pub(crate) fn thread_activation_collect_locked(
        &self,
        _locked: &WaitLocked<'_>,
        thread: &Capability,
    ) -> Result<usize> {
        let (oid, thread) = self.thread_object(thread)?;
        loop {
            let next = thread.lock().pending.pop_front();
            let messenger = match next {
                Some(messenger) => messenger,
                None => {
                    let mut thread = thread.lock();
                    thread.utcb.mode.remove(UtcbMode::ACTIVATED | UtcbMode::PENDING_MESSAGE);
                    thread.ip = thread.utcb.saved_ip;
                    thread.sp = thread.utcb.saved_sp;
                    trace!("{} leaves activated mode", oid);
                    return Ok(0);
                }
            };
            // A messenger destroyed while queued is skipped.
            let (id, inline) = match self.messenger_by_oid(messenger) {
                Some(m) => {
                    let m = m.lock();
                    (m.id(), m.inline.clone())
                }
                None => continue,
            };
            let mut thread = thread.lock();
            thread.utcb.messenger_id = id;
            thread.utcb.inline = inline;
            let remaining = thread.pending.len();
            if remaining == 0 {
                thread.utcb.mode.remove(UtcbMode::PENDING_MESSAGE);
            }
            return Ok(remaining);
        }
    }

    /// Set where activations of `thread` enter.
    pub fn thread_set_activation_handler(&self, thread: &Capability, ip: u64, sp: u64) -> Result<()> {
        let (_, thread) = self.thread_object(thread)?;
        let mut thread = thread.lock();
        thread.utcb.activation_handler_ip = ip;
        thread.utcb.activation_handler_sp = sp;
        Ok(())
    }

    pub fn thread_state(&self, thread: &Capability) -> Result<ThreadState> {
        let (_, thread) = self.thread_object(thread)?;
        let state = thread.lock().state;
        Ok(state)
    }

    /// A copy of the thread's control block.
    pub fn thread_utcb(&self, thread: &Capability) -> Result<Utcb> {
        let (_, thread) = self.thread_object(thread)?;
        let utcb = thread.lock().utcb.clone();
        Ok(utcb)
    }

    /// The thread's IP and SP.
    pub fn thread_regs(&self, thread: &Capability) -> Result<ExregsOut> {
        let (_, thread) = self.thread_object(thread)?;
        let thread = thread.lock();
        Ok(ExregsOut {
            sp: thread.sp,
            ip: thread.ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_thread() -> Thread {
        let mut thread = Thread::new(1);
        thread.state = ThreadState::Suspended;
        thread.ip = 0x1000;
        thread.sp = 0x8000;
        thread.utcb.activation_handler_ip = 0x2000;
        thread.utcb.activation_handler_sp = 0x9000;
        thread
    }

    #[test]
    fn test_first_activation_enters_handler() {
        let mut thread = handler_thread();
        let inline = InlineMessage::new(&[42], None).unwrap();
        thread.activate(Oid::object(0, 3), 77, &inline);

        assert_eq!(ThreadState::Running, thread.state());
        assert_eq!((0x2000, 0x9000), (thread.ip(), thread.sp()));
        assert_eq!((0x1000, 0x8000), (thread.utcb.saved_ip, thread.utcb.saved_sp));
        assert!(thread.utcb.mode.contains(UtcbMode::ACTIVATED));
        assert_eq!(77, thread.utcb.messenger_id);
        assert_eq!(&[42][..], &thread.utcb.inline.words[..]);
        assert_eq!(1, thread.activations);
    }

    #[test]
    fn test_nested_activation_is_queued() {
        let mut thread = handler_thread();
        thread.activate(Oid::object(0, 3), 1, &InlineMessage::default());
        thread.activate(Oid::object(0, 4), 2, &InlineMessage::default());

        assert!(thread.utcb.mode.contains(UtcbMode::PENDING_MESSAGE));
        assert_eq!(1, thread.utcb.messenger_id);
        assert_eq!(Some(&Oid::object(0, 4)), thread.pending.front());
        // The saved registers are still those of the interrupted code.
        assert_eq!(0x1000, thread.utcb.saved_ip);
        assert_eq!(2, thread.activations);
    }

    #[test]
    fn test_stopped_thread_stays_stopped() {
        let mut thread = Thread::new(3);
        thread.activate(Oid::object(0, 3), 1, &InlineMessage::default());
        assert_eq!(ThreadState::Stopped, thread.state());
    }
}
