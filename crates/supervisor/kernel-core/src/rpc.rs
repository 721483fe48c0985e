/*!
Kernel RPC

A thread invokes a kernel object by handing [`Kernel::rpc`] a request
message (see [`viengoos_abi::rpc`]). Every address in the request is
looked up in the calling thread's address space. The reply is either
returned at once or, for the methods that wait (destruction, activity
statistics), delivered later to the reply messenger named in the
request; the caller is suspended in the meantime.
*/
use viengoos_abi::{
    addr::Addr,
    cap::CapType,
    error::{Error, Result},
    message::Message,
    rpc::{reply, Marshal, Request, RequestHeader},
    thread::{ExregsFlags, ExregsIn},
};

use crate::{
    aspace::Root,
    cap::Capability,
    kernel::WaitLocked,
    thread::{ExregsCaps, ThreadState},
    Kernel,
};

/// What became of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The reply, to be returned to the caller.
    Reply(Message),
    /// The reply will be delivered to the reply messenger.
    Deferred,
}

fn done<T: Marshal>(value: T) -> Result<Option<Message>> {
    Ok(Some(reply(&Ok(value))))
}

impl Kernel {
    /// Decode and perform the request in `msg` on behalf of `thread`.
    pub fn rpc(&self, thread: &Capability, msg: &Message) -> Dispatch {
        let (header, request) = match Request::decode(msg) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!("undecodable request: {}", error);
                return Dispatch::Reply(reply::<()>(&Err(error)));
            }
        };

        let locked = self.lock();
        match self.dispatch(&locked, thread, &header, &request) {
            Ok(Some(out)) => Dispatch::Reply(out),
            Ok(None) => {
                if let Ok((_, caller)) = self.thread_object(thread) {
                    caller.lock().set_state(ThreadState::Suspended);
                }
                trace!("{:?} deferred", request.method());
                Dispatch::Deferred
            }
            Err(error) => {
                trace!("{:?} on {} failed: {}", request.method(), header.target, error);
                Dispatch::Reply(reply::<()>(&Err(error)))
            }
        }
    }

    fn dispatch(
        &self,
        locked: &WaitLocked<'_>,
        thread: &Capability,
        header: &RequestHeader,
        request: &Request,
    ) -> Result<Option<Message>> {
        let root = self.thread_root(thread)?;
        if !header.principal.is_void() {
            self.lookup_object(locked, &root, header.principal, CapType::is_activity)?;
        }
        let reply_to = if header.reply.is_void() {
            None
        } else {
            let cap = self.lookup_cap(locked, &root, header.reply)?;
            Some(self.idle_messenger(&cap)?)
        };
        let target = || self.lookup_cap(locked, &root, header.target);
        let store = |slot: Addr, cap: Capability| {
            if slot.is_void() {
                Ok(())
            } else {
                self.store_cap(locked, &root, slot, cap)
            }
        };

        match request {
            Request::FolioAlloc { folio_slot, policy } => {
                let folio = self.folio_alloc_locked(locked, &target()?, *policy)?;
                store(*folio_slot, folio)?;
                done(())
            }
            Request::FolioFree { return_code } => {
                self.folio_free_locked(locked, &target()?, *return_code)?;
                done(())
            }
            Request::FolioObjectAlloc {
                index,
                cap_type,
                policy,
                return_code,
                object_slot,
                weak_slot,
            } => {
                let (strong, weak) = self.folio_object_alloc_locked(
                    locked,
                    &target()?,
                    *index as usize,
                    *cap_type,
                    *policy,
                    *return_code,
                )?;
                store(*object_slot, strong)?;
                store(*weak_slot, weak)?;
                done(())
            }
            Request::FolioPolicy { flags, policy } => {
                done(self.folio_policy_locked(locked, &target()?, *flags, *policy)?)
            }
            Request::CapCopy {
                source,
                flags,
                properties,
            } => {
                self.cap_copy_locked(locked, &root, header.target, *source, *flags, properties)?;
                done(())
            }
            Request::CapRead {} => done(self.cap_read_locked(locked, &root, header.target)?),
            Request::ObjectDiscardedClear {} => {
                self.object_discarded_clear(&target()?)?;
                done(())
            }
            Request::ObjectDiscard {} => {
                self.object_discard(&target()?)?;
                done(())
            }
            Request::ObjectStatus { clear } => done(self.object_status(&target()?, *clear)?),
            Request::ObjectReplyOnDestruction {} => {
                let reply_to = reply_to.ok_or(Error::InvalidArgument)?;
                self.object_reply_on_destruction_locked(locked, &target()?, reply_to)?;
                Ok(None)
            }
            Request::ThreadExregs { control, regs } => {
                let caps = self.exregs_caps(locked, &root, *control, regs)?;
                done(self.thread_exregs_locked(locked, &target()?, *control, &caps)?)
            }
            Request::ThreadId {} => done(self.thread_id(&target()?)?),
            Request::ThreadActivationCollect {} => {
                let remaining = self.thread_activation_collect_locked(locked, &target()?)?;
                done(remaining as u64)
            }
            Request::ActivityPolicy { flags, policy } => {
                done(self.activity_policy_locked(locked, &target()?, *flags, policy)?)
            }
            Request::ActivityInfo { flags, until_period } => {
                match self.activity_info_locked(locked, &target()?, *flags, *until_period, reply_to)? {
                    Some(info) => done(info),
                    None => Ok(None),
                }
            }
            Request::MessengerId { id } => done(self.messenger_id(&target()?, *id)?),
        }
    }

    /// Look up the capabilities `thread_exregs` installs. Slots not
    /// selected by `control`, or named by VOID, install void.
    fn exregs_caps(
        &self,
        locked: &WaitLocked<'_>,
        root: &Root,
        control: ExregsFlags,
        regs: &ExregsIn,
    ) -> Result<ExregsCaps> {
        let cap = |flag: ExregsFlags, addr: Addr| {
            if control.contains(flag) && !addr.is_void() {
                self.lookup_cap(locked, root, addr)
            } else {
                Ok(Capability::VOID)
            }
        };
        Ok(ExregsCaps {
            aspace: cap(ExregsFlags::SET_ASPACE, regs.aspace)?,
            aspace_properties: regs.aspace_properties,
            activity: cap(ExregsFlags::SET_ACTIVITY, regs.activity)?,
            exception_messenger: cap(ExregsFlags::SET_EXCEPTION_MESSENGER, regs.exception_messenger)?,
            utcb: cap(ExregsFlags::SET_UTCB, regs.utcb)?,
            sp: regs.sp,
            ip: regs.ip,
        })
    }
}
