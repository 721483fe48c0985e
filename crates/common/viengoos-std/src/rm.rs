/*!
Typed stubs for the kernel's RPCs

[`Rm`] turns each kernel method into a plain function call: it builds the
request message, hands it to an [`Invoke`] transport and decodes the
reply. Methods the kernel may answer later (`object_reply_on_destruction`
and `activity_info`) return `Ok(None)` when the reply was deferred to the
reply messenger; decode it with [`decode_reply`] once it arrives.
*/
use viengoos_abi::{
    activity::{ActivityInfo, ActivityInfoFlags, ActivityPolicy, ActivityPolicyFlags},
    addr::Addr,
    cap::{CapCopyFlags, CapProperties, CapType, ObjectPolicy, UserCapability},
    error::{Error, Result},
    folio::{FolioPolicy, FolioPolicyFlags, ObjectStatus},
    message::Message,
    rpc::{Marshal, Request, RequestHeader},
    thread::{ExregsFlags, ExregsIn, ExregsOut},
};

pub use viengoos_abi::rpc::decode_reply;

/// Carries a request to the kernel.
pub trait Invoke {
    /// Deliver `request`. Returns the reply, or `None` if the kernel
    /// will deliver it to the request's reply messenger instead.
    fn invoke(&self, request: &Message) -> Result<Option<Message>>;
}

impl<I: Invoke + ?Sized> Invoke for &I {
    fn invoke(&self, request: &Message) -> Result<Option<Message>> {
        (**self).invoke(request)
    }
}

/// Client stubs over a transport. See module level documentation.
#[derive(Debug, Clone)]
pub struct Rm<I> {
    transport: I,
    /// Activity the calls are charged to. VOID is the caller's own.
    principal: Addr,
    /// Messenger deferred replies go to.
    reply: Addr,
}

impl<I: Invoke> Rm<I> {
    pub fn new(transport: I) -> Self {
        Self {
            transport,
            principal: Addr::VOID,
            reply: Addr::VOID,
        }
    }

    pub fn with_principal(mut self, principal: Addr) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_reply(mut self, reply: Addr) -> Self {
        self.reply = reply;
        self
    }

    pub fn transport(&self) -> &I {
        &self.transport
    }

    fn send<T: Marshal>(&self, target: Addr, request: Request) -> Result<Option<T>> {
        let header = RequestHeader {
            target,
            principal: self.principal,
            reply: self.reply,
        };
        let msg = request.encode(&header);
        match self.transport.invoke(&msg)? {
            Some(reply) => decode_reply(&reply).map(Some),
            None => Ok(None),
        }
    }

    /// Invoke a method that always replies at once.
    fn call<T: Marshal>(&self, target: Addr, request: Request) -> Result<T> {
        let method = request.method();
        self.send(target, request)?.ok_or_else(|| {
            warn!("{:?} unexpectedly deferred", method);
            Error::WouldBlock
        })
    }

    /// Allocate a folio charged to `activity` and store it at `folio_slot`.
    pub fn folio_alloc(&self, activity: Addr, folio_slot: Addr, policy: FolioPolicy) -> Result<()> {
        self.call(activity, Request::FolioAlloc { folio_slot, policy })
    }

    /// Free `folio`. Its waiters are woken with `return_code`.
    pub fn folio_free(&self, folio: Addr, return_code: u64) -> Result<()> {
        self.call(folio, Request::FolioFree { return_code })
    }

    /// (Re)allocate object `index` of `folio` as `cap_type`. Waiters on
    /// the previous object are woken with `return_code`.
    #[allow(clippy::too_many_arguments)]
    pub fn folio_object_alloc(
        &self,
        folio: Addr,
        index: u32,
        cap_type: CapType,
        policy: ObjectPolicy,
        return_code: u64,
        object_slot: Addr,
        weak_slot: Addr,
    ) -> Result<()> {
        self.call(
            folio,
            Request::FolioObjectAlloc {
                index,
                cap_type,
                policy,
                return_code,
                object_slot,
                weak_slot,
            },
        )
    }

    pub fn folio_policy(&self, folio: Addr, flags: FolioPolicyFlags, policy: FolioPolicy) -> Result<FolioPolicy> {
        self.call(folio, Request::FolioPolicy { flags, policy })
    }

    pub fn cap_copy(
        &self,
        target: Addr,
        source: Addr,
        flags: CapCopyFlags,
        properties: CapProperties,
    ) -> Result<()> {
        self.call(
            target,
            Request::CapCopy {
                source,
                flags,
                properties,
            },
        )
    }

    /// Copy `source` to `target`, weakened.
    pub fn cap_copy_weaken(&self, target: Addr, source: Addr) -> Result<()> {
        self.cap_copy(target, source, CapCopyFlags::WEAKEN, CapProperties::default())
    }

    pub fn cap_read(&self, slot: Addr) -> Result<UserCapability> {
        self.call(slot, Request::CapRead {})
    }

    pub fn object_discarded_clear(&self, object: Addr) -> Result<()> {
        self.call(object, Request::ObjectDiscardedClear {})
    }

    pub fn object_discard(&self, object: Addr) -> Result<()> {
        self.call(object, Request::ObjectDiscard {})
    }

    pub fn object_status(&self, object: Addr, clear: bool) -> Result<ObjectStatus> {
        self.call(object, Request::ObjectStatus { clear })
    }

    /// Ask for the destroyer's return code once `object` is destroyed.
    pub fn object_reply_on_destruction(&self, object: Addr) -> Result<Option<u64>> {
        self.send(object, Request::ObjectReplyOnDestruction {})
    }

    pub fn thread_exregs(&self, thread: Addr, control: ExregsFlags, regs: ExregsIn) -> Result<ExregsOut> {
        self.call(thread, Request::ThreadExregs { control, regs })
    }

    pub fn thread_id(&self, thread: Addr) -> Result<u64> {
        self.call(thread, Request::ThreadId {})
    }

    /// Deliver the next pending activation. Returns how many remain.
    pub fn thread_activation_collect(&self, thread: Addr) -> Result<u64> {
        self.call(thread, Request::ThreadActivationCollect {})
    }

    pub fn activity_policy(
        &self,
        activity: Addr,
        flags: ActivityPolicyFlags,
        policy: ActivityPolicy,
    ) -> Result<ActivityPolicy> {
        self.call(activity, Request::ActivityPolicy { flags, policy })
    }

    pub fn activity_info(
        &self,
        activity: Addr,
        flags: ActivityInfoFlags,
        until_period: u32,
    ) -> Result<Option<ActivityInfo>> {
        self.send(activity, Request::ActivityInfo { flags, until_period })
    }

    /// Set the id of `messenger`. Returns the old one.
    pub fn messenger_id(&self, messenger: Addr, id: u64) -> Result<u64> {
        self.call(messenger, Request::MessengerId { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;
    use viengoos_abi::{bootstrap::BootInfo, folio::FOLIO_OBJECTS};
    use viengoos_kernel_core::{rpc::Dispatch, Capability, Kernel, KernelConfig};

    /// Hands requests straight to a kernel, on behalf of one thread.
    struct Direct<'a> {
        kernel: &'a Kernel,
        thread: Capability,
    }

    impl Invoke for Direct<'_> {
        fn invoke(&self, request: &Message) -> Result<Option<Message>> {
            match self.kernel.rpc(&self.thread, request) {
                Dispatch::Reply(reply) => Ok(Some(reply)),
                Dispatch::Deferred => Ok(None),
            }
        }
    }

    /// Records requests and answers each with a canned reply.
    struct Canned {
        sent: Mutex<Vec<Message>>,
        reply: Option<Message>,
    }

    impl Invoke for Canned {
        fn invoke(&self, request: &Message) -> Result<Option<Message>> {
            self.sent.lock().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_header_carries_principal_and_reply() {
        let transport = Canned {
            sent: Mutex::new(Vec::new()),
            reply: Some(viengoos_abi::rpc::reply(&Ok(7u64))),
        };
        let rm = Rm::new(&transport)
            .with_principal(BootInfo::slot(1))
            .with_reply(BootInfo::slot(4));
        assert_eq!(Ok(7), rm.thread_id(BootInfo::slot(2)));

        let sent = transport.sent.lock();
        let (header, request) = Request::decode(&sent[0]).unwrap();
        assert_eq!(BootInfo::slot(2), header.target);
        assert_eq!(BootInfo::slot(1), header.principal);
        assert_eq!(BootInfo::slot(4), header.reply);
        assert_eq!(Request::ThreadId {}, request);
    }

    #[test]
    fn test_unexpected_deferral() {
        let transport = Canned {
            sent: Mutex::new(Vec::new()),
            reply: None,
        };
        let rm = Rm::new(&transport);
        assert_eq!(Err(Error::WouldBlock), rm.thread_id(BootInfo::slot(2)));
        assert_eq!(Ok(None), rm.object_reply_on_destruction(BootInfo::slot(2)));
    }

    #[test]
    fn test_stubs_against_kernel() {
        let (kernel, boot) = Kernel::bootstrap(KernelConfig::default()).unwrap();
        let rm = Rm::new(Direct {
            kernel: &kernel,
            thread: boot.thread,
        });
        let user = boot.user;
        let folio = BootInfo::slot(user.first_free_slot);
        let page = BootInfo::slot(user.first_free_slot + 1);
        let weak = BootInfo::slot(user.first_free_slot + 2);

        rm.folio_alloc(user.activity, folio, FolioPolicy::default()).unwrap();
        rm.folio_object_alloc(folio, 5, CapType::Page, ObjectPolicy::default(), 0, page, Addr::VOID)
            .unwrap();
        rm.cap_copy_weaken(weak, page).unwrap();
        assert_eq!(CapType::ReadOnlyPage, rm.cap_read(weak).unwrap().cap_type);
        assert_eq!(ObjectStatus::empty(), rm.object_status(page, true).unwrap());

        assert_eq!(
            Err(Error::InvalidArgument),
            rm.folio_object_alloc(
                folio,
                FOLIO_OBJECTS as u32,
                CapType::Page,
                ObjectPolicy::default(),
                0,
                Addr::VOID,
                Addr::VOID
            )
        );

        assert_eq!(Ok(0), rm.messenger_id(user.messenger, 77));
        assert_eq!(Ok(77), rm.messenger_id(user.messenger, 78));
        assert_eq!(kernel.thread_id(&boot.thread), rm.thread_id(user.thread));

        let old = rm
            .activity_policy(user.activity, ActivityPolicyFlags::empty(), ActivityPolicy::default())
            .unwrap();
        assert_eq!(ActivityPolicy::default(), old);

        rm.folio_free(folio, 0).unwrap();
        assert_eq!(UserCapability::VOID, rm.cap_read(page).unwrap());
        assert_eq!(Err(Error::NoObject), rm.object_status(page, false));
    }

    #[test]
    fn test_deferred_activity_info() {
        let (kernel, boot) = Kernel::bootstrap(KernelConfig::default()).unwrap();
        let user = boot.user;
        let rm = Rm::new(Direct {
            kernel: &kernel,
            thread: boot.thread,
        })
        .with_reply(user.messenger);
        assert_eq!(Ok(None), rm.activity_info(user.activity, ActivityInfoFlags::STATS, 1));
    }
}
