/*!
Kernel RPC numbering and marshalling

A request is a message whose data words are:

```text
 word 0   method id
 word 1   target address
 word 2   principal activity address
 word 3   reply messenger address (VOID if none)
 word 4.. in-arguments, in declaration order
```

A reply carries an error code in word 0 (zero on success) followed, on
success, by the method's out-arguments.

Everything that crosses the boundary implements [`Marshal`]. Decoding is
strict: a missing word, a value out of range for its type or trailing
words make the whole message `InvalidArgument`, and an unknown method id
is `NotSupported`.
*/
use core::convert::TryFrom;

use crate::activity::{
    ActivityInfo, ActivityInfoFlags, ActivityMemoryPolicy, ActivityPolicy, ActivityPolicyFlags,
    ActivityStats, ACTIVITY_STATS_PERIODS,
};
use crate::addr::Addr;
use crate::addr_trans::CapAddrTrans;
use crate::cap::{CapCopyFlags, CapProperties, CapType, ObjectPolicy, UserCapability};
use crate::error::{Error, Result};
use crate::folio::{FolioPolicy, FolioPolicyFlags, ObjectStatus};
use crate::message::Message;
use crate::thread::{ExregsFlags, ExregsIn, ExregsOut};

/// Sequential reader over the data words of a message.
#[derive(Debug)]
pub struct Reader<'a> {
    msg: &'a Message,
    next: usize,
}

impl<'a> Reader<'a> {
    pub fn new(msg: &'a Message) -> Self {
        Self { msg, next: 0 }
    }

    pub fn word(&mut self) -> Result<u64> {
        if self.next >= self.msg.word_count() {
            return Err(Error::InvalidArgument);
        }
        let word = self.msg.word(self.next);
        self.next += 1;
        Ok(word)
    }

    pub fn read<T: Marshal>(&mut self) -> Result<T> {
        T::unmarshal(self)
    }

    /// Words not yet read.
    pub fn remaining(&self) -> usize {
        self.msg.word_count().saturating_sub(self.next)
    }

    /// Fail unless every word was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// A value that travels as a sequence of message words.
pub trait Marshal: Sized {
    fn marshal(&self, out: &mut Message);
    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self>;
}

impl Marshal for u64 {
    fn marshal(&self, out: &mut Message) {
        out.append_word(*self);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        reader.word()
    }
}

macro_rules! marshal_uint {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, out: &mut Message) {
                    out.append_word(*self as u64);
                }

                fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
                    <$ty>::try_from(reader.word()?).map_err(|_| Error::InvalidArgument)
                }
            }
        )*
    };
}

marshal_uint!(u8, u16, u32);

impl Marshal for bool {
    fn marshal(&self, out: &mut Message) {
        out.append_word(*self as u64);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        match reader.word()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl Marshal for () {
    fn marshal(&self, _out: &mut Message) {}

    fn unmarshal(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! marshal_tuple {
    ($($name:ident),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            #[allow(non_snake_case)]
            fn marshal(&self, out: &mut Message) {
                let ($($name,)+) = self;
                $($name.marshal(out);)+
            }

            fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
                Ok(($(reader.read::<$name>()?,)+))
            }
        }
    };
}

marshal_tuple!(A);
marshal_tuple!(A, B);
marshal_tuple!(A, B, C);
marshal_tuple!(A, B, C, D);

macro_rules! marshal_flags {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, out: &mut Message) {
                    out.append_word(self.bits() as u64);
                }

                fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
                    let bits = u32::try_from(reader.word()?).map_err(|_| Error::InvalidArgument)?;
                    <$ty>::from_bits(bits).ok_or(Error::InvalidArgument)
                }
            }
        )*
    };
}

marshal_flags!(
    CapCopyFlags,
    FolioPolicyFlags,
    ObjectStatus,
    ExregsFlags,
    ActivityPolicyFlags,
    ActivityInfoFlags
);

/// Types with a validated raw word form.
macro_rules! marshal_raw {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, out: &mut Message) {
                    out.append_word(self.to_raw());
                }

                fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
                    <$ty>::from_raw(reader.word()?).map_err(|_| Error::InvalidArgument)
                }
            }
        )*
    };
}

marshal_raw!(ObjectPolicy, FolioPolicy, ActivityMemoryPolicy);

impl Marshal for Addr {
    fn marshal(&self, out: &mut Message) {
        out.append_word(self.into_raw());
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Addr::from_raw(reader.word()?))
    }
}

impl Marshal for CapType {
    fn marshal(&self, out: &mut Message) {
        out.append_word(*self as u64);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        CapType::try_from(reader.word()?)
    }
}

impl Marshal for CapAddrTrans {
    fn marshal(&self, out: &mut Message) {
        out.append_word(self.to_raw());
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        CapAddrTrans::from_raw(reader.word()?).ok_or(Error::InvalidArgument)
    }
}

impl Marshal for CapProperties {
    fn marshal(&self, out: &mut Message) {
        self.policy.marshal(out);
        self.addr_trans.marshal(out);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(CapProperties {
            policy: reader.read()?,
            addr_trans: reader.read()?,
        })
    }
}

impl Marshal for UserCapability {
    fn marshal(&self, out: &mut Message) {
        self.cap_type.marshal(out);
        self.properties.marshal(out);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(UserCapability {
            cap_type: reader.read()?,
            properties: reader.read()?,
        })
    }
}

impl Marshal for ActivityPolicy {
    fn marshal(&self, out: &mut Message) {
        self.sibling_rel.marshal(out);
        self.child_rel.marshal(out);
        self.folios.marshal(out);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(ActivityPolicy {
            sibling_rel: reader.read()?,
            child_rel: reader.read()?,
            folios: reader.read()?,
        })
    }
}

impl Marshal for ActivityStats {
    fn marshal(&self, out: &mut Message) {
        for word in self.to_words().iter() {
            out.append_word(*word);
        }
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        let mut words = [0u64; ActivityStats::WORDS];
        for word in words.iter_mut() {
            *word = reader.word()?;
        }
        Ok(ActivityStats::from_words(words))
    }
}

impl Marshal for ActivityInfo {
    fn marshal(&self, out: &mut Message) {
        match self {
            ActivityInfo::Stats { count, stats } => {
                out.append_word(0);
                count.marshal(out);
                for sample in stats.iter() {
                    sample.marshal(out);
                }
            }
            ActivityInfo::Pressure { amount } => {
                out.append_word(1);
                amount.marshal(out);
            }
        }
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        match reader.word()? {
            0 => {
                let count: u8 = reader.read()?;
                if count as usize > ACTIVITY_STATS_PERIODS {
                    return Err(Error::InvalidArgument);
                }
                let mut stats = [ActivityStats::default(); ACTIVITY_STATS_PERIODS];
                for sample in stats.iter_mut() {
                    *sample = reader.read()?;
                }
                Ok(ActivityInfo::Stats { count, stats })
            }
            1 => Ok(ActivityInfo::Pressure {
                amount: reader.read()?,
            }),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl Marshal for ExregsIn {
    fn marshal(&self, out: &mut Message) {
        self.aspace.marshal(out);
        self.aspace_properties.marshal(out);
        self.activity.marshal(out);
        self.exception_messenger.marshal(out);
        self.utcb.marshal(out);
        self.sp.marshal(out);
        self.ip.marshal(out);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(ExregsIn {
            aspace: reader.read()?,
            aspace_properties: reader.read()?,
            activity: reader.read()?,
            exception_messenger: reader.read()?,
            utcb: reader.read()?,
            sp: reader.read()?,
            ip: reader.read()?,
        })
    }
}

impl Marshal for ExregsOut {
    fn marshal(&self, out: &mut Message) {
        self.sp.marshal(out);
        self.ip.marshal(out);
    }

    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(ExregsOut {
            sp: reader.read()?,
            ip: reader.read()?,
        })
    }
}

/// Addressing common to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    /// The object the method is invoked on.
    pub target: Addr,
    /// Activity the work is charged to. VOID means the caller's.
    pub principal: Addr,
    /// Messenger a deferred reply is delivered to.
    pub reply: Addr,
}

impl RequestHeader {
    pub fn new(target: Addr) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }
}

macro_rules! methods {
    ($($(#[$doc:meta])* $method:ident = $id:literal => { $($field:ident : $ty:ty),* }),* $(,)?) => {
        /// Method ids of the kernel objects.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u64)]
        pub enum MethodId {
            $($method = $id),*
        }

        impl MethodId {
            pub const ALL: &'static [MethodId] = &[$(MethodId::$method),*];

            pub const fn id(self) -> u64 {
                self as u64
            }
        }

        impl TryFrom<u64> for MethodId {
            type Error = Error;

            fn try_from(id: u64) -> Result<Self> {
                match id {
                    $($id => Ok(MethodId::$method),)*
                    _ => Err(Error::NotSupported),
                }
            }
        }

        /// A decoded request, one variant per method, holding its
        /// in-arguments.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Request {
            $($(#[$doc])* $method { $($field: $ty),* }),*
        }

        impl Request {
            pub fn method(&self) -> MethodId {
                match self {
                    $(Request::$method { .. } => MethodId::$method),*
                }
            }

            fn marshal_args(&self, out: &mut Message) {
                match self {
                    $(Request::$method { $($field),* } => {
                        $($field.marshal(out);)*
                    })*
                }
            }

            fn unmarshal_args(method: MethodId, reader: &mut Reader<'_>) -> Result<Self> {
                match method {
                    $(MethodId::$method => Ok(Request::$method {
                        $($field: reader.read()?),*
                    }),)*
                }
            }
        }
    };
}

methods! {
    /// Allocate a folio charged to the target activity and store the
    /// capability at `folio_slot`.
    FolioAlloc = 200 => { folio_slot: Addr, policy: FolioPolicy },
    /// Free the target folio and every object in it. Waiters are woken
    /// with `return_code`.
    FolioFree = 201 => { return_code: u64 },
    /// (Re)allocate object `index` of the target folio. The new strong
    /// and weak capabilities are stored at the given slots, unless VOID.
    FolioObjectAlloc = 202 => {
        index: u32,
        cap_type: CapType,
        policy: ObjectPolicy,
        return_code: u64,
        object_slot: Addr,
        weak_slot: Addr
    },
    /// Get and set the target folio's policy. Replies with the old one.
    FolioPolicy = 203 => { flags: FolioPolicyFlags, policy: FolioPolicy },
    /// Copy the capability at `source` into the target slot.
    CapCopy = 300 => { source: Addr, flags: CapCopyFlags, properties: CapProperties },
    /// Read the capability in the target slot.
    CapRead = 301 => {},
    ObjectDiscardedClear = 400 => {},
    ObjectDiscard = 401 => {},
    /// Report the referenced and dirty bits, clearing them if asked.
    ObjectStatus = 402 => { clear: bool },
    /// Reply once the target object is destroyed.
    ObjectReplyOnDestruction = 403 => {},
    ThreadExregs = 600 => { control: ExregsFlags, regs: ExregsIn },
    ThreadId = 601 => {},
    ThreadActivationCollect = 602 => {},
    /// Get and set the target activity's policy. Replies with the old one.
    ActivityPolicy = 700 => { flags: ActivityPolicyFlags, policy: ActivityPolicy },
    ActivityInfo = 701 => { flags: ActivityInfoFlags, until_period: u32 },
    /// Set the target messenger's id. Replies with the old one.
    MessengerId = 900 => { id: u64 },
}

impl Request {
    /// Build the request message.
    pub fn encode(&self, header: &RequestHeader) -> Message {
        let mut out = Message::new();
        out.append_word(self.method().id());
        header.target.marshal(&mut out);
        header.principal.marshal(&mut out);
        header.reply.marshal(&mut out);
        self.marshal_args(&mut out);
        out
    }

    /// Decode a request message.
    pub fn decode(msg: &Message) -> Result<(RequestHeader, Request)> {
        let mut reader = Reader::new(msg);
        let method = MethodId::try_from(reader.word()?)?;
        let header = RequestHeader {
            target: reader.read()?,
            principal: reader.read()?,
            reply: reader.read()?,
        };
        let request = Request::unmarshal_args(method, &mut reader)?;
        reader.finish()?;
        Ok((header, request))
    }
}

/// Build a reply: the error code, then the out-arguments on success.
pub fn reply<T: Marshal>(result: &Result<T>) -> Message {
    let mut out = Message::new();
    match result {
        Ok(value) => {
            out.append_word(0);
            value.marshal(&mut out);
        }
        Err(error) => out.append_word(error.code()),
    }
    out
}

/// Decode a reply built by [`reply`].
pub fn decode_reply<T: Marshal>(msg: &Message) -> Result<T> {
    let mut reader = Reader::new(msg);
    if let Some(error) = Error::from_code(reader.word()?) {
        return Err(error);
    }
    let value = reader.read()?;
    reader.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(request: Request) {
        let header = RequestHeader {
            target: Addr::from_bits(5, 8),
            principal: Addr::VOID,
            reply: Addr::from_bits(1, 2),
        };
        let msg = request.encode(&header);
        assert_eq!(request.method().id(), msg.word(0));
        assert_eq!(Ok((header, request)), Request::decode(&msg));
    }

    #[test]
    fn test_method_ids() {
        let expected: &[(MethodId, u64)] = &[
            (MethodId::FolioAlloc, 200),
            (MethodId::FolioFree, 201),
            (MethodId::FolioObjectAlloc, 202),
            (MethodId::FolioPolicy, 203),
            (MethodId::CapCopy, 300),
            (MethodId::CapRead, 301),
            (MethodId::ObjectDiscardedClear, 400),
            (MethodId::ObjectDiscard, 401),
            (MethodId::ObjectStatus, 402),
            (MethodId::ObjectReplyOnDestruction, 403),
            (MethodId::ThreadExregs, 600),
            (MethodId::ThreadId, 601),
            (MethodId::ThreadActivationCollect, 602),
            (MethodId::ActivityPolicy, 700),
            (MethodId::ActivityInfo, 701),
            (MethodId::MessengerId, 900),
        ];
        assert_eq!(expected.len(), MethodId::ALL.len());
        for (method, id) in expected {
            assert_eq!(*id, method.id());
            assert_eq!(Ok(*method), MethodId::try_from(*id));
        }
        assert_eq!(Err(Error::NotSupported), MethodId::try_from(500));
    }

    #[test]
    fn test_requests_decode() {
        round_trip(Request::FolioFree { return_code: 9 });
        round_trip(Request::FolioObjectAlloc {
            index: 127,
            cap_type: CapType::CapPage,
            policy: ObjectPolicy::new(true, -3),
            return_code: 42,
            object_slot: Addr::from_bits(3, 9),
            weak_slot: Addr::VOID,
        });
        round_trip(Request::CapCopy {
            source: Addr::from_bits(2, 3),
            flags: CapCopyFlags::WEAKEN | CapCopyFlags::COPY_SOURCE_GUARD,
            properties: CapProperties::new(
                ObjectPolicy::default(),
                CapAddrTrans::new(0b101, 3, 1, 2).unwrap(),
            ),
        });
        round_trip(Request::ThreadExregs {
            control: ExregsFlags::SET_SP_IP | ExregsFlags::GET_REGS,
            regs: ExregsIn {
                sp: 0x1000,
                ip: 0x2000,
                ..Default::default()
            },
        });
        round_trip(Request::ActivityInfo {
            flags: ActivityInfoFlags::STATS,
            until_period: 4,
        });
    }

    #[test]
    fn test_malformed_requests() {
        let mut unknown = Message::new();
        unknown.append_word(555);
        assert_eq!(Err(Error::NotSupported), Request::decode(&unknown));

        assert_eq!(Err(Error::InvalidArgument), Request::decode(&Message::new()));

        let mut short = Request::MessengerId { id: 1 }.encode(&RequestHeader::default());
        short.clear();
        short.append_word(MethodId::MessengerId.id());
        short.append_word(0);
        assert_eq!(Err(Error::InvalidArgument), Request::decode(&short));

        let mut trailing = Request::ThreadId {}.encode(&RequestHeader::default());
        trailing.append_word(9);
        assert_eq!(Err(Error::InvalidArgument), Request::decode(&trailing));

        let mut bad_type = Message::new();
        for word in [MethodId::FolioObjectAlloc.id(), 0, 0, 0, 1, 99, 0, 0, 0, 0].iter() {
            bad_type.append_word(*word);
        }
        assert_eq!(Err(Error::InvalidArgument), Request::decode(&bad_type));
    }

    #[test]
    fn test_replies() {
        let ok = reply(&Ok((7u64, true)));
        assert_eq!(0, ok.word(0));
        assert_eq!(Ok((7u64, true)), decode_reply::<(u64, bool)>(&ok));

        let err = reply::<u64>(&Err(Error::PermissionDenied));
        assert_eq!(1, err.word_count());
        assert_eq!(Err(Error::PermissionDenied), decode_reply::<u64>(&err));

        let info = ActivityInfo::Stats {
            count: 1,
            stats: [
                ActivityStats {
                    period: 3,
                    ..Default::default()
                },
                ActivityStats::default(),
            ],
        };
        assert_eq!(Ok(info), decode_reply(&reply(&Ok(info))));
    }
}
