/*!
IPC flags and inline payloads

An IPC is made of up to three phases, each enabled by a flag: receive,
send and return. See the kernel's messenger documentation for the full
protocol.
*/
use heapless::Vec;

use crate::addr::Addr;
use crate::message::Message;

/// Number of data words an inline message carries.
pub const INLINE_WORDS: usize = 2;
/// Number of capabilities an inline message carries.
pub const INLINE_CAPS: usize = 1;

bitflags! {
    /// Phase selection and options for an IPC.
    #[derive(Default)]
    pub struct IpcFlags: u32 {
        /// Perform the receive phase.
        const RECEIVE = 1 << 0;
        /// Fail with `WouldBlock` rather than wait for a sender.
        const RECEIVE_NONBLOCKING = 1 << 1;
        /// Activate the receive messenger's thread on delivery.
        const RECEIVE_ACTIVATE = 1 << 2;
        /// Bind the receive messenger to the calling thread.
        const RECEIVE_SET_THREAD_TO_CALLER = 1 << 3;
        /// Resolve capabilities for the receive messenger in the caller's
        /// address space.
        const RECEIVE_SET_ASROOT_TO_CALLERS = 1 << 4;
        /// Receive into the messenger's inline area instead of a buffer.
        const RECEIVE_INLINE = 1 << 5;
        /// Store an inline capability at the given receive slot.
        const RECEIVE_INLINE_CAP1 = 1 << 6;

        /// Perform the send phase.
        const SEND = 1 << 8;
        /// Fail with `WouldBlock` rather than wait for the receiver.
        const SEND_NONBLOCKING = 1 << 9;
        /// Activate the send messenger's thread once delivered.
        const SEND_ACTIVATE = 1 << 10;
        const SEND_SET_THREAD_TO_CALLER = 1 << 11;
        const SEND_SET_ASROOT_TO_CALLERS = 1 << 12;
        /// Send the inline payload instead of a buffer.
        const SEND_INLINE = 1 << 13;
        const SEND_INLINE_WORD1 = 1 << 14;
        const SEND_INLINE_WORD2 = 1 << 15;
        const SEND_INLINE_CAP1 = 1 << 16;

        /// Return to the caller after the other phases instead of
        /// suspending until the next activation.
        const RETURN = 1 << 24;
    }
}

/// A small message carried in the messenger itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineMessage {
    pub words: Vec<u64, INLINE_WORDS>,
    pub caps: Vec<Addr, INLINE_CAPS>,
}

impl InlineMessage {
    /// Build from at most two words and at most one capability.
    pub fn new(words: &[u64], cap: Option<Addr>) -> Option<Self> {
        let mut msg = InlineMessage::default();
        msg.words.extend_from_slice(words).ok()?;
        if let Some(cap) = cap {
            msg.caps.push(cap).ok()?;
        }
        Some(msg)
    }

    /// Build from the flags of a send: `SEND_INLINE_WORD1/2` and
    /// `SEND_INLINE_CAP1` select which arguments are present.
    pub fn from_flags(flags: IpcFlags, word1: u64, word2: u64, cap: Addr) -> Self {
        let mut msg = InlineMessage::default();
        if flags.contains(IpcFlags::SEND_INLINE_WORD1) {
            let _ = msg.words.push(word1);
            if flags.contains(IpcFlags::SEND_INLINE_WORD2) {
                let _ = msg.words.push(word2);
            }
        }
        if flags.contains(IpcFlags::SEND_INLINE_CAP1) {
            let _ = msg.caps.push(cap);
        }
        msg
    }

    /// Convert a buffer message, if it is small enough. Trailing bytes
    /// that do not form a whole word make the message unfit.
    pub fn from_message(msg: &Message) -> Option<Self> {
        if msg.data_count() % 8 != 0 {
            return None;
        }
        let mut inline = InlineMessage::default();
        for word in msg.words() {
            inline.words.push(word).ok()?;
        }
        for cap in msg.caps() {
            inline.caps.push(cap).ok()?;
        }
        Some(inline)
    }

    /// Expand into a buffer message.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new();
        msg.append_caps(&self.caps);
        for word in self.words.iter() {
            msg.append_word(*word);
        }
        msg
    }
}

/// Arguments of an IPC. Every capability is named by an address in the
/// calling thread's address space; `Addr::VOID` means "none" or, for
/// buffers, "keep the one already bound".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcRequest {
    pub flags: IpcFlags,
    /// Messenger to receive on.
    pub recv_messenger: Addr,
    /// Page to receive into.
    pub recv_buf: Addr,
    /// Slot an inline capability is stored at.
    pub recv_inline_cap: Addr,
    /// Messenger to deliver to.
    pub target_messenger: Addr,
    /// Messenger to send from.
    pub send_messenger: Addr,
    /// Page holding the message to send.
    pub send_buf: Addr,
    /// Inline payload, used with `SEND_INLINE`.
    pub inline: InlineMessage,
}

impl IpcRequest {
    pub fn new(flags: IpcFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        let cap = Addr::from_bits(1, 4);
        let msg = InlineMessage::from_flags(
            IpcFlags::SEND_INLINE | IpcFlags::SEND_INLINE_WORD1 | IpcFlags::SEND_INLINE_CAP1,
            7,
            8,
            cap,
        );
        assert_eq!(&[7], &msg.words[..]);
        assert_eq!(&[cap], &msg.caps[..]);

        let empty = InlineMessage::from_flags(IpcFlags::SEND_INLINE_WORD2, 1, 2, cap);
        assert!(empty.words.is_empty());
    }

    #[test]
    fn test_message_conversion() {
        let inline = InlineMessage::new(&[1, 2], Some(Addr::from_bits(3, 2))).unwrap();
        let msg = inline.to_message();
        assert_eq!(1, msg.cap_count());
        assert_eq!(2, msg.word_count());
        assert_eq!(Some(inline), InlineMessage::from_message(&msg));

        let mut big = Message::new();
        for word in 0..3 {
            big.append_word(word);
        }
        assert_eq!(None, InlineMessage::from_message(&big));
        assert_eq!(None, InlineMessage::new(&[1, 2, 3], None));
    }
}
