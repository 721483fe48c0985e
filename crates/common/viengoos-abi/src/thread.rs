/*!
Thread slots, register exchange and the user thread control block
*/
use crate::addr::Addr;
use crate::cap::CapProperties;
use crate::ipc::InlineMessage;
use crate::SetDefault;

/// Number of capability slots in a thread object.
pub const THREAD_SLOTS: usize = 4;
/// Address bits consumed when the address space walk passes a thread.
pub const THREAD_SLOTS_LOG2: u32 = 2;

/// The capability slots of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadSlot {
    /// Root of the thread's address space.
    Aspace = 0,
    /// Activity the thread's execution is charged to.
    Activity = 1,
    /// Messenger faults and exceptions are delivered to.
    ExceptionMessenger = 2,
    /// Page holding the thread's control block.
    Utcb = 3,
}

impl ThreadSlot {
    pub const ALL: [ThreadSlot; THREAD_SLOTS] = [
        ThreadSlot::Aspace,
        ThreadSlot::Activity,
        ThreadSlot::ExceptionMessenger,
        ThreadSlot::Utcb,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<ThreadSlot> {
        Self::ALL.get(index).copied()
    }
}

bitflags! {
    /// What `thread_exregs` changes and reports.
    #[derive(Default)]
    pub struct ExregsFlags: u32 {
        const SET_UTCB = 1 << 0;
        const SET_EXCEPTION_MESSENGER = 1 << 1;
        const SET_ASPACE = 1 << 2;
        const SET_ACTIVITY = 1 << 3;
        const SET_SP = 1 << 4;
        const SET_IP = 1 << 5;
        /// Return the stack and instruction pointers as they were before
        /// this call.
        const GET_REGS = 1 << 6;
        const START = 1 << 7;
        const STOP = 1 << 8;
        /// Cancel a send the thread is blocked in.
        const ABORT_SEND = 1 << 9;
        /// Cancel a receive the thread is waiting in.
        const ABORT_RECEIVE = 1 << 10;

        const SET_SP_IP = Self::SET_SP.bits | Self::SET_IP.bits;
        const SET_SLOTS = Self::SET_UTCB.bits
            | Self::SET_EXCEPTION_MESSENGER.bits
            | Self::SET_ASPACE.bits
            | Self::SET_ACTIVITY.bits;
        const ABORT_IPC = Self::ABORT_SEND.bits | Self::ABORT_RECEIVE.bits;
    }
}

/// In-arguments of `thread_exregs`. Capability slots are named by
/// addresses in the caller's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExregsIn {
    pub aspace: Addr,
    /// Properties the address space root is installed with.
    pub aspace_properties: CapProperties,
    pub activity: Addr,
    pub exception_messenger: Addr,
    pub utcb: Addr,
    pub sp: u64,
    pub ip: u64,
}

/// Out-arguments of `thread_exregs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExregsOut {
    pub sp: u64,
    pub ip: u64,
}

bitflags! {
    /// Activation state of a thread.
    #[derive(Default)]
    pub struct UtcbMode: u32 {
        /// The thread runs its activation handler.
        const ACTIVATED = 1 << 0;
        /// Activations are queued and waiting to be collected.
        const PENDING_MESSAGE = 1 << 1;
        /// The thread was interrupted while leaving activated mode.
        const INTERRUPT_IN_TRANSITION = 1 << 2;
    }
}

/// The user thread control block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Utcb {
    pub mode: UtcbMode,
    /// Instruction pointer at the time of the last activation.
    pub saved_ip: u64,
    /// Stack pointer at the time of the last activation.
    pub saved_sp: u64,
    /// Entry point of the activation handler.
    pub activation_handler_ip: u64,
    /// Stack the activation handler runs on.
    pub activation_handler_sp: u64,
    /// Id of the messenger behind the most recent activation.
    pub messenger_id: u64,
    /// Inline payload of the most recent activation.
    pub inline: InlineMessage,
}

impl SetDefault for Utcb {
    fn set_default(&mut self) {
        *self = Utcb::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_indices() {
        for (index, slot) in ThreadSlot::ALL.iter().enumerate() {
            assert_eq!(index, slot.index());
            assert_eq!(Some(*slot), ThreadSlot::from_index(index));
        }
        assert_eq!(None, ThreadSlot::from_index(THREAD_SLOTS));
        assert_eq!(THREAD_SLOTS, 1 << THREAD_SLOTS_LOG2);
    }

    #[test]
    fn test_utcb_reset() {
        let mut utcb = Utcb {
            mode: UtcbMode::ACTIVATED | UtcbMode::PENDING_MESSAGE,
            messenger_id: 3,
            ..Default::default()
        };
        utcb.set_default();
        assert!(utcb.mode.is_empty());
        assert_eq!(0, utcb.messenger_id);
    }
}
