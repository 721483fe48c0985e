/*!
The Viengoos object store and IPC core.

Memory is handed out in folios of [`FOLIO_OBJECTS`] typed objects. Every
object is reached through a versioned [`Capability`]; destroying an
object bumps its version, which kills every capability still naming it.
Threads name capabilities by address, walking a tree of cappages (see
[`aspace`]). Messengers are the rendezvous point of IPC (see [`ipc`]).

Everything hangs off a [`Kernel`], created by [`Kernel::bootstrap`].

[`FOLIO_OBJECTS`]: viengoos_abi::folio::FOLIO_OBJECTS
*/
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate getset;
#[macro_use]
extern crate log;
#[macro_use]
extern crate paste;
#[macro_use]
extern crate viengoos_utils;

/// Activity accounting.
pub mod activity;
/// Address space walks and capability slot access.
pub mod aspace;
/// The kernel's view of a capability.
pub mod cap;
/// Folios and the folio arena.
pub mod folio;
/// The three phase IPC.
pub mod ipc;
/// The kernel instance, its configuration and bootstrap.
pub mod kernel;
/// Messenger objects.
pub mod messenger;
/// Object identifiers and per object state.
pub mod object;
/// Kernel RPC demultiplexing.
pub mod rpc;
/// Translation cache.
pub mod shadow;
/// Thread objects and activations.
pub mod thread;
/// Object wait queues.
pub mod wait_queue;


pub use cap::Capability;
pub use kernel::{BootInfo, Kernel, KernelConfig};
pub use object::Oid;

/// Kernel and ABI types most callers need, for glob import.
pub mod prelude {
    pub use crate::aspace::{LookupMode, SlotLoc};
    pub use crate::cap::Capability;
    pub use crate::ipc::IpcOutcome;
    pub use crate::kernel::{BootInfo, Kernel, KernelConfig};
    pub use crate::object::Oid;
    pub use crate::rpc::Dispatch;
    pub use viengoos_abi::prelude::*;
}
