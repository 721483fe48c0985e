#![cfg_attr(not(test), no_std)]

pub mod activity;
pub mod addr;
pub mod addr_trans;
pub mod bootstrap;
pub mod cap;
pub mod error;
pub mod folio;
pub mod ipc;
pub mod message;
pub mod rpc;
pub mod thread;

#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate bitflags;

/// Size of a page, and so of every object and message buffer.
pub const PAGESIZE: usize = 4096;

/// The ABI types most callers need, for glob import.
pub mod prelude {
    pub use crate::addr::Addr;
    pub use crate::addr_trans::CapAddrTrans;
    pub use crate::cap::{CapProperties, CapType, ObjectPolicy, UserCapability};
    pub use crate::error::{Error, Result};
    pub use crate::message::Message;
}

/// A trait that allows resetting a struct back to its default value.
pub trait SetDefault {
    /// Reset this struct back to its default value.
    fn set_default(&mut self);
}
