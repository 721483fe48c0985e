#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;
#[macro_use]
extern crate viengoos_utils;

/// Exporting objects to clients.
pub mod cap_server;
/// Holding capabilities of servers.
pub mod cap_user;
/// The unlock, relock, revalidate pattern.
pub mod revalidate;
/// Typed stubs for the kernel's RPCs.
pub mod rm;
