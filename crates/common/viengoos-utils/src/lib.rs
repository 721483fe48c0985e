#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod macros;

/// Bit twiddling helpers shared by the address and translation code.
pub mod bits;
/// Integer keyed hash table.
pub mod ihash;
/// Fixed size object pools.
pub mod slab;
