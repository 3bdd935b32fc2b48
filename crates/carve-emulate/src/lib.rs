//! # carve-emulate
//!
//! The abstract machine behind carve's structure recovery.
//!
//! This crate provides:
//! - a symbolic/concrete [`Value`] algebra with source tracking,
//! - a canonicalized register file over a fixed x86-64 whitelist,
//! - persistent byte-addressed [`Memory`] with cheap forking,
//! - immutable [`Context`] snapshots with a register-write hash used for
//!   deduplication,
//! - an x86-64 [`Emulator`] interpreting decoded instructions against a
//!   context.

pub mod context;
pub mod memory;
pub mod registers;
pub mod value;
pub mod x86_64;

pub use context::{Context, Contexts};
pub use memory::{Memory, MemoryValues};
pub use registers::{RegSlot, RegisterFile};
pub use value::{
    hash_combine, points_to_stack, stack_argument_number, stack_sentinel, Addr, RootKey, Symbol,
    SymbolIds, Value, STACK_MAGIC,
};
pub use x86_64::{is_write_access, memory_address, Emulator};
