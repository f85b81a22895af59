//! Guarded page table address spaces.
//!
//! An address space is a tree of guarded page tables (GPTs) whose leaves are data pages or capability pages.
//! Every reference stored in a slot carries a [`Guard`](guard::Guard) that lets a single slot skip over an
//! arbitrary run of address bits, which keeps sparse spaces shallow.
//!
//! The crate is organized around the consumers of that tree:
//!
//! - [`builder`] extends trees offline while authoring a boot [`image`].
//! - [`populate`] extends a live tree one fault at a time.
//! - [`hwmap`] projects resolved paths onto Sv39 page tables and invalidates them precisely when slots change.
//! - [`ops`] is the mutation API through which every other change to a live tree happens.
//!
//! All of them agree on the tree through the shared [`walk`].
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod builder;
pub mod cap;
mod config;
mod context;
pub mod guard;
pub mod hwmap;
pub mod image;
pub mod invoke;
pub mod object;
pub mod ops;
pub mod populate;
pub mod store;
pub mod walk;

pub use cap::{Capability, Restrictions, Target};
pub use config::{Config, ConfigError};
pub use context::MemoryContext;
pub use guard::{Guard, GuardError};
pub use object::{Gpt, ObjectId, ObjectKind, ObjectRef, ObjectSource};
pub use store::{Bank, BankId, ObjectStore, SpaceBank};

/// Number of address bits covered by a single page
pub const PAGE_ADDR_BITS: u8 = 12;

/// How large each memory page is
pub const PAGE_SIZE: usize = 1 << PAGE_ADDR_BITS;

/// Width of the software address space that guards and walks operate on
pub const ADDR_BITS: u8 = 64;

/// Number of address bits used to select a slot of a GPT
pub const GPT_SLOT_INDEX_BITS: u8 = 4;

/// Number of slots in every GPT
pub const NUM_GPT_SLOTS: usize = 1 << GPT_SLOT_INDEX_BITS;

/// Slot holding the handler delegate when a GPT has its handler flag set
pub const GPT_HANDLER_SLOT: usize = NUM_GPT_SLOTS - 1;

/// Slot holding the background reference when a GPT has its background flag set
pub const GPT_BACKGROUND_SLOT: usize = NUM_GPT_SLOTS - 2;

/// The largest `l2v` a GPT may be configured with
pub const MAX_L2V: u8 = ADDR_BITS - 1;

/// Width of the match field of a guard
pub const GUARD_MATCH_BITS: u8 = 24;

/// Size of one serialized capability
pub const CAP_SIZE: usize = 16;

/// Number of capabilities held by a capability page
pub const CAPS_PER_PAGE: usize = PAGE_SIZE / CAP_SIZE;

/// Upper bound on the number of objects a single walk may traverse
pub const MAX_WALK_DEPTH: usize = 32;
