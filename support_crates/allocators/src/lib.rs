//! Handle based storage primitives.
//!
//! Kernel tables in this workspace refer to their elements by small integer handles instead of pointers.
//! This crate provides the two pieces of bookkeeping such tables need:
//!
//! - [`FreeList`] hands out and takes back indices from a bounded pool.
//! - [`AgeList`] keeps indices in least-recently-used order so that a cache can pick a victim to recycle.
#![no_std]

extern crate alloc;

mod age_list;
mod free_list;

pub use age_list::AgeList;
pub use free_list::FreeList;

use thiserror_no_std::Error;

/// The error returned when an allocation fails
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum AllocError {
    #[error("the allocator has no free entries left to satisfy the request")]
    InsufficientMemory,
}
