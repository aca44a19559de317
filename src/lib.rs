//! A buddy allocator with optional three-quarter splitting.
//!
//! [`TernaryBuddy`] manages a power-of-two range of abstract address units
//! `[0, total)`. It hands out offsets, not memory: callers map the returned
//! blocks onto whatever resource they are partitioning.
//!
//! Two splitting policies are available:
//! - *halving*, the classic binary buddy rule, which splits a block while it
//!   is at least twice the requested size;
//! - *ternary* splitting, which satisfies a request between three quarters
//!   and one half of a block with a half-size piece plus a quarter-size piece,
//!   returning two blocks for one request.
//!
//! ```
//! use ternary_buddy::TernaryBuddy;
//!
//! let mut buddy = TernaryBuddy::new(16).unwrap();
//! let a = buddy.alloc(5).unwrap();
//!
//! // A half-size and a quarter-size block of an 8-unit parent.
//! let sizes: Vec<usize> = a.blocks().iter().map(|b| b.size()).collect();
//! assert_eq!(sizes, [4, 2]);
//!
//! buddy.free(a.requested(), a.blocks()).unwrap();
//! assert_eq!(buddy.blocks().count(), 1);
//! ```

#![doc(html_root_url = "https://docs.rs/ternary_buddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod accounting;
mod block;
pub mod buddy;
mod free_list;
mod registry;


use core::fmt;

pub use crate::{
    block::{Block, BlockId},
    buddy::{Allocation, Policy, TernaryBuddy},
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the requested capacity is zero or not a
    /// power of two.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::InvalidConfig => {
                f.write_str("allocator capacity must be a nonzero power of two")
            }
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// request size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// A request for zero units was made.
    ZeroSize,
    /// No free block large enough to satisfy the request exists.
    ///
    /// This covers both requests larger than the whole range and requests that
    /// fail due to fragmentation.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => f.write_str("zero-sized allocation request"),
            AllocError::Exhausted => f.write_str("no free block satisfies the request"),
        }
    }
}

/// The error type for [`TernaryBuddy::free`].
///
/// A rejected free leaves the allocator unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreeError {
    /// The block list was empty.
    Empty,
    /// A block does not refer to a currently allocated block.
    ///
    /// This is returned for blocks that were already freed, or whose handle
    /// was invalidated by a later split or merge.
    StaleBlock(BlockId),
    /// The blocks and requested size do not match exactly one allocation.
    MismatchedGroup,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::Empty => f.write_str("no blocks to free"),
            FreeError::StaleBlock(id) => write!(f, "block {id:?} is not currently allocated"),
            FreeError::MismatchedGroup => {
                f.write_str("blocks and size do not match a single allocation")
            }
        }
    }
}

/// A broken structural invariant, as reported by
/// [`TernaryBuddy::check_invariants`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A block does not start where its predecessor ends.
    Gap {
        /// The offset at which the next block was expected.
        expected: usize,
        /// The offset of the block actually found.
        found: usize,
    },
    /// The blocks do not end exactly at the capacity.
    Coverage {
        /// The end of the last block.
        end: usize,
    },
    /// A block's size is not a power of two, or its offset is not a multiple
    /// of its size.
    Misaligned {
        /// The block's offset.
        offset: usize,
        /// The block's size.
        size: usize,
    },
    /// A free list contains an allocated block or a block of the wrong size,
    /// or a free block is missing from its free list.
    FreeList {
        /// The size class whose list is inconsistent.
        level: u32,
    },
    /// The accounting counters disagree with the partitioning.
    Accounting {
        /// The sum of requested sizes.
        requested: usize,
        /// The sum of allocated block sizes.
        allocated: usize,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::Gap { expected, found } => {
                write!(f, "expected a block at {expected:#x}, found {found:#x}")
            }
            InvariantViolation::Coverage { end } => {
                write!(f, "blocks end at {end:#x} instead of the capacity")
            }
            InvariantViolation::Misaligned { offset, size } => {
                write!(f, "block of size {size:#x} at {offset:#x} is misaligned")
            }
            InvariantViolation::FreeList { level } => {
                write!(f, "free list for level {level} is inconsistent")
            }
            InvariantViolation::Accounting {
                requested,
                allocated,
            } => write!(
                f,
                "accounting mismatch: requested {requested:#x}, allocated {allocated:#x}"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

#[cfg(feature = "std")]
impl std::error::Error for FreeError {}

#[cfg(feature = "std")]
impl std::error::Error for InvariantViolation {}
