//! # Strata Core
//!
//! Shared types for the Strata storage engine: errors, options, the
//! user-key comparator, on-disk format versions and a memoizing cell.
//!
//! This crate is an internal implementation detail; applications should
//! depend on `strata` instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod comparator;
pub mod error;
pub mod format_version;
pub mod lazy;
pub mod options;

pub use comparator::{BytewiseComparator, Comparator};
pub use error::{Error, Result};
pub use lazy::Lazy;
pub use options::{CompactionConfig, CompressionType, Options, NUM_LEVELS};

/// Monotonically increasing version stamp assigned to every mutation.
///
/// Only the low 56 bits are usable; the top byte is reserved for the
/// operation type in an internal key tag.
pub type SequenceNumber = u64;

/// Largest representable sequence number.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;
