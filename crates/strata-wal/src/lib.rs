//! # Strata WAL
//!
//! Block-framed, checksummed log used by Strata both as the write-ahead log
//! and as the framing of manifest files.
//!
//! ## Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Strata.**
//!
//! Users should depend on the main `strata` crate instead, which provides
//! the stable public API. This crate's API may change without notice
//! between minor versions.
//!
//! ## Format
//!
//! A log file is a sequence of 32KB blocks; see [`record`] for the
//! physical record layout. Writers never rewrite earlier bytes, so a crash
//! can only leave a torn record at the tail, which readers treat as the end
//! of the log.

pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use reader::LogReader;
pub use record::{RecordType, BLOCK_SIZE, HEADER_SIZE};
pub use recovery::{RecoveryManager, RecoveryStats};
pub use writer::LogWriter;
