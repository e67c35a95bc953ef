//! User-facing iterator.
//!
//! Wraps the merged internal-key cursor over memtables and tables and
//! collapses it to one entry per user key: the newest version visible at
//! the iterator's sequence number, with deleted keys hidden.

use super::DbInner;
use crate::iterator::InternalIterator;
use crate::key::{
    append_internal_key, extract_user_key, parse_internal_key, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::version::Version;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;
use strata_core::{Comparator, Error, Lazy, Result, SequenceNumber};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The internal cursor is at the entry that yields `key()`
    Forward,
    /// The internal cursor is just before all entries of `key()`, which is
    /// cached in `saved_key`/`saved_value`
    Reverse,
}

struct IterCore {
    inner: Arc<DbInner>,
    /// Keeps the tables under the cursor alive and takes read samples
    version: Arc<Version>,
    iter: Box<dyn InternalIterator>,
    ucmp: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    status: Result<()>,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    /// Decoded tag of the entry under the cursor. A reverse scan stops on
    /// the entry before its key and parses it again on the next step.
    current: Lazy<(SequenceNumber, ValueType)>,
    direction: Direction,
    valid: bool,
    bytes_until_read_sampling: u64,
}

impl IterCore {
    fn random_sampling_period(&self) -> u64 {
        let period = self.inner.options.compaction.read_sample_period;
        rand::thread_rng().gen_range(0..2 * period)
    }

    /// Parse the current internal key, charging its bytes against the read
    /// sampling budget the first time the entry is seen.
    fn parse_key(&mut self) -> Option<(SequenceNumber, ValueType)> {
        if !self.current.is_initialized() {
            let bytes = (self.iter.key().len() + self.iter.value().len()) as u64;
            while self.bytes_until_read_sampling < bytes {
                let period = self.random_sampling_period();
                self.bytes_until_read_sampling += period;
                self.inner.record_read_sample(&self.version, self.iter.key());
            }
            self.bytes_until_read_sampling -= bytes;
        }

        let key = self.iter.key();
        let parsed = self
            .current
            .get_or_init(|| parse_internal_key(key).map(|p| (p.sequence, p.value_type)))
            .copied();
        if parsed.is_none() {
            self.status = Err(Error::Corruption(
                "corrupted internal key in iterator".to_string(),
            ));
        }
        parsed
    }

    fn cursor_next(&mut self) {
        self.current.reset();
        self.iter.next();
    }

    fn cursor_prev(&mut self) {
        self.current.reset();
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Ok(()) => self.iter.status(),
            Err(e) => Err(e.clone()),
        }
    }

    /// Advance to the first visible, non-deleted entry at or after the
    /// cursor. With `skipping`, entries for user keys <= `saved_key` are
    /// hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        while self.iter.valid() {
            if let Some((sequence, value_type)) = self.parse_key() {
                if sequence <= self.sequence {
                    let user_key = extract_user_key(self.iter.key());
                    match value_type {
                        ValueType::Deletion => {
                            // Hide every older entry for this key
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self.ucmp.compare(user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.cursor_next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Step back over the entries of the previous user key, caching its
    /// newest visible version.
    fn find_prev_user_entry(&mut self) {
        let mut value_type = ValueType::Deletion;
        while self.iter.valid() {
            if let Some((sequence, entry_type)) = self.parse_key() {
                if sequence <= self.sequence {
                    let user_key = extract_user_key(self.iter.key());
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(user_key, &self.saved_key) == Ordering::Less
                    {
                        // Passed all entries of the key we cached
                        break;
                    }
                    value_type = entry_type;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    if entry_type == ValueType::Value {
                        self.saved_key.extend_from_slice(user_key);
                        self.saved_value.extend_from_slice(self.iter.value());
                    }
                }
            }
            self.cursor_prev();
        }

        if value_type == ValueType::Deletion {
            // Ran off the front
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    fn next(&mut self) {
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The cursor is before the entries of saved_key; step into them
            // and let find_next_user_entry skip past them
            if self.iter.valid() {
                self.cursor_next();
            } else {
                self.current.reset();
                self.iter.seek_to_first();
            }
        } else {
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            self.cursor_next();
        }
        if !self.iter.valid() {
            self.valid = false;
            self.saved_key.clear();
            return;
        }
        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        if self.direction == Direction::Forward {
            // Back up to just before every entry of the current key
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            loop {
                self.cursor_prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(&mut self.saved_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.current.reset();
        self.iter.seek(&self.saved_key);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.current.reset();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.current.reset();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }
}

/// A cursor over the user keys of a database, in comparator order.
///
/// The iterator reads a consistent view: the state as of its snapshot (or
/// of its creation) is unaffected by later writes and compactions. It holds
/// table files open until it is closed or dropped.
///
/// ```ignore
/// let mut it = db.new_iterator(&ReadOptions::default());
/// it.seek_to_first();
/// while it.valid() {
///     println!("{:?} => {:?}", it.key(), it.value());
///     it.next();
/// }
/// it.status()?;
/// ```
pub struct DbIterator {
    core: Option<IterCore>,
}

impl DbIterator {
    pub(super) fn new(
        inner: Arc<DbInner>,
        iter: Box<dyn InternalIterator>,
        sequence: SequenceNumber,
        version: Arc<Version>,
    ) -> Self {
        let ucmp = Arc::clone(inner.icmp.user_comparator());
        let mut core = IterCore {
            inner,
            version,
            iter,
            ucmp,
            sequence,
            status: Ok(()),
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            current: Lazy::new(),
            direction: Direction::Forward,
            valid: false,
            bytes_until_read_sampling: 0,
        };
        core.bytes_until_read_sampling = core.random_sampling_period();
        Self { core: Some(core) }
    }

    /// True when positioned at an entry
    pub fn valid(&self) -> bool {
        self.core.as_ref().is_some_and(|c| c.valid)
    }

    /// Position at the smallest key
    pub fn seek_to_first(&mut self) {
        if let Some(core) = self.core.as_mut() {
            core.seek_to_first();
        }
    }

    /// Position at the largest key
    pub fn seek_to_last(&mut self) {
        if let Some(core) = self.core.as_mut() {
            core.seek_to_last();
        }
    }

    /// Position at the first key >= `target`
    pub fn seek(&mut self, target: &[u8]) {
        if let Some(core) = self.core.as_mut() {
            core.seek(target);
        }
    }

    /// Move to the next key; does nothing unless [`valid`](Self::valid)
    pub fn next(&mut self) {
        if let Some(core) = self.core.as_mut().filter(|c| c.valid) {
            core.next();
        }
    }

    /// Move to the previous key; does nothing unless [`valid`](Self::valid)
    pub fn prev(&mut self) {
        if let Some(core) = self.core.as_mut().filter(|c| c.valid) {
            core.prev();
        }
    }

    /// Current user key, or an empty slice when not valid
    pub fn key(&self) -> &[u8] {
        match &self.core {
            Some(core) if core.valid => core.key(),
            _ => &[],
        }
    }

    /// Current value, or an empty slice when not valid
    pub fn value(&self) -> &[u8] {
        match &self.core {
            Some(core) if core.valid => core.value(),
            _ => &[],
        }
    }

    /// First error hit while iterating
    pub fn status(&self) -> Result<()> {
        match &self.core {
            Some(core) => core.status(),
            None => Ok(()),
        }
    }

    /// Release the tables and version held by this iterator.
    ///
    /// Closing twice is harmless; a closed iterator is never valid.
    pub fn close(&mut self) {
        if let Some(core) = self.core.take() {
            trace!(sequence = core.sequence, "Closed iterator");
        }
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("valid", &self.valid())
            .field("closed", &self.core.is_none())
            .finish()
    }
}
