//! Atomic write batches.
//!
//! A batch is also the payload of one write-ahead log record:
//!
//! ```text
//! [sequence: u64 LE] [count: u32 LE] records...
//! record := [tag: u8] [key_len: u32 LE] [key] ([value_len: u32 LE] [value])?
//! ```
//!
//! Tag 1 is a put and carries a value; tag 0 is a delete.

use crate::key::ValueType;
use crate::memtable::MemTable;
use strata_core::{Error, Result, SequenceNumber};

/// sequence (8) + count (4)
pub const BATCH_HEADER_SIZE: usize = 12;

/// One operation of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp<'a> {
    /// Insert or overwrite
    Put {
        /// User key
        key: &'a [u8],
        /// Value
        value: &'a [u8],
    },
    /// Remove
    Delete {
        /// User key
        key: &'a [u8],
    },
}

/// An ordered list of puts and deletes applied atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; BATCH_HEADER_SIZE],
        }
    }

    /// Queue a put of `key` -> `value`
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
        self
    }

    /// Queue a delete of `key`
    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed(&mut self.rep, key);
        self
    }

    /// Remove every queued operation
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Number of queued operations
    pub fn count(&self) -> u32 {
        u32::from_le_bytes([self.rep[8], self.rep[9], self.rep[10], self.rep[11]])
    }

    /// True when no operation is queued
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Sequence number of the first operation
    pub fn sequence(&self) -> SequenceNumber {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.rep[0..8]);
        u64::from_le_bytes(buf)
    }

    /// Assign the sequence number of the first operation
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[0..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Size of the encoded batch, used for group-commit budgeting
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Append every operation of `other` after this batch's operations
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Encoded bytes, as written to the log
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuild a batch from a log record
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "write batch too small: {} bytes",
                contents.len()
            )));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }

    /// Iterate the operations in order
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            data: &self.rep[BATCH_HEADER_SIZE..],
        }
    }

    /// Decode every operation and check the stored count.
    ///
    /// A batch that passes can be applied without a decoding error.
    pub fn validate(&self) -> Result<()> {
        let mut found = 0u32;
        for op in self.iter() {
            op?;
            found += 1;
        }
        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch has wrong count: header says {}, found {}",
                self.count(),
                found
            )));
        }
        Ok(())
    }

    /// Insert every operation into `mem`, numbering them from `sequence()`.
    ///
    /// The batch is validated first, so a malformed batch leaves `mem`
    /// untouched and fails with `Corruption`.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        self.validate()?;
        let mut sequence = self.sequence();
        for op in self.iter() {
            match op? {
                BatchOp::Put { key, value } => mem.add(sequence, ValueType::Value, key, value),
                BatchOp::Delete { key } => mem.add(sequence, ValueType::Deletion, key, &[]),
            }
            sequence += 1;
        }
        Ok(())
    }
}

fn put_length_prefixed(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(&(data.len() as u32).to_le_bytes());
    dst.extend_from_slice(data);
}

fn get_length_prefixed<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    if input.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    let rest = &input[4..];
    if rest.len() < len {
        return None;
    }
    let (data, tail) = rest.split_at(len);
    *input = tail;
    Some(data)
}

/// Iterator over the operations of a [`WriteBatch`]
pub struct BatchIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&tag, mut rest) = self.data.split_first()?;
        let op = match ValueType::from_u8(tag) {
            Some(ValueType::Value) => {
                match (
                    get_length_prefixed(&mut rest),
                    get_length_prefixed(&mut rest),
                ) {
                    (Some(key), Some(value)) => Ok(BatchOp::Put { key, value }),
                    _ => Err(Error::Corruption("bad write batch put".to_string())),
                }
            }
            Some(ValueType::Deletion) => match get_length_prefixed(&mut rest) {
                Some(key) => Ok(BatchOp::Delete { key }),
                None => Err(Error::Corruption("bad write batch delete".to_string())),
            },
            None => Err(Error::Corruption(format!(
                "unknown write batch tag: {}",
                tag
            ))),
        };
        // Stop after the first malformed record
        self.data = if op.is_ok() { rest } else { &[] };
        Some(op)
    }
}
