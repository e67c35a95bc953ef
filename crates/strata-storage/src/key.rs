//! Internal keys.
//!
//! An internal key is the user key followed by an 8-byte little-endian tag,
//! `tag = (sequence << 8) | value_type`. Internal keys order by user key
//! ascending, then by tag descending, so the newest version of a user key
//! sorts first.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use strata_core::{Comparator, SequenceNumber, MAX_SEQUENCE_NUMBER};

/// Length of the tag suffix
pub const TAG_SIZE: usize = 8;

/// Operation recorded in an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone
    Deletion = 0,
    /// Value
    Value = 1,
}

impl ValueType {
    /// Parse a tag's low byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// The value type used when building a seek target.
///
/// Tags sort descending, so seeking with the highest type positions before
/// every entry with the same user key and sequence number.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Pack a sequence number and value type into a tag
pub fn pack_tag(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Append the internal-key encoding of `(user_key, sequence, value_type)` to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    dst.extend_from_slice(&pack_tag(sequence, value_type).to_le_bytes());
}

/// User key portion of an encoded internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    &internal_key[..internal_key.len().saturating_sub(TAG_SIZE)]
}

/// Tag of an encoded internal key; 0 if the key is too short
pub fn extract_tag(internal_key: &[u8]) -> u64 {
    if internal_key.len() < TAG_SIZE {
        return 0;
    }
    let mut buf = [0u8; TAG_SIZE];
    buf.copy_from_slice(&internal_key[internal_key.len() - TAG_SIZE..]);
    u64::from_le_bytes(buf)
}

/// A decoded internal key borrowing its user key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// User key
    pub user_key: &'a [u8],
    /// Sequence number
    pub sequence: SequenceNumber,
    /// Operation
    pub value_type: ValueType,
}

/// Decode an internal key. Returns `None` for malformed keys.
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if internal_key.len() < TAG_SIZE {
        return None;
    }
    let tag = extract_tag(internal_key);
    let value_type = ValueType::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: extract_user_key(internal_key),
        sequence: tag >> 8,
        value_type,
    })
}

/// An owned, encoded internal key
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    /// Encode a new internal key
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TAG_SIZE);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        InternalKey(rep)
    }

    /// Wrap already-encoded bytes
    pub fn decode_from(encoded: &[u8]) -> Self {
        InternalKey(encoded.to_vec())
    }

    /// Encoded bytes
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// User key portion
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    /// True for the default, empty key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parse_internal_key(&self.0) {
            Some(p) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(p.user_key),
                p.sequence,
                p.value_type
            ),
            None => write!(f, "(bad){:?}", self.0),
        }
    }
}

/// Orders internal keys using a user comparator
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wrap a user comparator
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// The wrapped user comparator
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    /// Compare two user keys
    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }

    /// Compare two encoded internal keys
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            // Larger tag (newer) sorts first
            Ordering::Equal => extract_tag(b).cmp(&extract_tag(a)),
            ord => ord,
        }
    }

    /// Compare two owned internal keys
    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

/// A point-lookup target: `user_key` at `sequence`
pub struct LookupKey {
    internal_key: Vec<u8>,
}

impl LookupKey {
    /// Build a lookup for the newest version of `user_key` visible at `sequence`
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let mut internal_key = Vec::with_capacity(user_key.len() + TAG_SIZE);
        append_internal_key(&mut internal_key, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        Self { internal_key }
    }

    /// Seek target in internal-key space
    pub fn internal_key(&self) -> &[u8] {
        &self.internal_key
    }

    /// The user key being looked up
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.internal_key)
    }
}

/// Outcome of a point lookup in one source that holds the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Newest visible version is a value
    Value(Vec<u8>),
    /// Newest visible version is a tombstone
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_encode_and_parse() {
        let key = InternalKey::new(b"hello", 42, ValueType::Value);
        let parsed = parse_internal_key(key.encoded()).unwrap();
        assert_eq!(parsed.user_key, b"hello");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, ValueType::Value);
        assert_eq!(key.user_key(), b"hello");

        let max = InternalKey::new(b"", MAX_SEQUENCE_NUMBER, ValueType::Deletion);
        assert_eq!(
            parse_internal_key(max.encoded()).unwrap().sequence,
            MAX_SEQUENCE_NUMBER
        );
    }

    #[test]
    fn test_malformed_keys() {
        assert!(parse_internal_key(b"short").is_none());
        let mut bad = b"k".to_vec();
        bad.extend_from_slice(&((5u64 << 8) | 7).to_le_bytes());
        assert!(parse_internal_key(&bad).is_none());
    }

    #[test]
    fn test_ordering_user_key_then_newest_first() {
        let cmp = icmp();
        let a1 = InternalKey::new(b"a", 1, ValueType::Value);
        let a2 = InternalKey::new(b"a", 2, ValueType::Value);
        let a2_del = InternalKey::new(b"a", 2, ValueType::Deletion);
        let b1 = InternalKey::new(b"b", 1, ValueType::Value);

        assert_eq!(cmp.compare_keys(&a2, &a1), Ordering::Less);
        assert_eq!(cmp.compare_keys(&a1, &b1), Ordering::Less);
        assert_eq!(cmp.compare_keys(&a2, &a2_del), Ordering::Less);
        assert_eq!(cmp.compare_keys(&a1, &a1), Ordering::Equal);
    }

    #[test]
    fn test_lookup_key_sorts_before_visible_versions() {
        let cmp = icmp();
        let lookup = LookupKey::new(b"k", 10);
        let at_10 = InternalKey::new(b"k", 10, ValueType::Deletion);
        let at_11 = InternalKey::new(b"k", 11, ValueType::Value);

        assert_eq!(lookup.user_key(), b"k");
        assert_ne!(
            cmp.compare(lookup.internal_key(), at_10.encoded()),
            Ordering::Greater
        );
        assert_eq!(
            cmp.compare(at_11.encoded(), lookup.internal_key()),
            Ordering::Less
        );
    }

    #[test]
    fn test_debug_format() {
        let key = InternalKey::new(b"abc", 3, ValueType::Deletion);
        assert_eq!(format!("{:?}", key), "'abc' @ 3 : Deletion");
    }
}
