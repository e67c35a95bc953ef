//! Memtable - in-memory sorted write buffer
//!
//! Recent writes live in a concurrent skip list keyed by internal key until
//! the table is frozen and flushed to a level-0 sorted table. Every version
//! of a user key is kept; readers choose the newest one visible at their
//! sequence number.

use crate::iterator::InternalIterator;
use crate::key::{
    append_internal_key, extract_tag, extract_user_key, InternalKeyComparator, LookupKey,
    LookupResult, ValueType,
};
use crossbeam_skiplist::{map::Entry, SkipMap};
use std::cmp::Ordering;
use std::mem::size_of;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use strata_core::{Result, SequenceNumber};

/// Skip-list node links and height charged per entry
const NODE_OVERHEAD: usize = 32;

/// Bookkeeping charged per entry on top of its key and value bytes: the
/// node, the key wrapper with its comparator handle, and the value vector.
const ENTRY_OVERHEAD: usize = NODE_OVERHEAD + size_of::<MemKey>() + size_of::<Vec<u8>>();

/// Skip-list key ordered by the internal key comparator
struct MemKey {
    key: Vec<u8>,
    icmp: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.key, &other.key)
    }
}

/// Memtable - a sorted multi-version write buffer
///
/// Inserts and lookups may run concurrently; the engine only ever has one
/// writer (the group-commit leader) at a time.
pub struct MemTable {
    map: SkipMap<MemKey, Vec<u8>>,
    cmp: InternalKeyComparator,
    usage: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable ordered by `cmp`
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            map: SkipMap::new(),
            cmp,
            usage: AtomicUsize::new(0),
        }
    }

    fn mem_key(&self, key: Vec<u8>) -> MemKey {
        MemKey {
            key,
            icmp: self.cmp.clone(),
        }
    }

    /// Record `user_key` at `sequence`. Deletions carry an empty value.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let mut key = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut key, user_key, sequence, value_type);
        let charge = key.len() + value.len() + ENTRY_OVERHEAD;
        self.map.insert(self.mem_key(key), value.to_vec());
        self.usage.fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Newest version of the lookup's user key at or below its sequence.
    ///
    /// Returns `None` when the memtable holds no visible version at all.
    pub fn get(&self, lookup: &LookupKey) -> Option<LookupResult> {
        let target = self.mem_key(lookup.internal_key().to_vec());
        let entry = self.map.lower_bound(Bound::Included(&target))?;
        let found = &entry.key().key;
        if self.cmp.compare_user(extract_user_key(found), lookup.user_key()) != Ordering::Equal
        {
            return None;
        }
        match ValueType::from_u8((extract_tag(found) & 0xff) as u8)? {
            ValueType::Value => Some(LookupResult::Value(entry.value().clone())),
            ValueType::Deletion => Some(LookupResult::Deleted),
        }
    }

    /// Approximate bytes held, including per-entry overhead
    pub fn approximate_memory_usage(&self) -> usize {
        self.usage.load(AtomicOrdering::Relaxed)
    }

    /// Number of entries (every version counts)
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if nothing has been added
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Cursor over all entries in internal-key order
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.len())
            .field("usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Cursor over a memtable.
///
/// Holds the memtable alive and copies out the current entry, so it stays
/// usable while the leader keeps inserting.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    fn set(&mut self, entry: Option<Entry<'_, MemKey, Vec<u8>>>) {
        self.current = entry.map(|e| (e.key().key.clone(), e.value().clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let mem = Arc::clone(&self.mem);
        self.set(mem.map.front());
    }

    fn seek_to_last(&mut self) {
        let mem = Arc::clone(&self.mem);
        self.set(mem.map.back());
    }

    fn seek(&mut self, target: &[u8]) {
        let mem = Arc::clone(&self.mem);
        let target = mem.mem_key(target.to_vec());
        self.set(mem.map.lower_bound(Bound::Included(&target)));
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let mem = Arc::clone(&self.mem);
        let key = mem.mem_key(key);
        self.set(mem.map.lower_bound(Bound::Excluded(&key)));
    }

    fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let mem = Arc::clone(&self.mem);
        let key = mem.mem_key(key);
        self.set(mem.map.upper_bound(Bound::Excluded(&key)));
    }

    fn key(&self) -> &[u8] {
        match &self.current {
            Some((key, _)) => key,
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.current {
            Some((_, value)) => value,
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::parse_internal_key;
    use strata_core::BytewiseComparator;

    fn new_memtable() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn test_memtable_new() {
        let mem = new_memtable();
        assert!(mem.is_empty());
        assert_eq!(mem.approximate_memory_usage(), 0);
    }

    #[test]
    fn test_memtable_put_get() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"key1", b"value1");

        assert_eq!(
            mem.get(&LookupKey::new(b"key1", 1)),
            Some(LookupResult::Value(b"value1".to_vec()))
        );
        assert_eq!(mem.get(&LookupKey::new(b"key2", 1)), None);
        assert!(mem.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_memtable_usage_counts_entry_bookkeeping() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"key", b"value");
        let raw = b"key".len() + 8 + b"value".len();
        assert_eq!(mem.approximate_memory_usage(), raw + ENTRY_OVERHEAD);
        assert!(ENTRY_OVERHEAD >= size_of::<InternalKeyComparator>() + size_of::<Vec<u8>>() * 2);

        mem.add(2, ValueType::Deletion, b"key", b"");
        assert_eq!(
            mem.approximate_memory_usage(),
            raw + (b"key".len() + 8) + 2 * ENTRY_OVERHEAD
        );
    }

    #[test]
    fn test_memtable_versions_respect_sequence() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k", b"v1");
        mem.add(2, ValueType::Value, b"k", b"v2");
        mem.add(3, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(&LookupKey::new(b"k", 0)), None);
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 1)),
            Some(LookupResult::Value(b"v1".to_vec()))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 2)),
            Some(LookupResult::Value(b"v2".to_vec()))
        );
        assert_eq!(mem.get(&LookupKey::new(b"k", 10)), Some(LookupResult::Deleted));
        assert_eq!(mem.len(), 3);
    }

    #[test]
    fn test_memtable_prefix_key_not_matched() {
        let mem = new_memtable();
        mem.add(5, ValueType::Value, b"abc", b"x");
        assert_eq!(mem.get(&LookupKey::new(b"ab", 10)), None);
    }

    #[test]
    fn test_memtable_iteration_order() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"b", b"b1");
        mem.add(2, ValueType::Value, b"a", b"a2");
        mem.add(3, ValueType::Value, b"b", b"b3");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = parse_internal_key(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), 2), (b"b".to_vec(), 3), (b"b".to_vec(), 1)]
        );

        iter.seek_to_last();
        assert_eq!(iter.value(), b"b1");
        iter.prev();
        assert_eq!(iter.value(), b"b3");
        iter.prev();
        assert_eq!(iter.value(), b"a2");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_memtable_iterator_sees_later_inserts() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"a", b"1");
        let mut iter = mem.iter();
        iter.seek_to_first();
        mem.add(2, ValueType::Value, b"b", b"2");
        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"2");
    }
}
