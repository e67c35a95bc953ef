//! # Strata Snapshot
//!
//! MVCC snapshot handles for the Strata storage engine.
//!
//! ## Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Strata.**
//!
//! Users should depend on the main `strata` crate instead, which provides
//! the stable public API. This crate's API may change without notice
//! between minor versions.
//!
//! ---
//!
//! A [`Snapshot`] pins a sequence number: reads taken at the snapshot
//! ignore every entry written after it. The engine keeps all live
//! snapshots in a [`SnapshotList`] so compaction knows the oldest sequence
//! number some reader may still ask for, and therefore which overwritten
//! versions and tombstones must be retained.
//!
//! Snapshots are released when the last clone of the handle is dropped, or
//! explicitly with [`Snapshot::release`].

use std::fmt;
use std::sync::{Arc, Weak};
use strata_core::SequenceNumber;
use tracing::trace;

#[derive(Debug)]
struct SnapshotInner {
    sequence: SequenceNumber,
}

/// A read handle pinned to a sequence number
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    /// The sequence number this snapshot reads at
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }

    /// Release this handle. The snapshot stays live while other clones exist.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Snapshot {}

/// The set of live snapshots, in creation order
///
/// Not internally synchronized; the engine keeps it under its coordination
/// mutex.
#[derive(Default)]
pub struct SnapshotList {
    entries: Vec<Weak<SnapshotInner>>,
}

impl SnapshotList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a snapshot at `sequence`
    pub fn acquire(&mut self, sequence: SequenceNumber) -> Snapshot {
        self.prune();
        let inner = Arc::new(SnapshotInner { sequence });
        self.entries.push(Arc::downgrade(&inner));
        trace!(sequence, live = self.entries.len(), "Snapshot acquired");
        Snapshot { inner }
    }

    /// The smallest sequence number pinned by a live snapshot
    pub fn oldest(&mut self) -> Option<SequenceNumber> {
        self.prune();
        self.entries
            .iter()
            .filter_map(Weak::upgrade)
            .map(|s| s.sequence)
            .min()
    }

    /// Sequence numbers of all live snapshots, in creation order
    pub fn sequences(&mut self) -> Vec<SequenceNumber> {
        self.prune();
        self.entries
            .iter()
            .filter_map(Weak::upgrade)
            .map(|s| s.sequence)
            .collect()
    }

    /// Number of live snapshots
    pub fn len(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    /// True when no snapshot is live
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose handles were all released
    fn prune(&mut self) {
        self.entries.retain(|w| w.strong_count() > 0);
    }
}

impl fmt::Debug for SnapshotList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live: Vec<_> = self
            .entries
            .iter()
            .filter_map(Weak::upgrade)
            .map(|s| s.sequence)
            .collect();
        f.debug_struct("SnapshotList").field("live", &live).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut list = SnapshotList::new();
        assert!(list.is_empty());
        assert_eq!(list.oldest(), None);

        let s1 = list.acquire(10);
        let s2 = list.acquire(20);
        assert_eq!(s1.sequence(), 10);
        assert_eq!(list.len(), 2);
        assert_eq!(list.oldest(), Some(10));

        s1.release();
        assert_eq!(list.oldest(), Some(20));
        assert_eq!(list.len(), 1);

        drop(s2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_clone_keeps_snapshot_live() {
        let mut list = SnapshotList::new();
        let s = list.acquire(5);
        let copy = s.clone();
        assert_eq!(s, copy);

        drop(s);
        assert_eq!(list.oldest(), Some(5));
        drop(copy);
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn test_oldest_is_minimum_not_first() {
        let mut list = SnapshotList::new();
        let _a = list.acquire(30);
        let _b = list.acquire(12);
        let _c = list.acquire(40);
        assert_eq!(list.oldest(), Some(12));
        assert_eq!(list.sequences(), vec![30, 12, 40]);
    }

    #[test]
    fn test_snapshot_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Snapshot>();
    }
}
