//! User-key ordering.

use std::cmp::Ordering;
use std::fmt;

/// A total order over user keys.
///
/// The name is persisted in the manifest; reopening a database with a
/// comparator of a different name fails with `InvalidArgument`.
pub trait Comparator: Send + Sync {
    /// Three-way comparison of two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Stable identifier recorded in the manifest.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparator")
            .field("name", &self.name())
            .finish()
    }
}

/// Lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "strata.BytewiseComparator"
    }
}
