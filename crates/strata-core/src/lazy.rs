//! A compute-once cell that remembers an absent result.

/// Memoized result of a fallible-to-produce value.
///
/// `Empty` records that the computation ran and produced nothing, which is
/// distinct from never having run it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Lazy<T> {
    /// Not yet computed
    #[default]
    Uninitialized,
    /// Computed, and there was no value
    Empty,
    /// Computed value
    Value(T),
}

impl<T> Lazy<T> {
    /// Create an uninitialized cell.
    pub fn new() -> Self {
        Lazy::Uninitialized
    }

    /// Return the cached value, running `init` on first access.
    pub fn get_or_init<F>(&mut self, init: F) -> Option<&T>
    where
        F: FnOnce() -> Option<T>,
    {
        if let Lazy::Uninitialized = self {
            *self = match init() {
                Some(value) => Lazy::Value(value),
                None => Lazy::Empty,
            };
        }
        match self {
            Lazy::Value(value) => Some(value),
            _ => None,
        }
    }

    /// True once `get_or_init` has run.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Lazy::Uninitialized)
    }

    /// Forget the cached result.
    pub fn reset(&mut self) {
        *self = Lazy::Uninitialized;
    }
}
