//! Cursor-style iterators over internal keys.
//!
//! Every source of entries (memtable, table file, level, merged view)
//! implements [`InternalIterator`]. Positioning methods never fail
//! directly: a source that hits an error becomes invalid and reports the
//! error from [`InternalIterator::status`].

use crate::key::InternalKeyComparator;
use std::cmp::Ordering;
use strata_core::Result;

/// A bidirectional cursor over entries sorted by internal key
pub trait InternalIterator: Send {
    /// True when positioned at an entry
    fn valid(&self) -> bool;
    /// Position at the first entry
    fn seek_to_first(&mut self);
    /// Position at the last entry
    fn seek_to_last(&mut self);
    /// Position at the first entry with key >= `target`
    fn seek(&mut self, target: &[u8]);
    /// Advance; requires `valid()`
    fn next(&mut self);
    /// Step back; requires `valid()`
    fn prev(&mut self);
    /// Current internal key; requires `valid()`
    fn key(&self) -> &[u8];
    /// Current value; requires `valid()`
    fn value(&self) -> &[u8];
    /// First error encountered, if any
    fn status(&self) -> Result<()>;
}

/// An iterator with no entries, optionally carrying an error
pub struct EmptyIterator {
    status: Result<()>,
}

impl EmptyIterator {
    /// An empty, healthy iterator
    pub fn new() -> Self {
        Self { status: Ok(()) }
    }

    /// An empty iterator that reports `error`
    pub fn with_error(error: strata_core::Error) -> Self {
        Self { status: Err(error) }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalIterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        &[]
    }
    fn value(&self) -> &[u8] {
        &[]
    }
    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge of child iterators.
///
/// Children are listed newest source first. Internal keys are unique
/// across sources, so ties only arise for identical entries and resolve to
/// the earlier child.
pub struct MergingIterator {
    cmp: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    /// Merge `children` under `cmp`
    pub fn new(cmp: InternalKeyComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                Some(s)
                    if self.cmp.compare(child.key(), self.children[s].key()) != Ordering::Less =>
                {
                    Some(s)
                }
                _ => Some(i),
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                Some(l)
                    if self.cmp.compare(child.key(), self.children[l].key())
                        != Ordering::Greater =>
                {
                    Some(l)
                }
                _ => Some(i),
            };
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let Some(current) = self.current else {
            return;
        };

        // After moving backwards the non-current children are positioned
        // before key(); move them to the first entry after it.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let Some(current) = self.current else {
            return;
        };

        // After moving forwards the non-current children are positioned at
        // or after key(); move them to the last entry before it.
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}
