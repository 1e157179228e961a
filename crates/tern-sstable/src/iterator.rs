//! Uniform cursor over sorted key/value sequences.
//!
//! Every ordered structure in tern (blocks, tables, skiplists and the merge
//! iterators built on top of them) is traversed through [`KvIterator`].
//! Iterators compose by ownership: a heap iterator owns its children as
//! `Box<dyn KvIterator>`. Dropping an iterator releases whatever it pins.

use crate::comparator::Comparator;
use std::cmp::Ordering;
use std::sync::Arc;

pub trait KvIterator: Send {
    /// True while positioned at an entry.
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Positions at the first entry whose key is `>= target`.
    fn seek(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    /// Current key; empty when not valid.
    fn key(&self) -> &[u8];

    /// Current value; empty when not valid.
    fn value(&self) -> &[u8];
}

impl<I: KvIterator + ?Sized> KvIterator for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
}

/// Iterator over an owned, already sorted list of entries.
pub struct VecIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    cmp: Arc<dyn Comparator>,
    idx: usize,
}

impl VecIterator {
    /// `entries` must be sorted under `cmp`.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>, cmp: Arc<dyn Comparator>) -> Self {
        let idx = entries.len();
        Self { entries, cmp, idx }
    }
}

impl KvIterator for VecIterator {
    fn valid(&self) -> bool {
        self.idx < self.entries.len()
    }

    fn seek_to_first(&mut self) {
        self.idx = 0;
    }

    fn seek_to_last(&mut self) {
        self.idx = self.entries.len().checked_sub(1).unwrap_or(self.entries.len());
    }

    fn seek(&mut self, target: &[u8]) {
        self.idx = self
            .entries
            .partition_point(|(k, _)| self.cmp.compare(k, target) == Ordering::Less);
    }

    fn next(&mut self) {
        if self.valid() {
            self.idx += 1;
        }
    }

    fn prev(&mut self) {
        if self.idx == 0 {
            self.idx = self.entries.len();
        } else if self.valid() {
            self.idx -= 1;
        }
    }

    fn key(&self) -> &[u8] {
        self.entries.get(self.idx).map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.entries.get(self.idx).map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

/// Drains an iterator forward from its first entry.
pub fn collect_forward(iter: &mut dyn KvIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    out
}

/// Drains an iterator backward from its last entry.
pub fn collect_backward(iter: &mut dyn KvIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    iter.seek_to_last();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.prev();
    }
    out
}
