//! Merging iterators.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  HeapIterator (k-way merge, lower index wins on ties)     │
//! │  ┌─────────┐ ┌─────────┐ ┌──────┐ ┌──────┐ ┌───────────┐  │
//! │  │ active  │ │ retired │ │ L0[0]│ │ L0[1]│ │ Concat(Ln)│  │
//! │  │ skiplist│ │ skiplist│ │      │ │      │ │ t0 t1 t2  │  │
//! │  └─────────┘ └─────────┘ └──────┘ └──────┘ └───────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Children are ordered newest first, so on equal keys the lower-indexed
//! child shadows the others and every key is emitted once.

use std::cmp::Ordering;
use std::sync::Arc;
use tern_sstable::{Comparator, KvIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge over sorted children.
///
/// The heap holds child indices; a child is in the heap iff it is valid.
pub struct HeapIterator {
    children: Vec<Box<dyn KvIterator>>,
    cmp: Arc<dyn Comparator>,
    heap: Vec<usize>,
    direction: Direction,
}

impl HeapIterator {
    /// `children[0]` takes precedence over `children[1]`, and so on.
    pub fn new(children: Vec<Box<dyn KvIterator>>, cmp: Arc<dyn Comparator>) -> Self {
        Self {
            heap: Vec::with_capacity(children.len()),
            children,
            cmp,
            direction: Direction::Forward,
        }
    }

    /// True if child `a` should be emitted before child `b`.
    fn before(&self, a: usize, b: usize) -> bool {
        let ord = self
            .cmp
            .compare(self.children[a].key(), self.children[b].key());
        match (ord, self.direction) {
            (Ordering::Equal, _) => a < b,
            (Ordering::Less, Direction::Forward) | (Ordering::Greater, Direction::Reverse) => true,
            _ => false,
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.before(self.heap[pos], self.heap[parent]) {
                self.heap.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < self.heap.len() && self.before(self.heap[left], self.heap[best]) {
                best = left;
            }
            if right < self.heap.len() && self.before(self.heap[right], self.heap[best]) {
                best = right;
            }
            if best == pos {
                return;
            }
            self.heap.swap(pos, best);
            pos = best;
        }
    }

    fn push(&mut self, child: usize) {
        self.heap.push(child);
        let last = self.heap.len() - 1;
        self.sift_up(last);
    }

    fn pop(&mut self) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    fn rebuild(&mut self, direction: Direction) {
        self.direction = direction;
        self.heap.clear();
        for i in 0..self.children.len() {
            if self.children[i].valid() {
                self.push(i);
            }
        }
    }

    fn top(&self) -> Option<&dyn KvIterator> {
        self.heap.first().map(|&i| &*self.children[i])
    }

    fn step(&mut self, child: usize) {
        match self.direction {
            Direction::Forward => self.children[child].next(),
            Direction::Reverse => self.children[child].prev(),
        }
    }

    /// Steps every child positioned at `key` and restores the heap.
    fn advance_past(&mut self, key: &[u8]) {
        while let Some(&top) = self.heap.first() {
            if self.cmp.compare(self.children[top].key(), key) != Ordering::Equal {
                break;
            }
            if let Some(child) = self.pop() {
                self.step(child);
                if self.children[child].valid() {
                    self.push(child);
                }
            }
        }
    }
}

impl KvIterator for HeapIterator {
    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.rebuild(Direction::Forward);
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.rebuild(Direction::Reverse);
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.rebuild(Direction::Forward);
    }

    fn next(&mut self) {
        let Some(current) = self.top().map(|it| it.key().to_vec()) else {
            return;
        };

        if self.direction == Direction::Reverse {
            // Every child moves to the first entry after `current`.
            for child in &mut self.children {
                child.seek(&current);
                if child.valid() && self.cmp.compare(child.key(), &current) == Ordering::Equal {
                    child.next();
                }
            }
            self.rebuild(Direction::Forward);
            return;
        }

        self.advance_past(&current);
    }

    fn prev(&mut self) {
        let Some(current) = self.top().map(|it| it.key().to_vec()) else {
            return;
        };

        if self.direction == Direction::Forward {
            // Every child moves to the last entry before `current`.
            for child in &mut self.children {
                child.seek(&current);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.rebuild(Direction::Reverse);
            return;
        }

        self.advance_past(&current);
    }

    fn key(&self) -> &[u8] {
        self.top().map(|it| it.key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.top().map(|it| it.value()).unwrap_or(&[])
    }
}

/// Chains children whose key ranges are disjoint and ascending.
pub struct ConcatenationIterator {
    children: Vec<Box<dyn KvIterator>>,
    /// Index of the current child; `children.len()` when not valid.
    current: usize,
}

impl ConcatenationIterator {
    pub fn new(children: Vec<Box<dyn KvIterator>>) -> Self {
        let current = children.len();
        Self { children, current }
    }

    fn invalidate(&mut self) {
        self.current = self.children.len();
    }

    /// Moves forward from child `from` to the first child with an entry.
    fn skip_forward(&mut self, mut from: usize) {
        while from < self.children.len() {
            self.children[from].seek_to_first();
            if self.children[from].valid() {
                self.current = from;
                return;
            }
            from += 1;
        }
        self.invalidate();
    }

    /// Moves backward from child `from` to the last child with an entry.
    fn skip_backward(&mut self, from: usize) {
        for i in (0..=from).rev() {
            self.children[i].seek_to_last();
            if self.children[i].valid() {
                self.current = i;
                return;
            }
        }
        self.invalidate();
    }
}

impl KvIterator for ConcatenationIterator {
    fn valid(&self) -> bool {
        self.current < self.children.len() && self.children[self.current].valid()
    }

    fn seek_to_first(&mut self) {
        self.skip_forward(0);
    }

    fn seek_to_last(&mut self) {
        match self.children.len().checked_sub(1) {
            Some(last) => self.skip_backward(last),
            None => self.invalidate(),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        for i in 0..self.children.len() {
            self.children[i].seek(target);
            if self.children[i].valid() {
                self.current = i;
                return;
            }
        }
        self.invalidate();
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.children[self.current].next();
        if !self.children[self.current].valid() {
            self.skip_forward(self.current + 1);
        }
    }

    fn prev(&mut self) {
        if !self.valid() {
            return;
        }
        self.children[self.current].prev();
        if !self.children[self.current].valid() {
            match self.current.checked_sub(1) {
                Some(before) => self.skip_backward(before),
                None => self.invalidate(),
            }
        }
    }

    fn key(&self) -> &[u8] {
        if self.valid() {
            self.children[self.current].key()
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid() {
            self.children[self.current].value()
        } else {
            &[]
        }
    }
}
