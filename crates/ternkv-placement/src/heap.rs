//! Min-heap with addressable entries.
//!
//! [`std::collections::BinaryHeap`] cannot change the priority of an element
//! already in the heap. The balancer needs exactly that: a rack's load moves
//! every time a replica lands on or leaves one of its hosts. `IndexedHeap`
//! keeps a key → slot index next to the array so `update` and `remove` find
//! their entry in O(1) and re-sift in O(log n).
//!
//! Ties between equal priorities are broken by key order, so pops are
//! deterministic for a given content.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct IndexedHeap<K, P> {
    entries: Vec<(K, P)>,
    slots: HashMap<K, usize>,
}

impl<K, P> Default for IndexedHeap<K, P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K, P> IndexedHeap<K, P>
where
    K: Clone + Eq + Hash + Ord,
    P: Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn priority(&self, key: &K) -> Option<&P> {
        self.slots.get(key).map(|&i| &self.entries[i].1)
    }

    /// Inserts `key`, or moves it to `priority` if it is already present.
    pub fn push(&mut self, key: K, priority: P) {
        if self.contains(&key) {
            self.update(&key, priority);
            return;
        }
        let slot = self.entries.len();
        self.slots.insert(key.clone(), slot);
        self.entries.push((key, priority));
        self.sift_up(slot);
    }

    /// Lowest entry, without removing it.
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.entries.first().map(|(k, p)| (k, p))
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        self.take(0)
    }

    /// Changes the priority of `key`. Returns false if it is absent.
    pub fn update(&mut self, key: &K, priority: P) -> bool {
        let Some(&slot) = self.slots.get(key) else {
            return false;
        };
        self.entries[slot].1 = priority;
        let slot = self.sift_up(slot);
        self.sift_down(slot);
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        let slot = *self.slots.get(key)?;
        self.take(slot).map(|(_, p)| p)
    }

    /// Entries in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &P)> {
        self.entries.iter().map(|(k, p)| (k, p))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.slots.clear();
    }

    fn take(&mut self, slot: usize) -> Option<(K, P)> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(slot, last);
        let (key, priority) = self.entries.pop()?;
        self.slots.remove(&key);
        if slot < self.entries.len() {
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        Some((key, priority))
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (ka, pa) = &self.entries[a];
        let (kb, pb) = &self.entries[b];
        (pa, ka) < (pb, kb)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.slots.insert(self.entries[a].0.clone(), a);
        self.slots.insert(self.entries[b].0.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                return;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}
