//! Concurrent skiplist memtable.
//!
//! One writer, many readers. The writer links a node only after the node's
//! own forward pointers are set, publishing it level by level with release
//! stores from the bottom up; readers load with acquire and therefore see
//! either the old or the new linkage, never a half-built node.
//!
//! ```text
//! level 3  head ──────────────────────────▶ k7
//! level 2  head ──────────▶ k3 ───────────▶ k7
//! level 1  head ──▶ k1 ───▶ k3 ──▶ k5 ────▶ k7
//! level 0  head ──▶ k1 ─▶ k2 ─▶ k3 ─▶ k4 ─▶ k5 ─▶ k6 ─▶ k7
//!                         │
//!                         ▼ versions, newest first
//!                        (seq 9, "c") ─▶ (seq 4, "b")
//! ```
//!
//! Every batch the writer applies gets the next sequence number. Overwriting
//! a key swaps the node's version pointer in place; the replaced version
//! stays linked behind the new one only while an open iterator was created
//! before the overwrite, and is then retired through `crossbeam-epoch`.
//! An iterator pins the sequence number current at its creation and skips
//! every node and version stamped after it, so later writes never show
//! through.
//!
//! Nodes are never unlinked; they are freed when the skiplist is dropped.
//!
//! Only [`SkiplistWriter`] can insert. The engine keeps the writer behind its
//! write lock and hands out `Arc<Skiplist>` to readers.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{self, AtomicU64, AtomicUsize};
use std::sync::Arc;
use tern_sstable::{Comparator, KvIterator};

/// Cumulative level distribution: a node reaches level `i + 1` when the
/// sampled value falls below `SPAN / LEVELS[i]`.
const LEVELS: [u32; 6] = [8, 64, 512, 4096, 32768, 262_144];
const SPAN: u32 = 262_144;
const MAX_HEIGHT: usize = LEVELS.len() + 1;

/// Per-entry bookkeeping counted by [`Skiplist::approximate_bytes`].
const NODE_OVERHEAD: usize = 32;

struct Version {
    seq: u64,
    value: Vec<u8>,
    prior: Atomic<Version>,
}

impl Version {
    fn new(seq: u64, value: &[u8]) -> Owned<Self> {
        Owned::new(Self {
            seq,
            value: value.to_vec(),
            prior: Atomic::null(),
        })
    }
}

struct Node {
    key: Vec<u8>,
    version: Atomic<Version>,
    next: Box<[Atomic<Node>]>,
}

impl Node {
    fn new(key: &[u8], version: Owned<Version>, height: usize) -> Self {
        Self {
            key: key.to_vec(),
            version: Atomic::from(version),
            next: (0..height).map(|_| Atomic::null()).collect(),
        }
    }

    fn head() -> Self {
        Self {
            key: Vec::new(),
            version: Atomic::null(),
            next: (0..MAX_HEIGHT).map(|_| Atomic::null()).collect(),
        }
    }

    /// Newest version stamped at or before `cutoff`.
    fn visible<'g>(&self, cutoff: u64, guard: &'g Guard) -> Option<&'g Version> {
        let mut cur = self.version.load(atomic::Ordering::Acquire, guard);
        // SAFETY: versions are retired through the epoch, and `guard` keeps
        // any version loaded under it alive.
        while let Some(v) = unsafe { cur.as_ref() } {
            if v.seq <= cutoff {
                return Some(v);
            }
            cur = v.prior.load(atomic::Ordering::Acquire, guard);
        }
        None
    }
}

fn random_height() -> usize {
    let r = rand::thread_rng().gen_range(0..SPAN);
    1 + LEVELS.iter().filter(|&&l| r < SPAN / l).count()
}

pub struct Skiplist {
    head: Box<Node>,
    cmp: Arc<dyn Comparator>,
    len: AtomicUsize,
    bytes: AtomicUsize,
    /// Sequence number of the last published batch.
    seq: AtomicU64,
    /// Cutoffs of open iterators, with their counts. Iterator registration
    /// and batch publication both hold this lock.
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl Skiplist {
    fn new(cmp: Arc<dyn Comparator>) -> Self {
        Self {
            head: Box::new(Node::head()),
            cmp,
            len: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.cmp
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.len.load(atomic::Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys plus retained values plus a fixed per-node overhead.
    pub fn approximate_bytes(&self) -> usize {
        self.bytes.load(atomic::Ordering::Relaxed)
    }

    /// Sequence number of the last applied batch.
    pub fn sequence(&self) -> u64 {
        self.seq.load(atomic::Ordering::Acquire)
    }

    fn next_of<'a>(&'a self, node: &'a Node, level: usize) -> Option<&'a Node> {
        // SAFETY: nodes are only reclaimed in `Drop`, which requires that no
        // borrow of the skiplist is alive, so an unprotected load is enough
        // for node pointers.
        unsafe {
            node.next[level]
                .load(atomic::Ordering::Acquire, epoch::unprotected())
                .as_ref()
        }
    }

    /// For every level, the last node whose key is less than `key` (the head
    /// when there is none).
    fn trace<'a>(&'a self, key: &[u8]) -> [&'a Node; MAX_HEIGHT] {
        let mut preds = [&*self.head; MAX_HEIGHT];
        let mut x: &Node = &self.head;
        for level in (0..MAX_HEIGHT).rev() {
            while let Some(next) = self.next_of(x, level) {
                if self.cmp.compare(&next.key, key) == Ordering::Less {
                    x = next;
                } else {
                    break;
                }
            }
            preds[level] = x;
        }
        preds
    }

    fn find(&self, key: &[u8]) -> Option<&Node> {
        let preds = self.trace(key);
        self.next_of(preds[0], 0)
            .filter(|n| self.cmp.compare(&n.key, key) == Ordering::Equal)
    }

    fn is_head(&self, node: &Node) -> bool {
        ptr::eq(node, &*self.head)
    }

    /// Applies `entries` under one sequence number.
    fn insert_batch<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let pins = self.pins.lock();
        let seq = self.seq.load(atomic::Ordering::Relaxed) + 1;
        let guard = &epoch::pin();
        for (key, value) in entries {
            self.insert(key, value, seq, &pins, guard);
        }
        self.seq.store(seq, atomic::Ordering::Release);
        drop(pins);
    }

    fn insert(
        &self,
        key: &[u8],
        value: &[u8],
        seq: u64,
        pins: &BTreeMap<u64, usize>,
        guard: &Guard,
    ) {
        let preds = self.trace(key);

        if let Some(existing) = self
            .next_of(preds[0], 0)
            .filter(|n| self.cmp.compare(&n.key, key) == Ordering::Equal)
        {
            let fresh = Version::new(seq, value);
            fresh
                .prior
                .store(existing.version.load(atomic::Ordering::Acquire, guard), atomic::Ordering::Relaxed);
            let fresh = fresh.into_shared(guard);
            existing.version.store(fresh, atomic::Ordering::Release);
            self.bytes.fetch_add(value.len(), atomic::Ordering::Relaxed);
            self.trim(fresh, pins, guard);
            return;
        }

        let height = random_height();
        let node = Owned::new(Node::new(key, Version::new(seq, value), height));
        for (level, pred) in preds.iter().enumerate().take(height) {
            let succ = pred.next[level].load(atomic::Ordering::Acquire, guard);
            node.next[level].store(succ, atomic::Ordering::Relaxed);
        }

        // SAFETY: the node is owned by the skiplist from here on and is
        // freed only in `Drop`.
        let shared = node.into_shared(unsafe { epoch::unprotected() });
        for (level, pred) in preds.iter().enumerate().take(height) {
            pred.next[level].store(shared, atomic::Ordering::Release);
        }

        self.len.fetch_add(1, atomic::Ordering::Release);
        self.bytes.fetch_add(
            key.len() + value.len() + NODE_OVERHEAD,
            atomic::Ordering::Relaxed,
        );
    }

    /// Retires the versions behind `newest` that no open iterator can
    /// reach. A version is reachable when some pinned cutoff falls between
    /// its own sequence number and that of the next newer kept version.
    fn trim<'g>(&self, newest: Shared<'g, Version>, pins: &BTreeMap<u64, usize>, guard: &'g Guard) {
        // SAFETY: the caller holds `guard`, and only the writer unlinks
        // versions. An unlinked version keeps its `prior` pointer, so a
        // reader standing on it can still walk past it.
        unsafe {
            let Some(mut kept) = newest.as_ref() else {
                return;
            };
            let mut cur = kept.prior.load(atomic::Ordering::Acquire, guard);
            while let Some(v) = cur.as_ref() {
                let older = v.prior.load(atomic::Ordering::Acquire, guard);
                if pins.range(v.seq..kept.seq).next().is_some() {
                    kept = v;
                } else {
                    kept.prior.store(older, atomic::Ordering::Release);
                    self.bytes.fetch_sub(v.value.len(), atomic::Ordering::Relaxed);
                    guard.defer_destroy(cur);
                }
                cur = older;
            }
        }
    }

    /// Returns a copy of the newest value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let node = self.find(key)?;
        let guard = &epoch::pin();
        node.visible(u64::MAX, guard).map(|v| v.value.clone())
    }

    /// Iterator over the contents as of now; batches applied after this call
    /// are invisible to it.
    pub fn iter(self: &Arc<Self>) -> SkiplistIter {
        let cutoff = {
            let mut pins = self.pins.lock();
            let cutoff = self.seq.load(atomic::Ordering::Acquire);
            *pins.entry(cutoff).or_insert(0) += 1;
            cutoff
        };
        SkiplistIter {
            list: Arc::clone(self),
            cutoff,
            node: ptr::null(),
            value: Vec::new(),
        }
    }

    fn unpin(&self, cutoff: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&cutoff) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&cutoff);
            }
        }
    }

    fn first_node(&self) -> *const Node {
        self.next_of(&self.head, 0)
            .map_or(ptr::null(), |n| n as *const Node)
    }

    fn seek_node(&self, target: &[u8]) -> *const Node {
        let preds = self.trace(target);
        // A target before every key leaves the head as predecessor, so this
        // falls back to the first leaf.
        self.next_of(preds[0], 0)
            .map_or(ptr::null(), |n| n as *const Node)
    }

    fn last_node(&self) -> *const Node {
        let mut x: &Node = &self.head;
        for level in (0..MAX_HEIGHT).rev() {
            while let Some(next) = self.next_of(x, level) {
                x = next;
            }
        }
        if self.is_head(x) {
            ptr::null()
        } else {
            x as *const Node
        }
    }

    fn prev_node(&self, node: &Node) -> *const Node {
        let preds = self.trace(&node.key);
        if self.is_head(preds[0]) {
            ptr::null()
        } else {
            preds[0] as *const Node
        }
    }
}

impl Drop for Skiplist {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no reader or iterator is alive.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.next[0].load(atomic::Ordering::Relaxed, guard);
            while !cur.is_null() {
                let node = cur.into_owned();
                cur = node.next[0].load(atomic::Ordering::Relaxed, guard);
                let mut version = node.version.load(atomic::Ordering::Relaxed, guard);
                while !version.is_null() {
                    let owned = version.into_owned();
                    version = owned.prior.load(atomic::Ordering::Relaxed, guard);
                }
            }
        }
    }
}

/// The only handle that can insert into a skiplist.
pub struct SkiplistWriter {
    list: Arc<Skiplist>,
}

impl SkiplistWriter {
    pub fn new(cmp: Arc<dyn Comparator>) -> Self {
        Self {
            list: Arc::new(Skiplist::new(cmp)),
        }
    }

    /// Inserts `key`, replacing the value in place if the key exists.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.list.insert_batch([(key, value)]);
    }

    /// Inserts all entries under one sequence number: an iterator sees
    /// either none or all of them.
    pub fn apply<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        self.list.insert_batch(entries);
    }

    /// Read-only view shared with readers.
    pub fn skiplist(&self) -> &Arc<Skiplist> {
        &self.list
    }
}

/// Cursor over a skiplist as of its creation. Holds the skiplist alive.
pub struct SkiplistIter {
    list: Arc<Skiplist>,
    cutoff: u64,
    /// Current node, null when not valid.
    node: *const Node,
    /// Copy of the current node's value.
    value: Vec<u8>,
}

// SAFETY: `node` points into `list`, which the iterator keeps alive; nodes
// are immutable apart from their atomics.
unsafe impl Send for SkiplistIter {}

impl SkiplistIter {
    /// Lands on `node` or, if it was written after the cutoff, on the first
    /// visible node in the direction of travel.
    fn position(&mut self, mut node: *const Node, forward: bool) {
        self.value.clear();
        let guard = &epoch::pin();
        // SAFETY: see `current`.
        while let Some(n) = unsafe { node.as_ref() } {
            if let Some(v) = n.visible(self.cutoff, guard) {
                self.value.extend_from_slice(&v.value);
                break;
            }
            node = if forward {
                self.list.next_of(n, 0).map_or(ptr::null(), |n| n as *const Node)
            } else {
                self.list.prev_node(n)
            };
        }
        self.node = node;
    }

    fn current(&self) -> Option<&Node> {
        // SAFETY: the node belongs to `self.list`, which outlives the borrow.
        unsafe { self.node.as_ref() }
    }
}

impl Drop for SkiplistIter {
    fn drop(&mut self) {
        self.list.unpin(self.cutoff);
    }
}

impl KvIterator for SkiplistIter {
    fn valid(&self) -> bool {
        !self.node.is_null()
    }

    fn seek_to_first(&mut self) {
        let node = self.list.first_node();
        self.position(node, true);
    }

    fn seek_to_last(&mut self) {
        let node = self.list.last_node();
        self.position(node, false);
    }

    fn seek(&mut self, target: &[u8]) {
        let node = self.list.seek_node(target);
        self.position(node, true);
    }

    fn next(&mut self) {
        let node = match self.current() {
            Some(cur) => self
                .list
                .next_of(cur, 0)
                .map_or(ptr::null(), |n| n as *const Node),
            None => return,
        };
        self.position(node, true);
    }

    fn prev(&mut self) {
        let node = match self.current() {
            Some(cur) => self.list.prev_node(cur),
            None => return,
        };
        self.position(node, false);
    }

    fn key(&self) -> &[u8] {
        self.current().map(|n| n.key.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_sstable::{bytewise, collect_backward, collect_forward};

    #[test]
    fn test_override_replaces_value() {
        let mut w = SkiplistWriter::new(bytewise());
        w.put(b"hello", b"world");
        w.put(b"hello", b"one");

        let list = w.skiplist();
        assert_eq!(list.get(b"hello").as_deref(), Some(&b"one"[..]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let mut w = SkiplistWriter::new(bytewise());
        w.put(b"b", b"2");
        assert_eq!(w.skiplist().get(b"a"), None);
        assert_eq!(w.skiplist().get(b"c"), None);
    }

    #[test]
    fn test_seek_before_everything_lands_on_first() {
        let mut w = SkiplistWriter::new(bytewise());
        for k in ["m", "n", "o"] {
            w.put(k.as_bytes(), b"v");
        }
        let mut it = w.skiplist().iter();
        it.seek(b"a");
        assert_eq!(it.key(), b"m");
        it.seek(b"n");
        assert_eq!(it.key(), b"n");
        it.seek(b"z");
        assert!(!it.valid());
    }

    #[test]
    fn test_prev_retraces_from_top() {
        let mut w = SkiplistWriter::new(bytewise());
        for i in 0..200u32 {
            w.put(format!("{:04}", i).as_bytes(), &i.to_le_bytes());
        }
        let mut it = w.skiplist().iter();
        it.seek(b"0100");
        it.prev();
        assert_eq!(it.key(), b"0099");
        assert_eq!(it.value(), &99u32.to_le_bytes());

        it.seek_to_first();
        it.prev();
        assert!(!it.valid());

        it.seek_to_last();
        assert_eq!(it.key(), b"0199");
    }

    #[test]
    fn test_empty_skiplist_iteration() {
        let w = SkiplistWriter::new(bytewise());
        let mut it = w.skiplist().iter();
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
        assert!(w.skiplist().is_empty());
    }

    #[test]
    fn test_height_never_exceeds_max() {
        for _ in 0..10_000 {
            let h = random_height();
            assert!((1..=MAX_HEIGHT).contains(&h));
        }
    }

    #[test]
    fn test_iterator_outlives_writer() {
        let mut w = SkiplistWriter::new(bytewise());
        w.put(b"k", b"v");
        let mut it = w.skiplist().iter();
        drop(w);
        it.seek_to_first();
        assert_eq!(it.key(), b"k");
        assert_eq!(it.value(), b"v");
    }

    #[test]
    fn test_readers_during_writes() {
        let mut w = SkiplistWriter::new(bytewise());
        let list = Arc::clone(w.skiplist());

        let reader = std::thread::spawn(move || {
            let mut seen = 0;
            while seen < 1000 {
                let mut it = list.iter();
                let keys: Vec<_> = collect_forward(&mut it).into_iter().map(|(k, _)| k).collect();
                assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
                seen = keys.len();
            }
        });

        for i in 0..1000u32 {
            w.put(format!("key{:06}", (i * 7919) % 1000).as_bytes(), b"v");
            if i % 100 == 0 {
                w.put(b"key000000", format!("{}", i).as_bytes());
            }
        }
        reader.join().unwrap();
    }

    #[test]
    fn test_iterator_ignores_later_batches() {
        let mut w = SkiplistWriter::new(bytewise());
        w.put(b"a", b"1");
        w.put(b"c", b"3");

        let mut it = w.skiplist().iter();
        w.put(b"b", b"2");
        w.put(b"a", b"changed");
        w.apply([(&b"c"[..], &b"x"[..]), (&b"d"[..], &b"4"[..])]);

        assert_eq!(
            collect_forward(&mut it),
            vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]
        );
        let mut bwd = collect_backward(&mut it);
        bwd.reverse();
        assert_eq!(bwd.len(), 2);

        it.seek(b"b");
        assert_eq!(it.key(), b"c");
        assert_eq!(it.value(), b"3");

        let mut fresh = w.skiplist().iter();
        assert_eq!(collect_forward(&mut fresh).len(), 4);
        assert_eq!(w.skiplist().get(b"a").as_deref(), Some(&b"changed"[..]));
    }

    #[test]
    fn test_replaced_values_released_once_iterators_close() {
        let mut w = SkiplistWriter::new(bytewise());
        w.put(b"k", &[0u8; 100]);
        let base = w.skiplist().approximate_bytes();

        let it = w.skiplist().iter();
        w.put(b"k", &[1u8; 100]);
        w.put(b"k", &[2u8; 100]);
        // The original value stays for `it`; the middle one was never
        // visible to any iterator.
        assert_eq!(w.skiplist().approximate_bytes(), base + 100);

        drop(it);
        w.put(b"k", &[3u8; 100]);
        assert_eq!(w.skiplist().approximate_bytes(), base);
        assert_eq!(w.skiplist().get(b"k"), Some(vec![3u8; 100]));
    }

    #[test]
    fn test_concurrent_readers_never_lose_keys() {
        const KEYS: u32 = 4000;
        const READERS: usize = 4;

        let mut w = SkiplistWriter::new(bytewise());
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let list = Arc::clone(w.skiplist());
                std::thread::spawn(move || {
                    let mut last = 0;
                    loop {
                        let mut it = list.iter();
                        let entries = collect_forward(&mut it);
                        assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
                        // Every value names the key it was written under.
                        for (k, v) in &entries {
                            assert!(k.starts_with(v.as_slice()));
                        }
                        // Snapshots only grow: nothing seen before disappears.
                        assert!(entries.len() >= last);
                        last = entries.len();
                        if last == KEYS as usize {
                            return;
                        }
                    }
                })
            })
            .collect();

        for i in 0..KEYS {
            let key = format!("key{:06}", (i * 7919) % KEYS);
            w.put(key.as_bytes(), key.as_bytes());
            if i % 50 == 0 {
                // Overwrite an early key with a shorter prefix of itself.
                w.put(b"key000000", b"key");
            }
        }
        for reader in readers {
            reader.join().unwrap();
        }

        let list = w.skiplist();
        assert_eq!(list.len(), KEYS as usize);
        for i in 0..KEYS {
            let key = format!("key{:06}", i);
            assert!(list.get(key.as_bytes()).is_some(), "lost {}", key);
        }
    }

    #[test]
    fn test_backward_matches_forward() {
        let mut w = SkiplistWriter::new(bytewise());
        for i in (0..64u8).rev() {
            w.put(&[i], &[i, i]);
        }
        let mut it = w.skiplist().iter();
        let fwd = collect_forward(&mut it);
        let mut bwd = collect_backward(&mut it);
        bwd.reverse();
        assert_eq!(fwd, bwd);
        assert_eq!(fwd.len(), 64);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tern_sstable::{bytewise, collect_backward, collect_forward};

    proptest! {
        #[test]
        fn prop_matches_btreemap(
            ops in proptest::collection::vec(
                (proptest::collection::vec(any::<u8>(), 0..8),
                 proptest::collection::vec(any::<u8>(), 0..8)),
                0..200,
            )
        ) {
            let mut w = SkiplistWriter::new(bytewise());
            let mut reference = BTreeMap::new();
            for (k, v) in &ops {
                w.put(k, v);
                reference.insert(k.clone(), v.clone());
            }

            let list = w.skiplist();
            for (k, v) in &reference {
                let got = list.get(k);
                prop_assert_eq!(got.as_ref(), Some(v));
            }
            prop_assert_eq!(list.len(), reference.len());

            let expected: Vec<_> = reference.into_iter().collect();
            let mut it = list.iter();
            prop_assert_eq!(&collect_forward(&mut it), &expected);
            let mut bwd = collect_backward(&mut it);
            bwd.reverse();
            prop_assert_eq!(bwd, expected);
        }
    }
}
