//! Differential key encoding for leaf blocks.
//!
//! A stored leaf key is one `common` byte (0..=127) followed by the suffix of
//! the key after the `common` bytes it shares with the previous key. A key
//! stored with `common == 0` is complete and serves as an anchor; the table
//! builder forces one every [`ENTRIES_PER_FULL_KEY`] entries so that a
//! backward step never decodes more than that many keys.

use crate::block::Block;
use crate::comparator::Comparator;
use crate::format::{ENTRIES_PER_FULL_KEY, MAX_COMMON_PREFIX};
use crate::iterator::KvIterator;
use std::cmp::Ordering;
use std::sync::Arc;

/// Encodes `cur` relative to `prev`.
pub fn encode_key(prev: &[u8], cur: &[u8]) -> Vec<u8> {
    let common = prev
        .iter()
        .zip(cur)
        .take(MAX_COMMON_PREFIX)
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = Vec::with_capacity(1 + cur.len() - common);
    out.push(common as u8);
    out.extend_from_slice(&cur[common..]);
    out
}

/// Encodes `cur` as an anchor.
pub fn encode_full_key(cur: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + cur.len());
    out.push(0);
    out.extend_from_slice(cur);
    out
}

/// Rebuilds a key from its predecessor and its stored form.
///
/// Returns `None` for a malformed stored key.
pub fn decode_key(prev: &[u8], stored: &[u8]) -> Option<Vec<u8>> {
    let (&common, suffix) = stored.split_first()?;
    let common = common as usize;
    if common > MAX_COMMON_PREFIX || common > prev.len() {
        return None;
    }
    let mut key = Vec::with_capacity(common + suffix.len());
    key.extend_from_slice(&prev[..common]);
    key.extend_from_slice(suffix);
    Some(key)
}

fn is_anchor(stored: &[u8]) -> bool {
    stored.first() == Some(&0)
}

/// Iterator over a leaf block that yields fully decoded keys.
///
/// `next` decodes from the cached previous key. `prev` and `seek` drop the
/// cache: the key at the new position is rebuilt by walking back to the
/// nearest anchor and decoding forward.
pub struct DiffIter {
    block: Block,
    cmp: Arc<dyn Comparator>,
    idx: usize,
    key: Vec<u8>,
}

impl DiffIter {
    pub fn new(block: Block, cmp: Arc<dyn Comparator>) -> Self {
        let idx = block.num_keys();
        Self {
            block,
            cmp,
            idx,
            key: Vec::new(),
        }
    }

    fn invalidate(&mut self) {
        self.idx = self.block.num_keys();
        self.key.clear();
    }

    /// Positions at `idx` without a cached predecessor.
    fn position_uncached(&mut self, idx: usize) {
        if idx >= self.block.num_keys() {
            self.invalidate();
            return;
        }

        let mut anchor = idx;
        loop {
            match self.block.entry_at(anchor) {
                Some((stored, _)) if is_anchor(stored) => break,
                Some(_) if anchor > 0 => anchor -= 1,
                _ => {
                    tracing::warn!(idx, "leaf block has no anchor before entry");
                    self.invalidate();
                    return;
                }
            }
        }

        let mut key = Vec::new();
        for i in anchor..=idx {
            let decoded = self
                .block
                .entry_at(i)
                .and_then(|(stored, _)| decode_key(&key, stored));
            match decoded {
                Some(k) => key = k,
                None => {
                    self.invalidate();
                    return;
                }
            }
        }
        self.idx = idx;
        self.key = key;
    }

    fn anchor_key(&self, idx: usize) -> Option<Vec<u8>> {
        let (stored, _) = self.block.entry_at(idx)?;
        if !is_anchor(stored) {
            return None;
        }
        Some(stored[1..].to_vec())
    }
}

impl KvIterator for DiffIter {
    fn valid(&self) -> bool {
        self.idx < self.block.num_keys()
    }

    fn seek_to_first(&mut self) {
        self.position_uncached(0);
    }

    fn seek_to_last(&mut self) {
        match self.block.num_keys().checked_sub(1) {
            Some(last) => self.position_uncached(last),
            None => self.invalidate(),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search over the forced anchors for the last one below target.
        let anchors = self.block.num_keys().div_ceil(ENTRIES_PER_FULL_KEY);
        let (mut lo, mut hi) = (0usize, anchors);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some(key) = self.anchor_key(mid * ENTRIES_PER_FULL_KEY) else {
                self.invalidate();
                return;
            };
            if self.cmp.compare(&key, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let start = lo.saturating_sub(1) * ENTRIES_PER_FULL_KEY;
        self.position_uncached(start);
        while self.valid() && self.cmp.compare(&self.key, target) == Ordering::Less {
            self.next();
        }
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        let idx = self.idx + 1;
        let decoded = self
            .block
            .entry_at(idx)
            .and_then(|(stored, _)| decode_key(&self.key, stored));
        match decoded {
            Some(key) => {
                self.idx = idx;
                self.key = key;
            }
            None => self.invalidate(),
        }
    }

    fn prev(&mut self) {
        if self.valid() && self.idx > 0 {
            self.position_uncached(self.idx - 1);
        } else {
            self.invalidate();
        }
    }

    fn key(&self) -> &[u8] {
        if self.valid() {
            &self.key
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        self.block.entry_at(self.idx).map(|(_, v)| v).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::comparator::bytewise;
    use crate::iterator::{collect_backward, collect_forward};

    fn leaf(keys: &[Vec<u8>]) -> Block {
        let mut builder = BlockBuilder::with_capacity(1 << 20);
        let mut prev: Vec<u8> = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            let stored = if i % ENTRIES_PER_FULL_KEY == 0 {
                encode_full_key(k)
            } else {
                encode_key(&prev, k)
            };
            assert!(builder.add(&stored, &(i as u32).to_le_bytes()));
            prev = k.clone();
        }
        builder.finalize()
    }

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("user:{:05}", i * 3).into_bytes()).collect()
    }

    #[test]
    fn test_encode_decode_shared_prefix() {
        let stored = encode_key(b"user:00042", b"user:00057");
        assert_eq!(stored[0], 8);
        assert_eq!(&stored[1..], b"57");
        assert_eq!(decode_key(b"user:00042", &stored).unwrap(), b"user:00057");
    }

    #[test]
    fn test_common_prefix_caps_at_127() {
        let prev = vec![b'x'; 300];
        let mut cur = prev.clone();
        cur.push(b'y');
        let stored = encode_key(&prev, &cur);
        assert_eq!(stored[0] as usize, MAX_COMMON_PREFIX);
        assert_eq!(decode_key(&prev, &stored).unwrap(), cur);
    }

    #[test]
    fn test_decode_rejects_bad_common() {
        assert_eq!(decode_key(b"ab", &[3, b'c']), None);
        assert_eq!(decode_key(b"ab", &[]), None);
    }

    #[test]
    fn test_iterates_across_anchors() {
        let ks = keys(50);
        let mut it = DiffIter::new(leaf(&ks), bytewise());

        let fwd: Vec<_> = collect_forward(&mut it).into_iter().map(|(k, _)| k).collect();
        assert_eq!(fwd, ks);

        let mut bwd: Vec<_> = collect_backward(&mut it).into_iter().map(|(k, _)| k).collect();
        bwd.reverse();
        assert_eq!(bwd, ks);
    }

    #[test]
    fn test_seek_lands_between_anchors() {
        let ks = keys(50);
        let mut it = DiffIter::new(leaf(&ks), bytewise());

        it.seek(b"user:00100");
        // 100 is not a multiple of 3; the next key is 102 (entry 34).
        assert_eq!(it.key(), b"user:00102");
        assert_eq!(it.value(), &34u32.to_le_bytes());

        it.prev();
        assert_eq!(it.key(), b"user:00099");
        it.next();
        it.next();
        assert_eq!(it.key(), b"user:00105");

        it.seek(b"a");
        assert_eq!(it.key(), b"user:00000");
        it.seek(b"user:99999");
        assert!(!it.valid());
    }
}
