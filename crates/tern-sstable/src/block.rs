//! Block builder and block iterator.
//!
//! A block is an immutable sorted byte area: a payload of
//! `(varint klen, varint vlen, key, value)` tuples, an 8-byte aligned array
//! with the start offset of every entry, and a 12-byte tailer (see
//! [`crate::format`]). Because every entry has a restart offset, an entry is
//! reachable by index and `seek` is a binary search over the array.

use crate::comparator::Comparator;
use crate::error::{Result, SSTableError};
use crate::format::{align_up, Tailer, TAILER_SIZE};
use crate::iterator::KvIterator;
use bytes::Bytes;
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;
use tern_core::codec::{decode_fixed32, get_varint, put_varint, varint_len};

/// Appends blocks into one bounded buffer.
///
/// After `finalize` the cursor continues behind the finished block, so a
/// single builder produces a run of consecutive blocks.
pub struct BlockBuilder {
    buf: Vec<u8>,
    capacity: usize,
    block_start: usize,
    offsets: Vec<u32>,
}

impl BlockBuilder {
    /// A builder whose buffer never grows beyond `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            block_start: 0,
            offsets: Vec::new(),
        }
    }

    /// Appends an entry to the current block.
    ///
    /// Returns false, leaving the builder untouched, when the entry plus the
    /// block's restart array and tailer would not fit in the buffer.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        let entry_len =
            varint_len(key.len() as u64) + varint_len(value.len() as u64) + key.len() + value.len();
        let payload = self.buf.len() - self.block_start + entry_len;
        let projected = align_up(payload) + 4 * (self.offsets.len() + 1) + TAILER_SIZE;
        if projected > u32::MAX as usize || self.block_start + projected > self.capacity {
            return false;
        }

        self.offsets.push((self.buf.len() - self.block_start) as u32);
        put_varint(&mut self.buf, key.len() as u64);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(value);
        true
    }

    /// Closes the current block and returns a view of it.
    pub fn finalize(&mut self) -> Block {
        let payload = self.buf.len() - self.block_start;
        let restart_offset = align_up(payload);
        self.buf.resize(self.block_start + restart_offset, 0);
        for off in &self.offsets {
            self.buf.extend_from_slice(&off.to_le_bytes());
        }
        let block_size = restart_offset + 4 * self.offsets.len() + TAILER_SIZE;
        let tailer = Tailer {
            block_size: block_size as u32,
            num_keys: self.offsets.len() as u32,
            restart_offset: restart_offset as u32,
        };
        self.buf.extend_from_slice(&tailer.encode());

        let block = Block {
            data: Bytes::copy_from_slice(&self.buf[self.block_start..]),
            num_keys: self.offsets.len(),
            restart_offset,
        };
        self.block_start = self.buf.len();
        self.offsets.clear();
        block
    }

    /// Entries added to the block in progress.
    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    /// Bytes used, including finished blocks and the pending payload.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the builder, returning every finished block back to back.
    ///
    /// A pending unfinished block is discarded.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.block_start);
        self.buf
    }
}

/// An immutable, validated block.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    num_keys: usize,
    restart_offset: usize,
}

impl Block {
    /// Decodes and validates a block, including every entry header.
    pub fn decode(data: Bytes) -> Result<Self> {
        let tailer = Tailer::decode_from_end(&data)?;
        let num_keys = tailer.num_keys as usize;
        let restart_offset = tailer.restart_offset as usize;

        if tailer.block_size as usize != data.len() {
            return Err(SSTableError::Corruption(format!(
                "tailer block size {} != {} bytes available",
                tailer.block_size,
                data.len()
            )));
        }
        if restart_offset % 8 != 0
            || restart_offset
                .checked_add(num_keys.saturating_mul(4))
                .and_then(|n| n.checked_add(TAILER_SIZE))
                != Some(data.len())
        {
            return Err(SSTableError::Corruption(format!(
                "restart array of {} keys at {} does not fit a {}-byte block",
                num_keys,
                restart_offset,
                data.len()
            )));
        }

        let block = Block {
            data,
            num_keys,
            restart_offset,
        };
        for i in 0..num_keys {
            block.parse_entry(i)?;
        }
        Ok(block)
    }

    pub fn num_keys(&self) -> usize {
        self.num_keys
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// The `i`-th entry, or `None` past the end.
    pub fn entry_at(&self, i: usize) -> Option<(&[u8], &[u8])> {
        let (k, v) = self.entry_ranges(i)?;
        Some((&self.data[k], &self.data[v]))
    }

    pub fn iter(&self, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: self.clone(),
            cmp,
            idx: self.num_keys,
            key: 0..0,
            value: 0..0,
        }
    }

    fn entry_ranges(&self, i: usize) -> Option<(Range<usize>, Range<usize>)> {
        if i >= self.num_keys {
            return None;
        }
        self.parse_entry(i).ok()
    }

    fn parse_entry(&self, i: usize) -> Result<(Range<usize>, Range<usize>)> {
        let off = decode_fixed32(&self.data, self.restart_offset + 4 * i)? as usize;
        if off >= self.restart_offset {
            return Err(SSTableError::Corruption(format!(
                "entry {} offset {} outside payload",
                i, off
            )));
        }
        let mut cursor = &self.data[off..self.restart_offset];
        let klen = get_varint(&mut cursor)? as usize;
        let vlen = get_varint(&mut cursor)? as usize;
        let key_start = self.restart_offset - cursor.len();
        let value_start = key_start.checked_add(klen);
        let value_end = value_start.and_then(|s| s.checked_add(vlen));
        match (value_start, value_end) {
            (Some(vs), Some(ve)) if ve <= self.restart_offset => Ok((key_start..vs, vs..ve)),
            _ => Err(SSTableError::Corruption(format!(
                "entry {} lengths {}+{} overrun payload",
                i, klen, vlen
            ))),
        }
    }
}

/// Random-access cursor over a [`Block`].
pub struct BlockIter {
    block: Block,
    cmp: Arc<dyn Comparator>,
    idx: usize,
    key: Range<usize>,
    value: Range<usize>,
}

impl BlockIter {
    fn position(&mut self, idx: usize) {
        match self.block.entry_ranges(idx) {
            Some((k, v)) => {
                self.idx = idx;
                self.key = k;
                self.value = v;
            }
            None => self.invalidate(),
        }
    }

    fn invalidate(&mut self) {
        self.idx = self.block.num_keys;
        self.key = 0..0;
        self.value = 0..0;
    }

    /// Index of the current entry.
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn seek_to_index(&mut self, idx: usize) {
        self.position(idx);
    }
}

impl KvIterator for BlockIter {
    fn valid(&self) -> bool {
        self.idx < self.block.num_keys
    }

    fn seek_to_first(&mut self) {
        self.position(0);
    }

    fn seek_to_last(&mut self) {
        match self.block.num_keys.checked_sub(1) {
            Some(last) => self.position(last),
            None => self.invalidate(),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let (mut lo, mut hi) = (0usize, self.block.num_keys);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some((key, _)) = self.block.entry_at(mid) else {
                self.invalidate();
                return;
            };
            if self.cmp.compare(key, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.position(lo);
    }

    fn next(&mut self) {
        if self.valid() {
            self.position(self.idx + 1);
        }
    }

    fn prev(&mut self) {
        if self.valid() && self.idx > 0 {
            self.position(self.idx - 1);
        } else {
            self.invalidate();
        }
    }

    fn key(&self) -> &[u8] {
        &self.block.data[self.key.clone()]
    }

    fn value(&self) -> &[u8] {
        &self.block.data[self.value.clone()]
    }
}
