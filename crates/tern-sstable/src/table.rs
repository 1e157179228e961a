//! Table builder, table and table iterator.
//!
//! ```text
//!   TableBuilder::add(k, v)
//!        │
//!        ├── leaf BlockBuilder  ── differential keys, anchor every 16 entries
//!        │      (128 entries per leaf)
//!        └── index BlockBuilder ── last key of leaf → u32 LE leaf end offset
//!
//!   finalize(cmp) → [leaf 0 .. leaf N-1][index]  →  Table
//! ```

use crate::block::{Block, BlockBuilder, BlockIter};
use crate::comparator::Comparator;
use crate::diff::{encode_full_key, encode_key, DiffIter};
use crate::error::{Result, SSTableError};
use crate::format::{
    Tailer, ENTRIES_PER_FULL_KEY, LEAF_ENTRIES_PER_INDEX_ENTRY, SIZE_HINT_SLACK,
};
use crate::iterator::KvIterator;
use bytes::Bytes;
use std::cmp::Ordering;
use std::io::{Read, Write};
use std::sync::Arc;
use tern_core::codec::decode_fixed32;

/// Streams sorted entries into leaf blocks plus one index block.
pub struct TableBuilder {
    size_hint: usize,
    leaf: BlockBuilder,
    index: BlockBuilder,
    entries_in_leaf: usize,
    num_entries: usize,
    prev_key: Vec<u8>,
    first_key: Option<Vec<u8>>,
}

impl TableBuilder {
    /// `size_hint` bounds the leaf area; entries beyond `size_hint - 64`
    /// bytes are rejected with [`SSTableError::Overflow`].
    pub fn new(size_hint: usize) -> Self {
        Self {
            size_hint,
            leaf: BlockBuilder::with_capacity(size_hint.saturating_sub(SIZE_HINT_SLACK)),
            index: BlockBuilder::with_capacity(usize::MAX),
            entries_in_leaf: 0,
            num_entries: 0,
            prev_key: Vec::new(),
            first_key: None,
        }
    }

    /// Adds the next entry; keys must arrive in ascending comparator order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.entries_in_leaf == LEAF_ENTRIES_PER_INDEX_ENTRY {
            self.finish_leaf()?;
        }

        let stored = if self.entries_in_leaf % ENTRIES_PER_FULL_KEY == 0 {
            encode_full_key(key)
        } else {
            encode_key(&self.prev_key, key)
        };
        if !self.leaf.add(&stored, value) {
            return Err(SSTableError::Overflow {
                entry_bytes: stored.len() + value.len(),
                size_hint: self.size_hint,
            });
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.entries_in_leaf += 1;
        self.num_entries += 1;
        Ok(())
    }

    fn finish_leaf(&mut self) -> Result<()> {
        self.leaf.finalize();
        self.entries_in_leaf = 0;
        let indexed = u32::try_from(self.leaf.len())
            .map_or(false, |end| self.index.add(&self.prev_key, &end.to_le_bytes()));
        if !indexed {
            return Err(SSTableError::Overflow {
                entry_bytes: self.prev_key.len() + 4,
                size_hint: self.size_hint,
            });
        }
        Ok(())
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Approximate encoded size of the table if finalized now.
    pub fn estimated_size(&self) -> usize {
        self.leaf.len() + self.index.len() + 4 * self.entries_in_leaf + SIZE_HINT_SLACK
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.first_key.as_deref()
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        (self.num_entries > 0).then_some(self.prev_key.as_slice())
    }

    /// Closes the last leaf and the index and returns the in-memory table.
    pub fn finalize(mut self, cmp: Arc<dyn Comparator>) -> Result<Table> {
        if self.entries_in_leaf > 0 {
            self.finish_leaf()?;
        }
        let index = self.index.finalize();
        let mut data = self.leaf.into_bytes();
        data.extend_from_slice(index.as_bytes());
        Table::from_bytes(Bytes::from(data), cmp)
    }

    /// Like [`finalize`](Self::finalize), also writing the table to `out`.
    pub fn finalize_to<W: Write + ?Sized>(self, out: &mut W, cmp: Arc<dyn Comparator>) -> Result<Table> {
        let table = self.finalize(cmp)?;
        table.write_to(out)?;
        Ok(table)
    }
}

/// An immutable table held in memory.
pub struct Table {
    data: Bytes,
    leaves: Vec<Block>,
    index: Block,
    cmp: Arc<dyn Comparator>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("size", &self.data.len())
            .field("leaves", &self.leaves.len())
            .field("comparator", &self.cmp.name())
            .finish()
    }
}

impl Table {
    /// Decodes a complete table image.
    ///
    /// The trailing block is the index; each index value is the end offset of
    /// a leaf, which must tile the leaf area exactly.
    pub fn from_bytes(data: Bytes, cmp: Arc<dyn Comparator>) -> Result<Self> {
        let tailer = Tailer::decode_from_end(&data)?;
        let index_size = tailer.block_size as usize;
        if index_size > data.len() {
            return Err(SSTableError::Corruption(format!(
                "index block of {} bytes in a {}-byte table",
                index_size,
                data.len()
            )));
        }
        let leaf_area = data.len() - index_size;
        let index = Block::decode(data.slice(leaf_area..))?;

        let mut leaves = Vec::with_capacity(index.num_keys());
        let mut start = 0usize;
        for i in 0..index.num_keys() {
            let Some((_, value)) = index.entry_at(i) else {
                return Err(SSTableError::Corruption(format!("index entry {} unreadable", i)));
            };
            if value.len() != 4 {
                return Err(SSTableError::Corruption(format!(
                    "index entry {} has a {}-byte offset",
                    i,
                    value.len()
                )));
            }
            let end = decode_fixed32(value, 0)? as usize;
            if end <= start || end > leaf_area {
                return Err(SSTableError::Corruption(format!(
                    "leaf {} spans {}..{} outside leaf area of {} bytes",
                    i, start, end, leaf_area
                )));
            }
            leaves.push(Block::decode(data.slice(start..end))?);
            start = end;
        }
        if start != leaf_area {
            return Err(SSTableError::Corruption(format!(
                "index covers {} of {} leaf bytes",
                start, leaf_area
            )));
        }

        Ok(Self {
            data,
            leaves,
            index,
            cmp,
        })
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.cmp
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.data)?;
        Ok(())
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            table: Arc::clone(self),
            index: self.index.iter(Arc::clone(&self.cmp)),
            leaf: None,
        }
    }

    /// Point lookup.
    pub fn get(self: &Arc<Self>, key: &[u8]) -> Option<Vec<u8>> {
        let mut it = self.iter();
        it.seek(key);
        (it.valid() && self.cmp.compare(it.key(), key) == Ordering::Equal)
            .then(|| it.value().to_vec())
    }

    pub fn first_key(self: &Arc<Self>) -> Option<Vec<u8>> {
        let mut it = self.iter();
        it.seek_to_first();
        it.valid().then(|| it.key().to_vec())
    }

    /// Last key, read from the index without touching the leaves.
    pub fn last_key(&self) -> Option<Vec<u8>> {
        let last = self.index.num_keys().checked_sub(1)?;
        self.index.entry_at(last).map(|(k, _)| k.to_vec())
    }
}

/// Reads a whole table file into `buf` and decodes it.
pub fn recover_table<R: Read + ?Sized>(
    file: &mut R,
    mut buf: Vec<u8>,
    cmp: Arc<dyn Comparator>,
) -> Result<Table> {
    buf.clear();
    file.read_to_end(&mut buf)?;
    Table::from_bytes(Bytes::from(buf), cmp)
}

/// Index iterator composed with a differential-decoding leaf iterator.
pub struct TableIter {
    table: Arc<Table>,
    index: BlockIter,
    leaf: Option<DiffIter>,
}

impl TableIter {
    fn load_leaf(&mut self) -> bool {
        if !self.index.valid() {
            self.leaf = None;
            return false;
        }
        match self.table.leaves.get(self.index.index()) {
            Some(block) => {
                self.leaf = Some(DiffIter::new(block.clone(), Arc::clone(&self.table.cmp)));
                true
            }
            None => {
                self.leaf = None;
                false
            }
        }
    }

    fn leaf_valid(&self) -> bool {
        self.leaf.as_ref().is_some_and(|l| l.valid())
    }

    /// Moves forward over empty or exhausted leaves.
    fn skip_forward(&mut self) {
        while !self.leaf_valid() && self.index.valid() {
            self.index.next();
            if self.load_leaf() {
                if let Some(leaf) = self.leaf.as_mut() {
                    leaf.seek_to_first();
                }
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.leaf_valid() && self.index.valid() {
            self.index.prev();
            if self.load_leaf() {
                if let Some(leaf) = self.leaf.as_mut() {
                    leaf.seek_to_last();
                }
            }
        }
    }
}

impl KvIterator for TableIter {
    fn valid(&self) -> bool {
        self.leaf_valid()
    }

    fn seek_to_first(&mut self) {
        self.index.seek_to_first();
        if self.load_leaf() {
            if let Some(leaf) = self.leaf.as_mut() {
                leaf.seek_to_first();
            }
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        self.index.seek_to_last();
        if self.load_leaf() {
            if let Some(leaf) = self.leaf.as_mut() {
                leaf.seek_to_last();
            }
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        // The first leaf whose last key is >= target holds the answer.
        self.index.seek(target);
        if self.load_leaf() {
            if let Some(leaf) = self.leaf.as_mut() {
                leaf.seek(target);
            }
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        if let Some(leaf) = self.leaf.as_mut() {
            leaf.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        if let Some(leaf) = self.leaf.as_mut() {
            leaf.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.leaf.as_ref().map(|l| l.key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.leaf.as_ref().map(|l| l.value()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::bytewise;
    use crate::iterator::{collect_backward, collect_forward};

    fn build(n: usize) -> (Arc<Table>, Vec<(Vec<u8>, Vec<u8>)>) {
        let entries: Vec<_> = (0..n)
            .map(|i| {
                (
                    format!("key-{:06}", i).into_bytes(),
                    format!("value-{}", i).into_bytes(),
                )
            })
            .collect();
        let mut builder = TableBuilder::new(1 << 22);
        for (k, v) in &entries {
            builder.add(k, v).unwrap();
        }
        (Arc::new(builder.finalize(bytewise()).unwrap()), entries)
    }

    #[test]
    fn test_single_leaf_table() {
        let (table, entries) = build(10);
        assert_eq!(table.num_leaves(), 1);
        assert_eq!(collect_forward(&mut table.iter()), entries);
        assert_eq!(table.last_key(), Some(b"key-000009".to_vec()));
    }

    #[test]
    fn test_multi_leaf_forward_backward() {
        let (table, entries) = build(1000);
        assert_eq!(table.num_leaves(), 1000usize.div_ceil(LEAF_ENTRIES_PER_INDEX_ENTRY));

        let mut it = table.iter();
        assert_eq!(collect_forward(&mut it), entries);
        let mut back = collect_backward(&mut it);
        back.reverse();
        assert_eq!(back, entries);
    }

    #[test]
    fn test_seek_across_leaf_boundaries() {
        let (table, _) = build(1000);
        let mut it = table.iter();

        // Last entry of the first leaf, then step into the second.
        it.seek(b"key-000127");
        assert_eq!(it.key(), b"key-000127");
        it.next();
        assert_eq!(it.key(), b"key-000128");
        it.prev();
        it.prev();
        assert_eq!(it.key(), b"key-000126");

        it.seek(b"key-0005005");
        assert_eq!(it.key(), b"key-000501");

        it.seek(b"zzz");
        assert!(!it.valid());
    }

    #[test]
    fn test_get_and_first_key() {
        let (table, _) = build(300);
        assert_eq!(table.get(b"key-000299"), Some(b"value-299".to_vec()));
        assert_eq!(table.get(b"key-000300"), None);
        assert_eq!(table.first_key(), Some(b"key-000000".to_vec()));
    }

    #[test]
    fn test_empty_table() {
        let builder = TableBuilder::new(1024);
        assert!(builder.is_empty());
        let table = Arc::new(builder.finalize(bytewise()).unwrap());
        let mut it = table.iter();
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
        assert_eq!(table.last_key(), None);
    }

    #[test]
    fn test_index_overflow_is_reported() {
        let mut builder = TableBuilder::new(1 << 22);
        // Room for exactly one index entry.
        builder.index = BlockBuilder::with_capacity(40);

        for i in 0..2 * LEAF_ENTRIES_PER_INDEX_ENTRY {
            builder.add(format!("key-{:06}", i).as_bytes(), b"v").unwrap();
        }
        let err = builder.add(b"key-999999", b"v").unwrap_err();
        assert!(matches!(err, SSTableError::Overflow { entry_bytes: 14, .. }));

        let mut builder = TableBuilder::new(1 << 22);
        builder.index = BlockBuilder::with_capacity(40);
        for i in 0..LEAF_ENTRIES_PER_INDEX_ENTRY + 1 {
            builder.add(format!("key-{:06}", i).as_bytes(), b"v").unwrap();
        }
        assert!(matches!(
            builder.finalize(bytewise()),
            Err(SSTableError::Overflow { .. })
        ));
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut builder = TableBuilder::new(128);
        builder.add(b"a", &[0u8; 20]).unwrap();
        let err = builder.add(b"b", &[0u8; 100]).unwrap_err();
        assert!(matches!(err, SSTableError::Overflow { size_hint: 128, .. }));
    }

    #[test]
    fn test_recover_from_reader() {
        let (table, entries) = build(400);
        let mut file = Vec::new();
        table.write_to(&mut file).unwrap();

        let recovered =
            Arc::new(recover_table(&mut file.as_slice(), Vec::new(), bytewise()).unwrap());
        assert_eq!(recovered.size(), table.size());
        assert_eq!(collect_forward(&mut recovered.iter()), entries);
    }

    #[test]
    fn test_truncated_table_is_corruption() {
        let (table, _) = build(200);
        let bytes = table.as_bytes().slice(..table.size() - 1);
        assert!(matches!(
            Table::from_bytes(bytes, bytewise()),
            Err(SSTableError::Corruption(_))
        ));
    }

    #[test]
    fn test_builder_tracks_bounds() {
        let mut builder = TableBuilder::new(1 << 16);
        assert_eq!(builder.first_key(), None);
        builder.add(b"a", b"1").unwrap();
        builder.add(b"b", b"2").unwrap();
        assert_eq!(builder.first_key(), Some(&b"a"[..]));
        assert_eq!(builder.last_key(), Some(&b"b"[..]));
        assert_eq!(builder.num_entries(), 2);
        assert!(builder.estimated_size() > 0);
    }
}
