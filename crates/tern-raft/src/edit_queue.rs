//! Durable per-member queue of client edits.
//!
//! Entries live in a shared [`Db`] under `prefix || big-endian(u64 seq)`;
//! the prefix namespaces one queue per region. Sequences start at 1 and are
//! gap-free. A trim never removes the newest entry, so the sequence counter
//! survives a reopen.

use crate::error::{RaftError, Result};
use std::sync::Arc;
use tern_core::codec::{key_with_be_suffix, split_be_suffix};
use tern_lsm::{Db, KvIterator, WriteBatch};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    first: u64,
    last: u64,
}

pub struct EditQueue {
    db: Arc<Db>,
    prefix: Vec<u8>,
    /// `None` until scanned and after every mutation. The lock also orders
    /// appends against trims.
    bounds: Mutex<Option<Bounds>>,
}

impl EditQueue {
    pub fn new(db: Arc<Db>, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            db,
            prefix: prefix.into(),
            bounds: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Appends `data` and returns its sequence.
    pub async fn append_edit(&self, data: &[u8]) -> Result<u64> {
        let mut bounds = self.bounds.lock().await;
        let current = self.load(&mut bounds)?;
        let seq = current.last + 1;
        self.db.put(&self.key(seq), data)?;
        *bounds = None;
        tracing::trace!(seq, bytes = data.len(), "appended edit");
        Ok(seq)
    }

    /// Up to `n` payloads starting at `start`, with the sequence of the first.
    ///
    /// A `start` before the first live sequence is an error; one past the
    /// last yields an empty result.
    pub async fn get_n(&self, start: u64, n: usize) -> Result<(u64, Vec<Vec<u8>>)> {
        let current = {
            let mut bounds = self.bounds.lock().await;
            self.load(&mut bounds)?
        };
        if current.last == 0 || start > current.last {
            return Ok((start, Vec::new()));
        }
        if start < current.first {
            return Err(RaftError::SequenceNotFound {
                start,
                first: current.first,
            });
        }

        let mut it = self.db.iter()?;
        it.seek(&self.key(start));
        let mut actual_start = None;
        let mut payloads = Vec::new();
        while it.valid() && payloads.len() < n {
            let Some(seq) = self.sequence_of(it.key()) else {
                break;
            };
            actual_start.get_or_insert(seq);
            payloads.push(it.value().to_vec());
            it.next();
        }
        Ok((actual_start.unwrap_or(start), payloads))
    }

    /// Deletes `[first, min(end, last))` in one batch.
    pub async fn trim(&self, end: u64) -> Result<()> {
        let mut bounds = self.bounds.lock().await;
        let current = self.load(&mut bounds)?;
        let stop = end.min(current.last);
        if current.last == 0 || stop <= current.first {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for seq in current.first..stop {
            batch.delete(self.key(seq));
        }
        self.db.write(&batch)?;
        *bounds = None;
        tracing::debug!(first = current.first, end = stop, "trimmed edit queue");
        Ok(())
    }

    /// First live sequence, 0 when the queue was never written.
    pub async fn first_sequence(&self) -> Result<u64> {
        let mut bounds = self.bounds.lock().await;
        Ok(self.load(&mut bounds)?.first)
    }

    /// Last written sequence, 0 when the queue was never written.
    pub async fn last_sequence(&self) -> Result<u64> {
        let mut bounds = self.bounds.lock().await;
        Ok(self.load(&mut bounds)?.last)
    }

    fn key(&self, seq: u64) -> Vec<u8> {
        key_with_be_suffix(&self.prefix, seq)
    }

    fn sequence_of(&self, key: &[u8]) -> Option<u64> {
        match split_be_suffix(key) {
            Some((prefix, seq)) if prefix == self.prefix.as_slice() => Some(seq),
            _ => None,
        }
    }

    fn load(&self, bounds: &mut Option<Bounds>) -> Result<Bounds> {
        if let Some(b) = *bounds {
            return Ok(b);
        }
        let scanned = self.scan()?;
        *bounds = Some(scanned);
        Ok(scanned)
    }

    /// Reads both ends of the keyspace.
    fn scan(&self) -> Result<Bounds> {
        let mut it = self.db.iter()?;

        it.seek(&self.key(0));
        let first = if it.valid() {
            self.sequence_of(it.key())
        } else {
            None
        };
        let Some(first) = first else {
            return Ok(Bounds { first: 0, last: 0 });
        };

        let upper = self.key(u64::MAX);
        it.seek(&upper);
        if !it.valid() {
            it.seek_to_last();
        } else if it.key() != upper.as_slice() {
            it.prev();
        }
        let last = if it.valid() {
            self.sequence_of(it.key()).unwrap_or(first)
        } else {
            first
        };
        Ok(Bounds { first, last })
    }
}
