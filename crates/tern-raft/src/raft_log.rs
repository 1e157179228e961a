//! Durable raft log and hard state for one region member.
//!
//! Lives in the member's shared metadata [`Db`] next to the edit queues:
//!
//! ```text
//! {prefix}entry/ || BE(u64 index)  ->  json(LogEntry)
//! {prefix}hard                     ->  json(HardState)
//! ```
//!
//! Indexes are contiguous from 1. Appends and truncations each land in one
//! [`WriteBatch`], so a crash leaves either the old or the new suffix.

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, RaftSequence};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tern_core::codec::{key_with_be_suffix, split_be_suffix};
use tern_core::ServerName;
use tern_lsm::{Db, KvIterator, WriteBatch};

/// Term and vote; must hit disk before answering a vote or an append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<ServerName>,
}

pub struct RaftLog {
    db: Arc<Db>,
    entry_prefix: Vec<u8>,
    hard_key: Vec<u8>,
    last: Mutex<RaftSequence>,
}

impl RaftLog {
    pub fn open(db: Arc<Db>, prefix: &str) -> Result<Self> {
        let entry_prefix = format!("{prefix}entry/").into_bytes();
        let hard_key = format!("{prefix}hard").into_bytes();
        let log = Self {
            db,
            entry_prefix,
            hard_key,
            last: Mutex::new(RaftSequence::ZERO),
        };
        let last = log.scan_last()?;
        *log.last.lock() = last;
        tracing::debug!(prefix, last = %last, "opened raft log");
        Ok(log)
    }

    /// Sequence of the newest entry, `ZERO` when empty.
    pub fn last(&self) -> RaftSequence {
        *self.last.lock()
    }

    pub fn entry_at(&self, index: u64) -> Result<Option<LogEntry>> {
        if index == 0 {
            return Ok(None);
        }
        match self.db.get(&self.key(index))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Sequence stored at `index`; index 0 is the implicit `ZERO`.
    pub fn sequence_at(&self, index: u64) -> Result<Option<RaftSequence>> {
        if index == 0 {
            return Ok(Some(RaftSequence::ZERO));
        }
        Ok(self.entry_at(index)?.map(|e| e.sequence))
    }

    /// Appends entries that continue directly after [`last`](Self::last).
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut last = self.last.lock();
        let mut expected = last.index + 1;
        let mut batch = WriteBatch::new();
        for entry in entries {
            if entry.sequence.index != expected || entry.sequence < *last {
                return Err(RaftError::Protocol(format!(
                    "log append out of order: got {}, expected index {}",
                    entry.sequence, expected
                )));
            }
            batch.put(self.key(expected), serde_json::to_vec(entry)?);
            expected += 1;
        }
        self.db.write(&batch)?;
        if let Some(tail) = entries.last() {
            *last = tail.sequence;
        }
        Ok(())
    }

    /// Up to `max` entries with index greater than `index`.
    pub fn read_after(&self, index: u64, max: usize) -> Result<Vec<LogEntry>> {
        let mut it = self.db.iter()?;
        it.seek(&self.key(index.saturating_add(1)));
        let mut out = Vec::new();
        while it.valid() && out.len() < max {
            if self.index_of(it.key()).is_none() {
                break;
            }
            out.push(serde_json::from_slice(it.value())?);
            it.next();
        }
        Ok(out)
    }

    /// Drops every entry after `index` and returns them.
    pub fn truncate_after(&self, index: u64) -> Result<Vec<LogEntry>> {
        let mut last = self.last.lock();
        if index >= last.index {
            return Ok(Vec::new());
        }
        let keep = match index {
            0 => RaftSequence::ZERO,
            i => self
                .entry_at(i)?
                .map(|e| e.sequence)
                .ok_or_else(|| RaftError::Protocol(format!("no log entry at index {i}")))?,
        };

        let removed = self.read_after(index, usize::MAX)?;
        let mut batch = WriteBatch::new();
        for entry in &removed {
            batch.delete(self.key(entry.sequence.index));
        }
        self.db.write(&batch)?;
        tracing::info!(from = %*last, to = %keep, "truncated raft log");
        *last = keep;
        Ok(removed)
    }

    pub fn hard_state(&self) -> Result<HardState> {
        match self.db.get(&self.hard_key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.db.put(&self.hard_key, &serde_json::to_vec(state)?)?;
        Ok(())
    }

    fn key(&self, index: u64) -> Vec<u8> {
        key_with_be_suffix(&self.entry_prefix, index)
    }

    fn index_of(&self, key: &[u8]) -> Option<u64> {
        match split_be_suffix(key) {
            Some((prefix, index)) if prefix == self.entry_prefix.as_slice() => Some(index),
            _ => None,
        }
    }

    fn scan_last(&self) -> Result<RaftSequence> {
        let mut it = self.db.iter()?;
        let upper = self.key(u64::MAX);
        it.seek(&upper);
        if !it.valid() {
            it.seek_to_last();
        } else if it.key() != upper.as_slice() {
            it.prev();
        }
        if it.valid() && self.index_of(it.key()).is_some() {
            let entry: LogEntry = serde_json::from_slice(it.value())?;
            return Ok(entry.sequence);
        }
        Ok(RaftSequence::ZERO)
    }
}
