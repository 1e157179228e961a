//! Versioned key/value storage for one region.
//!
//! Keys are stored as `raw_key || big-endian(u64 version)`. The
//! [`VersionedComparator`] orders by raw key first and version second, so
//! every version of a key sits in one run with the newest last, even when
//! one raw key is a prefix of another.

use crate::error::Result;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tern_core::codec::{key_with_be_suffix, split_be_suffix};
use tern_core::Env;
use tern_lsm::{Db, DbIterator, KvIterator, Meter, Options};
use tern_sstable::Comparator;

/// Orders `raw || BE(version)` keys by `(raw, version)`.
///
/// Keys shorter than a version suffix sort bytewise before anything they
/// are a prefix of.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedComparator;

impl Comparator for VersionedComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (split_be_suffix(a), split_be_suffix(b)) {
            (Some((ra, va)), Some((rb, vb))) => ra.cmp(rb).then(va.cmp(&vb)),
            _ => a.cmp(b),
        }
    }

    fn name(&self) -> &'static str {
        "tern.versioned"
    }
}

pub struct RegionStore {
    db: Db,
}

impl RegionStore {
    pub async fn open(
        dir: impl AsRef<Path>,
        options: Options,
        env: Arc<dyn Env>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let db = Db::open(dir, options, Arc::new(VersionedComparator), env, meter).await?;
        Ok(Self { db })
    }

    pub fn put(&self, key: &[u8], value: &[u8], version: u64) -> Result<()> {
        self.db.put(&key_with_be_suffix(key, version), value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8], version: u64) -> Result<()> {
        self.db.delete(&key_with_be_suffix(key, version))?;
        Ok(())
    }

    /// Value of `key` written at exactly `version`.
    pub fn get_at(&self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(&key_with_be_suffix(key, version))?)
    }

    /// Newest version of `key` and its value.
    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let mut it = self.db.iter()?;
        let upper = key_with_be_suffix(key, u64::MAX);
        it.seek(&upper);
        if !it.valid() {
            it.seek_to_last();
        } else if it.key() != upper.as_slice() {
            it.prev();
        }
        if !it.valid() {
            return Ok(None);
        }
        match split_be_suffix(it.key()) {
            Some((raw, version)) if raw == key => Ok(Some((version, it.value().to_vec()))),
            _ => Ok(None),
        }
    }

    /// Engine iterator over encoded keys; see [`VersionedComparator`].
    pub fn iter(&self) -> Result<DbIterator> {
        Ok(self.db.iter()?)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush().await?;
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.db.close().await?;
        Ok(())
    }
}
