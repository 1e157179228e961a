//! LRU of decoded tables.
//!
//! Entries are `Arc<Table>`: an evicted table stays alive until the last
//! iterator or compaction holding it lets go.

use crate::error::Result;
use crate::manifest::FileId;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tern_core::Env;
use tern_sstable::{Comparator, Table};

pub struct TableCache {
    env: Arc<dyn Env>,
    dir: PathBuf,
    cmp: Arc<dyn Comparator>,
    cache: Mutex<LruCache<FileId, Arc<Table>>>,
}

impl TableCache {
    pub fn new(env: Arc<dyn Env>, dir: PathBuf, cmp: Arc<dyn Comparator>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            env,
            dir,
            cmp,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the table for `id`, reading `location` on a miss.
    pub fn get(&self, id: FileId, location: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lock().get(&id) {
            return Ok(Arc::clone(table));
        }

        // Decode outside the lock; a racing loader just wastes one read.
        let data = self.env.read_all(&self.dir.join(location))?;
        let table = Arc::new(Table::from_bytes(Bytes::from(data), Arc::clone(&self.cmp))?);
        tracing::debug!(file_id = id, bytes = table.size(), "loaded table");

        self.cache.lock().put(id, Arc::clone(&table));
        Ok(table)
    }

    /// Seeds the cache with a table that was just written.
    pub fn insert(&self, id: FileId, table: Arc<Table>) {
        self.cache.lock().put(id, table);
    }

    pub fn evict(&self, id: FileId) {
        self.cache.lock().pop(&id);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tern_core::DiskEnv;
    use tern_sstable::{bytewise, TableBuilder};

    fn write_table(dir: &TempDir, name: &str, keys: &[&str]) {
        let mut builder = TableBuilder::new(1 << 16);
        for k in keys {
            builder.add(k.as_bytes(), b"v").unwrap();
        }
        let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
        builder.finalize_to(&mut file, bytewise()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_get_loads_then_hits() {
        let dir = TempDir::new().unwrap();
        write_table(&dir, "sst.0000000001", &["a", "b"]);
        let cache = TableCache::new(Arc::new(DiskEnv), dir.path().to_path_buf(), bytewise(), 2);

        let t1 = cache.get(1, "sst.0000000001").unwrap();
        assert_eq!(t1.get(b"a").as_deref(), Some(&b"v"[..]));

        // Served from memory even after the file is gone.
        std::fs::remove_file(dir.path().join("sst.0000000001")).unwrap();
        let t2 = cache.get(1, "sst.0000000001").unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
    }

    #[test]
    fn test_eviction_keeps_held_tables_alive() {
        let dir = TempDir::new().unwrap();
        for (i, name) in ["sst.0000000001", "sst.0000000002", "sst.0000000003"].iter().enumerate() {
            write_table(&dir, name, &[&format!("k{}", i)]);
        }
        let cache = TableCache::new(Arc::new(DiskEnv), dir.path().to_path_buf(), bytewise(), 2);

        let held = cache.get(1, "sst.0000000001").unwrap();
        cache.get(2, "sst.0000000002").unwrap();
        cache.get(3, "sst.0000000003").unwrap();
        assert_eq!(cache.len(), 2);

        // Evicted from the cache but still readable through the Arc.
        assert_eq!(held.get(b"k0").as_deref(), Some(&b"v"[..]));

        cache.evict(2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let cache = TableCache::new(Arc::new(DiskEnv), dir.path().to_path_buf(), bytewise(), 2);
        assert!(matches!(cache.get(9, "sst.0000000009"), Err(crate::Error::Io(_))));
    }
}
