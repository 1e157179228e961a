//! The storage engine.
//!
//! # Data flow
//!
//! ```text
//!  write(batch) ──► WAL record ──► active skiplist ──(min_log_size)──► trigger
//!                                        │ rotate
//!                                        ↓
//!                                 retired skiplist ──► L0[0] / merge into Ln
//!
//!  get(key):  active → retired → L0[0] … L0[max-1] → Ln …   (first hit wins)
//! ```
//!
//! Values are stored tagged (see [`crate::batch`]); a deletion shadows older
//! values until compaction drops it from the deepest level.

use crate::batch::{is_deletion, untag, WriteBatch};
use crate::compaction::{run_round, Compactor};
use crate::error::{Error, Result};
use crate::manifest::{FileId, Manifest, SnapshotHandle};
use crate::merge::{ConcatenationIterator, HeapIterator};
use crate::options::Options;
use crate::skiplist::{Skiplist, SkiplistWriter};
use crate::table_cache::TableCache;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tern_core::filename::{log_file_name, parse_file_name, FileKind};
use tern_core::{Env, WritableFile};
use tern_observe::{obs_count, obs_gauge, Meter, TernEvent, WalEvt, WalKind};
use tern_sstable::{Comparator, KvIterator};
use tern_wal::{LogReader, LogWriter};

/// A skiplist rotated out of the write path and not yet persisted.
#[derive(Clone)]
pub(crate) struct Retired {
    pub(crate) mem: Arc<Skiplist>,
    /// WAL that took over when `mem` was rotated out.
    pub(crate) next_log: u64,
}

pub(crate) struct MemState {
    pub(crate) active: Arc<Skiplist>,
    pub(crate) retired: Option<Retired>,
}

pub(crate) struct WriteState {
    pub(crate) mem: SkiplistWriter,
    pub(crate) log: LogWriter<Box<dyn WritableFile>>,
    pub(crate) log_number: u64,
}

/// State shared between the handle and the compaction task.
pub(crate) struct DbInner {
    pub(crate) dir: PathBuf,
    pub(crate) options: Options,
    pub(crate) cmp: Arc<dyn Comparator>,
    pub(crate) env: Arc<dyn Env>,
    pub(crate) meter: Arc<dyn Meter>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) tables: Arc<TableCache>,
    /// What readers see. Lock order: `writer` before `mem`.
    pub(crate) mem: RwLock<MemState>,
    pub(crate) writer: Mutex<WriteState>,
}

/// Handle to an open database directory.
pub struct Db {
    inner: Arc<DbInner>,
    compactor: Compactor,
}

impl Db {
    /// Opens (or creates) the database in `dir`.
    ///
    /// # Process
    ///
    /// 1. Recover the manifest; remove tables it does not know about
    /// 2. Replay every WAL numbered `>= log_number` into a fresh skiplist
    /// 3. Start a new WAL and persist the replayed data as a regular round
    /// 4. Spawn the compaction task
    pub async fn open(
        dir: impl AsRef<Path>,
        options: Options,
        cmp: Arc<dyn Comparator>,
        env: Arc<dyn Env>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        if options.create_if_missing {
            env.create_dir_all(&dir)?;
        } else if !env.file_exists(&dir) {
            return Err(Error::NotFound(format!("database directory {}", dir.display())));
        }

        let tables = Arc::new(TableCache::new(
            Arc::clone(&env),
            dir.clone(),
            Arc::clone(&cmp),
            options.num_tbl_cache,
        ));
        let manifest = Manifest::open(
            Arc::clone(&env),
            &dir,
            Arc::clone(&cmp),
            Arc::clone(&tables),
            options.create_if_missing,
        )?;

        remove_orphan_tables(env.as_ref(), &dir, &manifest)?;
        let replayed = replay_logs(env.as_ref(), meter.as_ref(), &dir, &cmp, manifest.log_number())?;

        let (log_number, _) = manifest.create_file()?;
        let file = env.new_writable_file(&dir.join(log_file_name(log_number)))?;
        let writer = SkiplistWriter::new(Arc::clone(&cmp));

        tracing::info!(
            dir = %dir.display(),
            log_number,
            replayed = replayed.skiplist().len(),
            manifest = manifest.manifest_number(),
            "opened database"
        );

        let inner = Arc::new(DbInner {
            dir,
            options,
            cmp,
            env,
            meter,
            manifest,
            tables,
            mem: RwLock::new(MemState {
                active: Arc::clone(writer.skiplist()),
                retired: Some(Retired {
                    mem: Arc::clone(replayed.skiplist()),
                    next_log: log_number,
                }),
            }),
            writer: Mutex::new(WriteState {
                mem: writer,
                log: LogWriter::new(file),
                log_number,
            }),
        });

        let round = Arc::clone(&inner);
        tokio::task::spawn_blocking(move || run_round(&round))
            .await
            .map_err(|e| Error::Internal(format!("recovery round panicked: {}", e)))??;

        let compactor = Compactor::spawn(Arc::clone(&inner));
        Ok(Self { inner, compactor })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&batch)
    }

    /// Applies `batch` atomically: it is one WAL record.
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let record = batch.encode();

        let (log_full, mem_bytes) = {
            let mut w = self.inner.writer.lock();
            w.log.append(&record)?;
            if self.inner.options.sync_writes {
                w.log.sync()?;
            } else {
                w.log.flush()?;
            }
            apply_batch(&mut w.mem, batch);
            (
                w.log.bytes_written() >= self.inner.options.min_log_size,
                w.mem.skiplist().approximate_bytes(),
            )
        };

        obs_count!(self.inner.meter, "lsm_writes", &[], batch.len());
        obs_gauge!(self.inner.meter, "lsm_memtable_bytes", &[], mem_bytes);
        if log_full {
            self.compactor.trigger();
        }
        Ok(())
    }

    /// Latest value of `key`, or `None` if it is absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (active, retired) = self.memtables();
        for mem in std::iter::once(active).chain(retired) {
            if let Some(stored) = mem.get(key) {
                return Ok(untag(&stored)?.map(<[u8]>::to_vec));
            }
        }

        let snapshot = self.inner.manifest.acquire_current();
        for files in snapshot.levels() {
            let idx = files.partition_point(|f| self.inner.cmp.compare(&f.end_key, key) == Ordering::Less);
            let Some(file) = files.get(idx) else {
                continue;
            };
            if self.inner.cmp.compare(&file.begin_key, key) == Ordering::Greater {
                continue;
            }
            let table = self.inner.tables.get(file.id, &file.location)?;
            if let Some(stored) = table.get(key) {
                return Ok(untag(&stored)?.map(<[u8]>::to_vec));
            }
        }
        Ok(None)
    }

    /// Iterator over the live keys as of now. Later writes and compactions
    /// do not affect it: the memtables are read at the sequence number they
    /// had when it was created, and the tables it reads stay on disk until it
    /// is dropped.
    pub fn iter(&self) -> Result<DbIterator> {
        let mut children: Vec<Box<dyn KvIterator>> = Vec::new();
        {
            let mem = self.inner.mem.read();
            children.push(Box::new(mem.active.iter()));
            if let Some(retired) = &mem.retired {
                children.push(Box::new(retired.mem.iter()));
            }
        }
        let snapshot = self.inner.manifest.acquire_current();

        for files in snapshot.levels() {
            let mut tables: Vec<Box<dyn KvIterator>> = Vec::with_capacity(files.len());
            for f in files {
                tables.push(Box::new(self.inner.tables.get(f.id, &f.location)?.iter()));
            }
            match tables.len() {
                0 => {}
                1 => children.extend(tables),
                _ => children.push(Box::new(ConcatenationIterator::new(tables))),
            }
        }

        Ok(DbIterator {
            inner: HeapIterator::new(children, Arc::clone(&self.inner.cmp)),
            _snapshot: snapshot,
        })
    }

    /// Runs a compaction round now and waits for it.
    pub async fn flush(&self) -> Result<()> {
        self.compactor.run_now().await
    }

    /// Drains the compactor and syncs the WAL.
    pub async fn close(mut self) -> Result<()> {
        self.compactor.shutdown().await;
        self.inner.writer.lock().log.sync()?;
        tracing::info!(dir = %self.inner.dir.display(), "closed database");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.inner.cmp
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    /// File ids of the current snapshot, L0 slots first.
    pub fn current_levels(&self) -> Vec<Vec<FileId>> {
        self.inner.manifest.current_levels()
    }

    /// Number of the WAL currently receiving writes.
    pub fn log_number(&self) -> u64 {
        self.inner.writer.lock().log_number
    }

    fn memtables(&self) -> (Arc<Skiplist>, Option<Arc<Skiplist>>) {
        let mem = self.inner.mem.read();
        (
            Arc::clone(&mem.active),
            mem.retired.as_ref().map(|r| Arc::clone(&r.mem)),
        )
    }
}

/// Iterator returned by [`Db::iter`]. Deleted keys are skipped and values
/// are returned without their tag.
pub struct DbIterator {
    inner: HeapIterator,
    _snapshot: SnapshotHandle,
}

impl DbIterator {
    fn skip_deleted_forward(&mut self) {
        while self.inner.valid() && is_deletion(self.inner.value()) {
            self.inner.next();
        }
    }

    fn skip_deleted_backward(&mut self) {
        while self.inner.valid() && is_deletion(self.inner.value()) {
            self.inner.prev();
        }
    }
}

impl KvIterator for DbIterator {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
        self.skip_deleted_forward();
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
        self.skip_deleted_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
        self.skip_deleted_forward();
    }

    fn next(&mut self) {
        self.inner.next();
        self.skip_deleted_forward();
    }

    fn prev(&mut self) {
        self.inner.prev();
        self.skip_deleted_backward();
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value().get(1..).unwrap_or(&[])
    }
}

/// Inserts every op of `batch` under a single skiplist sequence number.
fn apply_batch(mem: &mut SkiplistWriter, batch: &WriteBatch) {
    let stored: Vec<(&[u8], Vec<u8>)> = batch
        .ops()
        .iter()
        .map(|op| (op.key(), op.stored_value()))
        .collect();
    mem.apply(stored.iter().map(|(key, value)| (*key, value.as_slice())));
}

/// Deletes table files the manifest does not reference, left behind by a
/// round that crashed before committing.
fn remove_orphan_tables(env: &dyn Env, dir: &Path, manifest: &Manifest) -> Result<()> {
    let known = manifest.file_ids();
    for name in env.list_dir(dir)? {
        let Some(FileKind::Table(id)) = parse_file_name(&name) else {
            continue;
        };
        if known.binary_search(&id).is_err() {
            tracing::warn!(file_id = id, "removing orphan table");
            env.remove_file(&dir.join(&name))?;
        }
    }
    Ok(())
}

/// Replays every WAL numbered `>= first` in ascending order.
fn replay_logs(
    env: &dyn Env,
    meter: &dyn Meter,
    dir: &Path,
    cmp: &Arc<dyn Comparator>,
    first: u64,
) -> Result<SkiplistWriter> {
    let mut logs: Vec<u64> = env
        .list_dir(dir)?
        .iter()
        .filter_map(|name| match parse_file_name(name) {
            Some(FileKind::Log(n)) if n >= first => Some(n),
            _ => None,
        })
        .collect();
    logs.sort_unstable();

    let mut mem = SkiplistWriter::new(Arc::clone(cmp));
    for number in logs {
        let data = env.read_all(&dir.join(log_file_name(number)))?;
        let recovered = LogReader::new(data.as_slice()).recover()?;
        if recovered.truncated {
            tracing::warn!(log = number, records = recovered.records.len(), "WAL tail corrupt, truncated");
            meter.emit(TernEvent::Wal(WalEvt {
                log: number,
                kind: WalKind::CorruptionTruncated,
            }));
        }
        for record in &recovered.records {
            apply_batch(&mut mem, &WriteBatch::decode(record)?);
        }
        tracing::debug!(log = number, records = recovered.records.len(), "replayed WAL");
        meter.emit(TernEvent::Wal(WalEvt {
            log: number,
            kind: WalKind::Replayed {
                records: recovered.records.len() as u64,
            },
        }));
    }
    Ok(mem)
}
