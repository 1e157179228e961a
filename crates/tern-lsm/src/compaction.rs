//! Background compaction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Compactor (one tokio task, bounded trigger channel)      │
//! │  - writers trigger when the WAL passes min_log_size       │
//! │  - Db::flush() sends a request and awaits the round       │
//! └──────────────┬───────────────────────────────────────────┘
//!                │ spawn_blocking(run_round)
//!                ↓
//! ┌──────────────────────────────────────────────────────────┐
//! │  Round                                                    │
//! │  1. rotate: active skiplist + WAL become "retired"        │
//! │  2. L0 flush    (a free L0 slot exists)                   │
//! │     or merge    (retired + all L0 + overlap of Ln)        │
//! │  3. NewLog, delete older WAL files, ResetLog              │
//! │  4. Ln merges while a sorted level is over budget         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed round leaves the manifest untouched. The retired skiplist stays
//! readable and the next round picks it up again.

use crate::batch::is_deletion;
use crate::db::{DbInner, Retired};
use crate::error::{Error, Result};
use crate::manifest::{FileId, LiveFile, NewFile, NewSnapshotRequest, SnapshotHandle};
use crate::merge::{ConcatenationIterator, HeapIterator};
use crate::skiplist::{Skiplist, SkiplistWriter};
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;
use tern_core::filename::{log_file_name, parse_file_name, FileKind};
use tern_observe::{obs_count, obs_gauge, obs_timed, CompEvt, CompKind, TernEvent, WalEvt, WalKind};
use tern_sstable::{Comparator, KvIterator, TableBuilder};
use tern_wal::LogWriter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Upper bound on Ln merges run back to back in one round.
const MAX_LEVEL_MERGES_PER_ROUND: usize = 16;

/// Per-entry overhead of the table format on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 24;

/// Per-leaf overhead (tailer plus index entry), one leaf per 128 entries.
const LEAF_OVERHEAD: usize = 32;

struct CompactionRequest {
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Handle to the background compaction task.
pub(crate) struct Compactor {
    tx: Option<mpsc::Sender<CompactionRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn spawn(inner: Arc<DbInner>) -> Self {
        // One queued request is enough: a round always drains everything
        // written before it started.
        let (tx, mut rx) = mpsc::channel::<CompactionRequest>(1);

        let handle = tokio::spawn(async move {
            tracing::debug!("compaction loop started");
            while let Some(req) = rx.recv().await {
                let round = Arc::clone(&inner);
                let result = match tokio::task::spawn_blocking(move || run_round(&round)).await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Internal(format!("compaction task panicked: {}", e))),
                };
                if let Some(done) = req.done {
                    let _ = done.send(result);
                }
            }
            tracing::debug!("compaction loop stopped");
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Requests a round without waiting. Coalesces with a queued request.
    pub(crate) fn trigger(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(CompactionRequest { done: None }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("compaction trigger after shutdown");
            }
        }
    }

    /// Runs a round and waits for its outcome.
    pub(crate) async fn run_now(&self) -> Result<()> {
        let tx = self.tx.clone().ok_or(Error::Closed)?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(CompactionRequest { done: Some(done_tx) })
            .await
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)?
    }

    /// Closes the trigger channel and waits for the queued rounds to finish.
    pub(crate) async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "compaction loop panicked");
            }
        }
    }
}

/// One full compaction round. Blocking; runs off the async runtime.
pub(crate) fn run_round(inner: &DbInner) -> Result<()> {
    let result = obs_timed!(inner.meter, "lsm_compaction_ms", &[], { round(inner) });
    if result.is_ok() {
        publish_shape(inner);
    }
    if let Err(e) = &result {
        tracing::error!(error = %e, "compaction round failed");
        obs_count!(inner.meter, "lsm_compaction_failures", &[], 1);
        inner.meter.emit(TernEvent::Compaction(CompEvt {
            level: 0,
            kind: CompKind::Failed,
        }));
    }
    result
}

/// Gauges describing the current snapshot.
fn publish_shape(inner: &DbInner) {
    let levels = inner.manifest.current_levels();
    let occupied = levels
        .iter()
        .take(inner.options.max_l0_levels)
        .filter(|level| !level.is_empty())
        .count();
    let files: usize = levels.iter().map(Vec::len).sum();
    obs_gauge!(inner.meter, "lsm_l0_levels", &[], occupied);
    obs_gauge!(inner.meter, "lsm_table_files", &[], files);
}

fn round(inner: &DbInner) -> Result<()> {
    let Some(retired) = rotate(inner)? else {
        return compact_levels(inner);
    };

    if !retired.mem.is_empty() {
        let snapshot = inner.manifest.acquire_current();
        let max_l0 = inner.options.max_l0_levels;
        let occupied = snapshot
            .levels()
            .iter()
            .take(max_l0)
            .filter(|level| !level.is_empty())
            .count();

        let req = if occupied < max_l0 {
            flush_to_l0(inner, &retired.mem, &snapshot)?
        } else {
            merge_l0(inner, &retired.mem, &snapshot)?
        };
        inner.manifest.new_snapshot(req)?;
    }

    inner.manifest.new_log(retired.next_log)?;
    inner.mem.write().retired = None;
    retire_logs(inner, retired.next_log)?;

    compact_levels(inner)
}

/// Swaps in a fresh skiplist and WAL. Returns what the round must persist:
/// a retired skiplist left by a failed round, or the one just rotated out.
fn rotate(inner: &DbInner) -> Result<Option<Retired>> {
    let mut writer = inner.writer.lock();
    if let Some(retired) = inner.mem.read().retired.clone() {
        return Ok(Some(retired));
    }
    if writer.mem.skiplist().is_empty() {
        return Ok(None);
    }

    let (number, _) = inner.manifest.create_file()?;
    let file = inner
        .env
        .new_writable_file(&inner.dir.join(log_file_name(number)))?;
    writer.log.sync()?;

    let old_bytes = writer.log.bytes_written();
    let old_number = std::mem::replace(&mut writer.log_number, number);
    writer.log = LogWriter::new(file);

    let fresh = SkiplistWriter::new(Arc::clone(&inner.cmp));
    let active = Arc::clone(fresh.skiplist());
    let old = std::mem::replace(&mut writer.mem, fresh);
    let retired = Retired {
        mem: Arc::clone(old.skiplist()),
        next_log: number,
    };

    {
        let mut mem = inner.mem.write();
        mem.active = active;
        mem.retired = Some(retired.clone());
    }

    tracing::debug!(old_log = old_number, new_log = number, bytes = old_bytes, "rotated WAL");
    inner.meter.emit(TernEvent::Wal(WalEvt {
        log: old_number,
        kind: WalKind::Rotated { bytes: old_bytes },
    }));
    Ok(Some(retired))
}

/// Writes the retired skiplist as the new L0[0]; older L0 levels shift down.
fn flush_to_l0(
    inner: &DbInner,
    mem: &Arc<Skiplist>,
    snapshot: &SnapshotHandle,
) -> Result<NewSnapshotRequest> {
    let max_l0 = inner.options.max_l0_levels;
    let mut builder = TableBuilder::new(mem.approximate_bytes() + 4096);
    let mut it = mem.iter();
    it.seek_to_first();
    while it.valid() {
        builder.add(it.key(), it.value())?;
        it.next();
    }
    let file = finish_table(inner, builder)?;

    let levels = level_ids(snapshot.levels());
    let mut l0: Vec<Vec<FileId>> = vec![vec![file.id]];
    l0.extend(
        levels
            .iter()
            .take(max_l0)
            .filter(|level| !level.is_empty())
            .cloned(),
    );
    l0.resize(max_l0, Vec::new());
    l0.extend(levels.into_iter().skip(max_l0));

    tracing::info!(file_id = file.id, level = 0, bytes = file.size, "flushed skiplist to L0");
    obs_count!(inner.meter, "lsm_l0_flushes", &[], 1);
    inner.meter.emit(TernEvent::Compaction(CompEvt {
        level: 0,
        kind: CompKind::L0Flush {
            file_id: file.id,
            bytes: file.size,
        },
    }));

    Ok(NewSnapshotRequest {
        levels: l0,
        files: vec![file],
    })
}

/// Merges the retired skiplist, every L0 table and the overlapping slice of
/// the first sorted level into that level.
fn merge_l0(
    inner: &DbInner,
    mem: &Arc<Skiplist>,
    snapshot: &SnapshotHandle,
) -> Result<NewSnapshotRequest> {
    let max_l0 = inner.options.max_l0_levels;
    let cmp = &inner.cmp;
    let levels = snapshot.levels();
    let l0_files: Vec<&LiveFile> = levels.iter().take(max_l0).flatten().collect();

    let mut it = mem.iter();
    it.seek_to_first();
    let mut lo = it.key().to_vec();
    it.seek_to_last();
    let mut hi = it.key().to_vec();
    for f in &l0_files {
        if cmp.compare(&f.begin_key, &lo) == Ordering::Less {
            lo = f.begin_key.clone();
        }
        if cmp.compare(&f.end_key, &hi) == Ordering::Greater {
            hi = f.end_key.clone();
        }
    }

    let target: &[LiveFile] = levels.get(max_l0).map(Vec::as_slice).unwrap_or(&[]);
    let (start, end) = overlap_range(cmp.as_ref(), target, &lo, &hi);

    let mut children: Vec<Box<dyn KvIterator>> = vec![Box::new(mem.iter())];
    for f in &l0_files {
        children.push(Box::new(inner.tables.get(f.id, &f.location)?.iter()));
    }
    if start < end {
        children.push(Box::new(concat(inner, &target[start..end])?));
    }

    let drop_tombstones = levels.iter().skip(max_l0 + 1).all(|l| l.is_empty());
    let outputs = merge_into_tables(inner, HeapIterator::new(children, Arc::clone(cmp)), drop_tombstones)?;

    let mut new_levels: Vec<Vec<FileId>> = vec![Vec::new(); max_l0];
    let mut sorted: Vec<FileId> = target[..start].iter().map(|f| f.id).collect();
    sorted.extend(outputs.iter().map(|f| f.id));
    sorted.extend(target[end..].iter().map(|f| f.id));
    new_levels.push(sorted);
    new_levels.extend(level_ids(levels).into_iter().skip(max_l0 + 1));

    let in_files = l0_files.len() + (end - start);
    let out_bytes: u64 = outputs.iter().map(|f| f.size).sum();
    tracing::info!(
        level = max_l0,
        in_files,
        out_files = outputs.len(),
        out_bytes,
        dropped_tombstones = drop_tombstones,
        "merged L0 into first sorted level"
    );
    inner.meter.emit(TernEvent::Compaction(CompEvt {
        level: max_l0 as u32,
        kind: CompKind::Merge {
            in_files,
            out_files: outputs.len(),
            out_bytes,
        },
    }));

    Ok(NewSnapshotRequest {
        levels: new_levels,
        files: outputs,
    })
}

/// Pushes data down while a sorted level is over its byte budget.
fn compact_levels(inner: &DbInner) -> Result<()> {
    for _ in 0..MAX_LEVEL_MERGES_PER_ROUND {
        let snapshot = inner.manifest.acquire_current();
        let over = (inner.options.max_l0_levels..snapshot.levels().len()).find(|&n| {
            let bytes: u64 = snapshot.levels()[n].iter().map(|f| f.size).sum();
            bytes > inner.options.level_budget(n)
        });
        let Some(level) = over else {
            return Ok(());
        };
        let req = merge_level(inner, &snapshot, level)?;
        inner.manifest.new_snapshot(req)?;
    }
    Ok(())
}

/// Merges one random file of `level` with its overlap in `level + 1`.
fn merge_level(inner: &DbInner, snapshot: &SnapshotHandle, level: usize) -> Result<NewSnapshotRequest> {
    let levels = snapshot.levels();
    let files = &levels[level];
    let pick = rand::thread_rng().gen_range(0..files.len());
    let picked = &files[pick];

    let next: &[LiveFile] = levels.get(level + 1).map(Vec::as_slice).unwrap_or(&[]);
    let (start, end) = overlap_range(inner.cmp.as_ref(), next, &picked.begin_key, &picked.end_key);

    let mut children: Vec<Box<dyn KvIterator>> =
        vec![Box::new(inner.tables.get(picked.id, &picked.location)?.iter())];
    if start < end {
        children.push(Box::new(concat(inner, &next[start..end])?));
    }

    let drop_tombstones = levels.iter().skip(level + 2).all(|l| l.is_empty());
    let outputs = merge_into_tables(
        inner,
        HeapIterator::new(children, Arc::clone(&inner.cmp)),
        drop_tombstones,
    )?;

    let mut new_levels = level_ids(levels);
    new_levels[level].remove(pick);
    if new_levels.len() == level + 1 {
        new_levels.push(Vec::new());
    }
    let mut merged: Vec<FileId> = next[..start].iter().map(|f| f.id).collect();
    merged.extend(outputs.iter().map(|f| f.id));
    merged.extend(next[end..].iter().map(|f| f.id));
    new_levels[level + 1] = merged;

    let in_files = 1 + (end - start);
    let out_bytes: u64 = outputs.iter().map(|f| f.size).sum();
    tracing::info!(
        from_level = level,
        file_id = picked.id,
        in_files,
        out_files = outputs.len(),
        out_bytes,
        "merged file into next level"
    );
    inner.meter.emit(TernEvent::Compaction(CompEvt {
        level: (level + 1) as u32,
        kind: CompKind::LevelMerge {
            in_files,
            out_files: outputs.len(),
            out_bytes,
        },
    }));

    Ok(NewSnapshotRequest {
        levels: new_levels,
        files: outputs,
    })
}

/// Deletes WAL files older than `live` and records every retired log that
/// is gone.
fn retire_logs(inner: &DbInner, live: u64) -> Result<()> {
    for name in inner.env.list_dir(&inner.dir)? {
        let Some(FileKind::Log(number)) = parse_file_name(&name) else {
            continue;
        };
        if number >= live {
            continue;
        }
        match inner.env.remove_file(&inner.dir.join(&name)) {
            Ok(()) => {
                tracing::debug!(log = number, "deleted WAL");
                inner.meter.emit(TernEvent::Wal(WalEvt {
                    log: number,
                    kind: WalKind::Deleted,
                }));
            }
            Err(e) => tracing::warn!(log = number, error = %e, "failed to delete WAL"),
        }
    }

    for name in inner.manifest.retired_logs() {
        if !inner.env.file_exists(&inner.dir.join(&name)) {
            inner.manifest.reset_log(&name)?;
        }
    }
    Ok(())
}

/// `[start, end)` of the files in a sorted level that intersect `[lo, hi]`.
fn overlap_range(cmp: &dyn Comparator, files: &[LiveFile], lo: &[u8], hi: &[u8]) -> (usize, usize) {
    let start = files.partition_point(|f| cmp.compare(&f.end_key, lo) == Ordering::Less);
    let end = files.partition_point(|f| cmp.compare(&f.begin_key, hi) != Ordering::Greater);
    (start, end.max(start))
}

fn concat(inner: &DbInner, files: &[LiveFile]) -> Result<ConcatenationIterator> {
    let mut children: Vec<Box<dyn KvIterator>> = Vec::with_capacity(files.len());
    for f in files {
        children.push(Box::new(inner.tables.get(f.id, &f.location)?.iter()));
    }
    Ok(ConcatenationIterator::new(children))
}

fn level_ids(levels: &[Vec<LiveFile>]) -> Vec<Vec<FileId>> {
    levels
        .iter()
        .map(|level| level.iter().map(|f| f.id).collect())
        .collect()
}

fn merge_into_tables(inner: &DbInner, mut it: HeapIterator, drop_tombstones: bool) -> Result<Vec<NewFile>> {
    let mut sink = OutputSink::new(inner);
    it.seek_to_first();
    while it.valid() {
        if !(drop_tombstones && is_deletion(it.value())) {
            sink.add(it.key(), it.value())?;
        }
        it.next();
    }
    sink.finish()
}

/// Splits a sorted stream into tables of `[min_table_size, 2 * min_table_size)`
/// bytes. A chunk is held back until the next one fills, so a short tail is
/// folded into its predecessor.
struct OutputSink<'a> {
    inner: &'a DbInner,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    current: Vec<(Vec<u8>, Vec<u8>)>,
    current_bytes: usize,
    outputs: Vec<NewFile>,
}

impl<'a> OutputSink<'a> {
    fn new(inner: &'a DbInner) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            current: Vec::new(),
            current_bytes: 0,
            outputs: Vec::new(),
        }
    }

    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.current.push((key.to_vec(), value.to_vec()));
        self.current_bytes += key.len() + value.len();
        if self.current_bytes >= self.inner.options.min_table_size {
            if !self.pending.is_empty() {
                let chunk = std::mem::take(&mut self.pending);
                self.write(chunk)?;
            }
            self.pending = std::mem::take(&mut self.current);
            self.current_bytes = 0;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<NewFile>> {
        let mut last = std::mem::take(&mut self.pending);
        last.append(&mut self.current);
        if !last.is_empty() {
            self.write(last)?;
        }
        Ok(self.outputs)
    }

    fn write(&mut self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let raw: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        let hint = raw + entries.len() * ENTRY_OVERHEAD + (entries.len() / 128 + 1) * LEAF_OVERHEAD + 4096;
        let mut builder = TableBuilder::new(hint);
        for (key, value) in &entries {
            builder.add(key, value)?;
        }
        let file = finish_table(self.inner, builder)?;
        self.outputs.push(file);
        Ok(())
    }
}

/// Allocates a file number and writes `builder` to it. On failure the
/// partial file is removed and nothing is recorded beyond the number.
fn finish_table(inner: &DbInner, builder: TableBuilder) -> Result<NewFile> {
    let begin_key = builder.first_key().map(<[u8]>::to_vec).unwrap_or_default();
    let end_key = builder.last_key().map(<[u8]>::to_vec).unwrap_or_default();
    let (id, location) = inner.manifest.create_file()?;
    let path = inner.dir.join(&location);

    let written = (|| -> Result<Arc<tern_sstable::Table>> {
        let mut file = inner.env.new_writable_file(&path)?;
        let table = builder.finalize_to(&mut file, Arc::clone(&inner.cmp))?;
        file.sync()?;
        Ok(Arc::new(table))
    })();

    match written {
        Ok(table) => {
            let size = table.size() as u64;
            inner.tables.insert(id, table);
            tracing::debug!(file_id = id, bytes = size, "wrote table");
            Ok(NewFile {
                id,
                location,
                begin_key,
                end_key,
                size,
            })
        }
        Err(e) => {
            let _ = inner.env.remove_file(&path);
            Err(e)
        }
    }
}
