//! Engine end-to-end tests.
//!
//! Covers the write path, WAL replay, L0 flush, merge compaction, tombstones,
//! snapshot isolation of iterators and the failure policy of a round.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tern_core::{DiskEnv, Env, WritableFile};
use tern_lsm::{Db, KvIterator, NoopMeter, Options};
use tern_observe::{CaptureMeter, CompKind, TernEvent, WalKind};
use tern_sstable::{bytewise, collect_forward};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn open(dir: &Path, options: Options) -> Db {
    Db::open(dir, options, bytewise(), Arc::new(DiskEnv), Arc::new(NoopMeter))
        .await
        .unwrap()
}

fn keys(db: &Db) -> Vec<String> {
    let mut it = db.iter().unwrap();
    collect_forward(&mut it)
        .into_iter()
        .map(|(k, _)| String::from_utf8(k).unwrap())
        .collect()
}

fn small_tables() -> Options {
    Options {
        min_log_size: 64,
        min_table_size: 128,
        max_l0_levels: 4,
        ..Options::default()
    }
}

// ============================================================================
// Compaction
// ============================================================================

#[tokio::test]
async fn test_l0_compaction_trigger() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = Options {
        min_log_size: 64,
        min_table_size: 4 * 1024 * 1024,
        max_l0_levels: 4,
        ..Options::default()
    };
    let db = open(dir.path(), options).await;

    db.put(b"hello", b"world").unwrap();
    for key in ["1000", "1001"] {
        db.put(key.as_bytes(), &[b'v'; 64]).unwrap();
    }
    db.flush().await.unwrap();

    assert_eq!(keys(&db), vec!["1000", "1001", "hello"]);
    assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
    assert!(db.current_levels().iter().take(4).any(|level| !level.is_empty()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_merge_compaction_keeps_every_key() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_tables()).await;

    for i in 1000..1100 {
        db.put(i.to_string().as_bytes(), &[b'v'; 64]).unwrap();
    }
    db.flush().await.unwrap();

    let expected: Vec<String> = (1000..1100).map(|i| i.to_string()).collect();
    assert_eq!(keys(&db), expected);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_full_l0_merges_into_sorted_levels() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut options = small_tables();
    options.min_log_size = 1 << 20;
    let db = open(dir.path(), options).await;

    for round in 0..6 {
        for i in 0..10 {
            let key = format!("k{:03}", i * 6 + round);
            db.put(key.as_bytes(), &[b'v'; 64]).unwrap();
        }
        db.flush().await.unwrap();
    }

    let levels = db.current_levels();
    assert!(levels.len() > 4, "no sorted level after six rounds: {:?}", levels);
    assert!(levels[4..].iter().any(|level| !level.is_empty()));
    assert!(levels[..4].iter().all(|slot| slot.len() <= 1));

    // Sorted levels hold disjoint, ascending key ranges.
    let manifest = db.manifest();
    for level in &levels[4..] {
        for pair in level.windows(2) {
            let left = manifest.file_info(pair[0]).unwrap();
            let right = manifest.file_info(pair[1]).unwrap();
            assert!(left.end_key < right.begin_key);
        }
    }

    let expected: Vec<String> = (0..60).map(|i| format!("k{:03}", i)).collect();
    assert_eq!(keys(&db), expected);
    for key in &expected {
        assert_eq!(db.get(key.as_bytes()).unwrap(), Some(vec![b'v'; 64]));
    }

    db.close().await.unwrap();
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn test_tombstones_survive_flush_and_merge() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut options = small_tables();
    options.min_log_size = 1 << 20;
    let db = open(dir.path(), options).await;

    for key in ["a", "b", "c"] {
        db.put(key.as_bytes(), b"1").unwrap();
    }
    db.flush().await.unwrap();

    db.delete(b"b").unwrap();
    assert_eq!(db.get(b"b").unwrap(), None);
    assert_eq!(keys(&db), vec!["a", "c"]);

    // Enough rounds to push everything through a merge.
    for i in 0..5 {
        db.put(format!("z{}", i).as_bytes(), b"1").unwrap();
        db.flush().await.unwrap();
        assert_eq!(db.get(b"b").unwrap(), None);
    }
    assert_eq!(keys(&db), vec!["a", "c", "z0", "z1", "z2", "z3", "z4"]);

    db.put(b"b", b"2").unwrap();
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_iterator_hides_deletes_in_both_directions() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), Options::default()).await;

    for key in ["a", "b", "c", "d"] {
        db.put(key.as_bytes(), key.as_bytes()).unwrap();
    }
    db.delete(b"a").unwrap();
    db.delete(b"c").unwrap();

    let mut it = db.iter().unwrap();
    it.seek_to_last();
    assert_eq!((it.key(), it.value()), (&b"d"[..], &b"d"[..]));
    it.prev();
    assert_eq!(it.key(), b"b");
    it.prev();
    assert!(!it.valid());

    it.seek(b"a");
    assert_eq!(it.key(), b"b");

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_write_batch_is_applied_together() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), Options::default()).await;

    db.put(b"gone", b"x").unwrap();
    let mut batch = tern_lsm::WriteBatch::new();
    batch.put("one", "1").put("two", "2").delete("gone");
    db.write(&batch).unwrap();

    assert_eq!(keys(&db), vec!["one", "two"]);
    db.close().await.unwrap();
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_iterator_is_isolated_from_later_compactions() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut options = small_tables();
    options.min_log_size = 1 << 20;
    let db = open(dir.path(), options).await;

    for i in 0..20 {
        db.put(format!("k{:02}", i).as_bytes(), b"old").unwrap();
    }
    db.flush().await.unwrap();

    let mut it = db.iter().unwrap();

    for i in 0..20 {
        db.delete(format!("k{:02}", i).as_bytes()).unwrap();
        if i % 4 == 0 {
            db.flush().await.unwrap();
        }
    }
    db.flush().await.unwrap();
    assert!(keys(&db).is_empty());

    let seen = collect_forward(&mut it);
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|(_, v)| v == b"old"));

    drop(it);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_iterator_ignores_writes_to_active_skiplist() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), Options::default()).await;

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    let mut it = db.iter().unwrap();

    db.put(b"a", b"overwritten").unwrap();
    db.delete(b"b").unwrap();
    let mut batch = tern_lsm::WriteBatch::new();
    batch.put("c", "3").put("d", "4");
    db.write(&batch).unwrap();

    let seen = collect_forward(&mut it);
    assert_eq!(
        seen,
        vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
    );
    assert_eq!(keys(&db), vec!["a", "c", "d"]);
    assert_eq!(db.get(b"a").unwrap().as_deref(), Some(&b"overwritten"[..]));

    drop(it);
    db.close().await.unwrap();
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_reopen_replays_wal() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let db = open(dir.path(), Options::default()).await;
    db.put(b"k1", b"v1").unwrap();
    db.put(b"k2", b"v2").unwrap();
    db.delete(b"k1").unwrap();
    db.close().await.unwrap();

    let meter = Arc::new(CaptureMeter::new());
    let db = Db::open(
        dir.path(),
        Options::default(),
        bytewise(),
        Arc::new(DiskEnv),
        meter.clone(),
    )
    .await
    .unwrap();

    assert_eq!(db.get(b"k1").unwrap(), None);
    assert_eq!(db.get(b"k2").unwrap(), Some(b"v2".to_vec()));

    let replayed: u64 = meter
        .events()
        .iter()
        .filter_map(|e| match e {
            TernEvent::Wal(w) => match w.kind {
                WalKind::Replayed { records } => Some(records),
                _ => None,
            },
            _ => None,
        })
        .sum();
    assert_eq!(replayed, 3);

    // Replayed data was persisted at open; the old WAL is gone.
    assert!(db.current_levels().iter().any(|level| !level.is_empty()));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_after_compaction() {
    let dir = TempDir::new().unwrap();
    let mut options = small_tables();
    options.min_log_size = 1 << 20;

    let db = open(dir.path(), options.clone()).await;
    for round in 0..6 {
        for i in 0..5 {
            db.put(format!("r{}k{}", round, i).as_bytes(), b"value").unwrap();
        }
        db.flush().await.unwrap();
    }
    let before = keys(&db);
    let levels = db.current_levels();
    db.close().await.unwrap();

    let db = open(dir.path(), options).await;
    assert_eq!(keys(&db), before);
    assert_eq!(db.current_levels(), levels);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_open_missing_dir_without_create() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        create_if_missing: false,
        ..Options::default()
    };
    let result = Db::open(
        dir.path().join("absent"),
        options,
        bytewise(),
        Arc::new(DiskEnv),
        Arc::new(NoopMeter),
    )
    .await;
    assert!(matches!(result, Err(tern_lsm::Error::NotFound(_))));
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        max_l0_levels: 0,
        ..Options::default()
    };
    let result = Db::open(dir.path(), options, bytewise(), Arc::new(DiskEnv), Arc::new(NoopMeter)).await;
    assert!(matches!(result, Err(tern_lsm::Error::Config(_))));
}

// ============================================================================
// Failure policy
// ============================================================================

/// Disk env whose table creation can be switched off.
struct FaultyEnv {
    disk: DiskEnv,
    fail_tables: AtomicBool,
}

impl FaultyEnv {
    fn is_table(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("sst."))
    }
}

impl Env for FaultyEnv {
    fn new_writable_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        if self.fail_tables.load(Ordering::SeqCst) && Self::is_table(path) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected table write failure"));
        }
        self.disk.new_writable_file(path)
    }

    fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.disk.read_all(path)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        self.disk.list_dir(dir)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.disk.remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.disk.rename(from, to)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        self.disk.create_dir_all(dir)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.disk.file_exists(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.disk.file_size(path)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        self.disk.sync_dir(dir)
    }
}

#[tokio::test]
async fn test_failed_round_leaves_manifest_unchanged() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let env = Arc::new(FaultyEnv {
        disk: DiskEnv,
        fail_tables: AtomicBool::new(false),
    });
    let meter = Arc::new(CaptureMeter::new());
    let db = Db::open(dir.path(), Options::default(), bytewise(), env.clone(), meter.clone())
        .await
        .unwrap();

    db.put(b"a", b"1").unwrap();
    db.flush().await.unwrap();
    let levels = db.current_levels();
    let snapshot = db.manifest().current_snapshot();

    env.fail_tables.store(true, Ordering::SeqCst);
    db.put(b"b", b"2").unwrap();
    assert!(db.flush().await.is_err());

    assert_eq!(db.current_levels(), levels);
    assert_eq!(db.manifest().current_snapshot(), snapshot);
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(keys(&db), vec!["a", "b"]);
    assert!(meter.events().iter().any(|e| matches!(
        e,
        TernEvent::Compaction(c) if c.kind == CompKind::Failed
    )));

    // The next round retries the same skiplist.
    env.fail_tables.store(false, Ordering::SeqCst);
    db.flush().await.unwrap();
    let occupied = db.current_levels().iter().filter(|l| !l.is_empty()).count();
    assert_eq!(occupied, 2);
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));

    db.close().await.unwrap();
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_writes_and_rounds_publish_gauges() {
    let dir = TempDir::new().unwrap();
    let meter = Arc::new(CaptureMeter::new());
    let db = Db::open(
        dir.path(),
        Options::default(),
        bytewise(),
        Arc::new(DiskEnv),
        meter.clone(),
    )
    .await
    .unwrap();

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    assert_eq!(meter.counter_total("lsm_writes"), 2);
    assert!(meter.gauge_value("lsm_memtable_bytes").unwrap() > 0);

    let rounds = meter.samples("lsm_compaction_ms").len();
    db.flush().await.unwrap();
    assert_eq!(meter.samples("lsm_compaction_ms").len(), rounds + 1);
    assert_eq!(meter.gauge_value("lsm_l0_levels"), Some(1));
    assert_eq!(meter.gauge_value("lsm_table_files"), Some(1));

    db.close().await.unwrap();
}
