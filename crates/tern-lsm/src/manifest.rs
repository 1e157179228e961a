//! Manifest: the durable map from levels to table files.
//!
//! # File format
//!
//! ```text
//! manifest.0000000042
//! ┌──────────────────────┬─────────────────────────┬──────────────────────────┐
//! │ snapshotLen: i32 LE  │ ManifestData (JSON)     │ record log of edits      │
//! └──────────────────────┴─────────────────────────┴──────────────────────────┘
//!                                                     each record: kind:u8 | JSON body
//! ```
//!
//! The prefix is the full state at the time the file was created; every later
//! change is appended as an edit and replayed on recovery. Both parts are
//! self-describing JSON so fields can be added without versioning.
//!
//! # Reference counting
//!
//! A snapshot owns one reference on each file it lists. The current snapshot
//! holds one reference on itself that moves to its successor; `MakeSnapshot`
//! adds a durable pin. Readers take session references through
//! [`SnapshotHandle`]; session references are never persisted. A snapshot is
//! removed once both counts reach zero, and a file is deleted at the moment
//! its count drops from one to zero.

use crate::error::{Error, Result};
use crate::table_cache::TableCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tern_core::filename::{log_file_name, manifest_file_name, parse_file_name, table_file_name, FileKind};
use tern_core::{Env, WritableFile};
use tern_sstable::Comparator;
use tern_wal::{LogReader, LogWriter};

pub type FileId = u64;
pub type SnapshotId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name relative to the database directory.
    pub location: String,
    pub begin_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub size: u64,
    pub refcnt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub levels: Vec<Vec<FileId>>,
    pub refcnt: u32,
}

/// A table produced by a compaction, not yet known to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub id: FileId,
    pub location: String,
    pub begin_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub size: u64,
}

/// The complete level mapping of the next snapshot plus the files it adds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSnapshotRequest {
    pub levels: Vec<Vec<FileId>>,
    pub files: Vec<NewFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ManifestData {
    files: BTreeMap<FileId, FileInfo>,
    snapshots: BTreeMap<SnapshotId, SnapshotInfo>,
    next_file_id: FileId,
    next_snapshot_id: SnapshotId,
    log_number: u64,
    current_snapshot: SnapshotId,
    /// WAL files superseded by `NewLog` and not yet confirmed deleted.
    retired_logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Edit {
    CreateFile { id: FileId },
    NewSnapshot(NewSnapshotRequest),
    NewLog { number: u64 },
    MakeSnapshot { id: SnapshotId },
    DeleteSnapshot { id: SnapshotId },
    ResetLog { name: String },
}

const KIND_CREATE_FILE: u8 = 1;
const KIND_NEW_SNAPSHOT: u8 = 2;
const KIND_NEW_LOG: u8 = 3;
const KIND_MAKE_SNAPSHOT: u8 = 4;
const KIND_DELETE_SNAPSHOT: u8 = 5;
const KIND_RESET_LOG: u8 = 6;

#[derive(Serialize, Deserialize)]
struct IdBody {
    id: u64,
}

#[derive(Serialize, Deserialize)]
struct NumberBody {
    number: u64,
}

#[derive(Serialize, Deserialize)]
struct NameBody {
    name: String,
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Internal(format!("manifest encode: {}", e)))
}

impl Edit {
    fn encode(&self) -> Result<Vec<u8>> {
        let (kind, body) = match self {
            Edit::CreateFile { id } => (KIND_CREATE_FILE, to_json(&IdBody { id: *id })?),
            Edit::NewSnapshot(req) => (KIND_NEW_SNAPSHOT, to_json(req)?),
            Edit::NewLog { number } => (KIND_NEW_LOG, to_json(&NumberBody { number: *number })?),
            Edit::MakeSnapshot { id } => (KIND_MAKE_SNAPSHOT, to_json(&IdBody { id: *id })?),
            Edit::DeleteSnapshot { id } => (KIND_DELETE_SNAPSHOT, to_json(&IdBody { id: *id })?),
            Edit::ResetLog { name } => (KIND_RESET_LOG, to_json(&NameBody { name: name.clone() })?),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(kind);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(record: &[u8]) -> Result<Self> {
        let (&kind, body) = record
            .split_first()
            .ok_or_else(|| Error::Corruption("empty manifest edit".to_string()))?;
        Ok(match kind {
            KIND_CREATE_FILE => Edit::CreateFile {
                id: serde_json::from_slice::<IdBody>(body)?.id,
            },
            KIND_NEW_SNAPSHOT => Edit::NewSnapshot(serde_json::from_slice(body)?),
            KIND_NEW_LOG => Edit::NewLog {
                number: serde_json::from_slice::<NumberBody>(body)?.number,
            },
            KIND_MAKE_SNAPSHOT => Edit::MakeSnapshot {
                id: serde_json::from_slice::<IdBody>(body)?.id,
            },
            KIND_DELETE_SNAPSHOT => Edit::DeleteSnapshot {
                id: serde_json::from_slice::<IdBody>(body)?.id,
            },
            KIND_RESET_LOG => Edit::ResetLog {
                name: serde_json::from_slice::<NameBody>(body)?.name,
            },
            other => {
                return Err(Error::Corruption(format!("unknown manifest edit kind {}", other)));
            }
        })
    }
}

impl ManifestData {
    fn fresh() -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(
            1,
            SnapshotInfo {
                levels: Vec::new(),
                refcnt: 1,
            },
        );
        Self {
            files: BTreeMap::new(),
            snapshots,
            next_file_id: 1,
            next_snapshot_id: 2,
            log_number: 0,
            current_snapshot: 1,
            retired_logs: Vec::new(),
        }
    }

    fn key_range<'a>(&'a self, id: FileId, req: &'a NewSnapshotRequest) -> Option<(&'a [u8], &'a [u8])> {
        if let Some(f) = req.files.iter().find(|f| f.id == id) {
            return Some((f.begin_key.as_slice(), f.end_key.as_slice()));
        }
        self.files
            .get(&id)
            .map(|f| (f.begin_key.as_slice(), f.end_key.as_slice()))
    }

    /// Rejects an edit that would break an invariant. Never mutates.
    fn check(&self, edit: &Edit, cmp: &dyn Comparator) -> Result<()> {
        match edit {
            Edit::NewSnapshot(req) => {
                for f in &req.files {
                    if self.files.contains_key(&f.id) {
                        return Err(Error::Corruption(format!("new file {} already exists", f.id)));
                    }
                    if !req.levels.iter().flatten().any(|&id| id == f.id) {
                        return Err(Error::Corruption(format!(
                            "new file {} is not referenced by any level",
                            f.id
                        )));
                    }
                }
                for (level, ids) in req.levels.iter().enumerate() {
                    let mut prev_end: Option<&[u8]> = None;
                    for &id in ids {
                        let (begin, end) = self.key_range(id, req).ok_or_else(|| {
                            Error::Corruption(format!("level {} references unknown file {}", level, id))
                        })?;
                        if let Some(prev_end) = prev_end {
                            if cmp.compare(prev_end, begin) != Ordering::Less {
                                return Err(Error::Corruption(format!(
                                    "level {} files overlap or are unsorted at file {}",
                                    level, id
                                )));
                            }
                        }
                        prev_end = Some(end);
                    }
                }
                Ok(())
            }
            Edit::MakeSnapshot { id } => {
                if self.snapshots.contains_key(id) {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("snapshot {}", id)))
                }
            }
            Edit::DeleteSnapshot { id } => {
                let info = self
                    .snapshots
                    .get(id)
                    .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))?;
                // The current snapshot keeps one reference for itself.
                let own = u32::from(*id == self.current_snapshot);
                if info.refcnt <= own {
                    return Err(Error::Corruption(format!("snapshot {} is not pinned", id)));
                }
                Ok(())
            }
            Edit::CreateFile { .. } | Edit::NewLog { .. } | Edit::ResetLog { .. } => Ok(()),
        }
    }

    /// Applies a checked edit, returning the files whose count reached zero.
    fn apply(&mut self, edit: &Edit, sessions: &HashMap<SnapshotId, usize>) -> Vec<(FileId, FileInfo)> {
        match edit {
            Edit::CreateFile { id } => {
                self.next_file_id = self.next_file_id.max(id + 1);
                Vec::new()
            }
            Edit::NewSnapshot(req) => {
                for f in &req.files {
                    self.next_file_id = self.next_file_id.max(f.id + 1);
                    self.files.insert(
                        f.id,
                        FileInfo {
                            location: f.location.clone(),
                            begin_key: f.begin_key.clone(),
                            end_key: f.end_key.clone(),
                            size: f.size,
                            refcnt: 0,
                        },
                    );
                }
                for id in req.levels.iter().flatten() {
                    if let Some(info) = self.files.get_mut(id) {
                        info.refcnt += 1;
                    }
                }

                let id = self.next_snapshot_id;
                self.next_snapshot_id += 1;
                self.snapshots.insert(
                    id,
                    SnapshotInfo {
                        levels: req.levels.clone(),
                        refcnt: 1,
                    },
                );
                let prev = std::mem::replace(&mut self.current_snapshot, id);
                self.unref_snapshot(prev, sessions)
            }
            Edit::NewLog { number } => {
                if self.log_number != 0 && self.log_number != *number {
                    let retired = log_file_name(self.log_number);
                    if !self.retired_logs.contains(&retired) {
                        self.retired_logs.push(retired);
                    }
                }
                self.log_number = *number;
                self.next_file_id = self.next_file_id.max(number + 1);
                Vec::new()
            }
            Edit::MakeSnapshot { id } => {
                if let Some(info) = self.snapshots.get_mut(id) {
                    info.refcnt += 1;
                }
                Vec::new()
            }
            Edit::DeleteSnapshot { id } => self.unref_snapshot(*id, sessions),
            Edit::ResetLog { name } => {
                self.retired_logs.retain(|n| n != name);
                Vec::new()
            }
        }
    }

    fn unref_snapshot(&mut self, id: SnapshotId, sessions: &HashMap<SnapshotId, usize>) -> Vec<(FileId, FileInfo)> {
        let Some(info) = self.snapshots.get_mut(&id) else {
            return Vec::new();
        };
        info.refcnt = info.refcnt.saturating_sub(1);
        if info.refcnt == 0 && sessions.get(&id).copied().unwrap_or(0) == 0 {
            self.remove_snapshot(id)
        } else {
            Vec::new()
        }
    }

    fn remove_snapshot(&mut self, id: SnapshotId) -> Vec<(FileId, FileInfo)> {
        let Some(info) = self.snapshots.remove(&id) else {
            return Vec::new();
        };
        let mut dead = Vec::new();
        for file_id in info.levels.iter().flatten() {
            let reached_zero = match self.files.get_mut(file_id) {
                Some(f) => {
                    f.refcnt = f.refcnt.saturating_sub(1);
                    f.refcnt == 0
                }
                None => false,
            };
            if reached_zero {
                if let Some(f) = self.files.remove(file_id) {
                    dead.push((*file_id, f));
                }
            }
        }
        dead
    }
}

/// A table of a pinned snapshot, with what readers need to route to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFile {
    pub id: FileId,
    pub location: String,
    pub begin_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub size: u64,
}

/// Session reference on a snapshot, released on drop.
pub struct SnapshotHandle {
    manifest: Arc<Manifest>,
    id: SnapshotId,
    levels: Vec<Vec<LiveFile>>,
}

impl SnapshotHandle {
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn levels(&self) -> &[Vec<LiveFile>] {
        &self.levels
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.manifest.release(self.id);
    }
}

impl std::fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("id", &self.id)
            .field("levels", &self.levels.len())
            .finish()
    }
}

struct State {
    data: ManifestData,
    sessions: HashMap<SnapshotId, usize>,
    log: LogWriter<Box<dyn WritableFile>>,
    number: u64,
}

pub struct Manifest {
    env: Arc<dyn Env>,
    dir: PathBuf,
    cmp: Arc<dyn Comparator>,
    tables: Arc<TableCache>,
    /// Guards the maps and the edit log together.
    state: RwLock<State>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Manifest")
            .field("dir", &self.dir)
            .field("manifest_number", &state.number)
            .field("log_number", &state.data.log_number)
            .field("files", &state.data.files.len())
            .finish()
    }
}

impl Manifest {
    /// Recovers the newest readable manifest in `dir`, rewrites it as a fresh
    /// generation and removes every older one.
    pub fn open(
        env: Arc<dyn Env>,
        dir: &Path,
        cmp: Arc<dyn Comparator>,
        tables: Arc<TableCache>,
        create_if_missing: bool,
    ) -> Result<Arc<Self>> {
        let mut numbers: Vec<u64> = env
            .list_dir(dir)?
            .iter()
            .filter_map(|name| match parse_file_name(name) {
                Some(FileKind::Manifest(n)) => Some(n),
                _ => None,
            })
            .collect();
        numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut recovered = None;
        for &n in &numbers {
            match Self::load(env.as_ref(), &dir.join(manifest_file_name(n)), cmp.as_ref()) {
                Ok(data) => {
                    tracing::info!(manifest = n, files = data.files.len(), "recovered manifest");
                    recovered = Some(data);
                    break;
                }
                Err(e) => {
                    tracing::warn!(manifest = n, error = %e, "skipping unreadable manifest");
                }
            }
        }

        let mut data = match recovered {
            Some(data) => data,
            None if create_if_missing => {
                tracing::info!(dir = %dir.display(), "creating empty manifest");
                ManifestData::fresh()
            }
            None if numbers.is_empty() => {
                return Err(Error::NotFound(format!("no manifest in {}", dir.display())));
            }
            None => {
                return Err(Error::Corruption(format!(
                    "none of {} manifests in {} is readable",
                    numbers.len(),
                    dir.display()
                )));
            }
        };

        let number = data.next_file_id;
        data.next_file_id += 1;
        let body = to_json(&data)?;
        let len = i32::try_from(body.len())
            .map_err(|_| Error::Internal(format!("manifest snapshot of {} bytes", body.len())))?;

        let mut file = env.new_writable_file(&dir.join(manifest_file_name(number)))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&body)?;
        file.sync()?;
        env.sync_dir(dir)?;

        for &old in &numbers {
            if let Err(e) = env.remove_file(&dir.join(manifest_file_name(old))) {
                tracing::warn!(manifest = old, error = %e, "failed to remove old manifest");
            }
        }

        Ok(Arc::new(Self {
            env,
            dir: dir.to_path_buf(),
            cmp,
            tables,
            state: RwLock::new(State {
                data,
                sessions: HashMap::new(),
                log: LogWriter::new(file),
                number,
            }),
        }))
    }

    fn load(env: &dyn Env, path: &Path, cmp: &dyn Comparator) -> Result<ManifestData> {
        let bytes = env.read_all(path)?;
        let len = bytes
            .get(..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(i32::from_le_bytes)
            .ok_or_else(|| Error::Corruption("manifest shorter than its length prefix".to_string()))?;
        let len = usize::try_from(len)
            .map_err(|_| Error::Corruption(format!("negative manifest snapshot length {}", len)))?;
        let body = bytes
            .get(4..4 + len)
            .ok_or_else(|| Error::Corruption(format!("manifest snapshot of {} bytes is truncated", len)))?;

        let mut data: ManifestData = serde_json::from_slice(body)?;

        let recovered = LogReader::new(&bytes[4 + len..]).recover()?;
        if recovered.truncated {
            tracing::warn!(path = %path.display(), records = recovered.records.len(), "manifest edit log truncated");
        }
        let no_sessions = HashMap::new();
        for record in &recovered.records {
            let edit = Edit::decode(record)?;
            data.check(&edit, cmp)?;
            data.apply(&edit, &no_sessions);
        }
        Ok(data)
    }

    /// Checks, logs and applies one edit. Files that became unreferenced are
    /// returned for deletion outside the lock.
    fn commit(&self, state: &mut State, edit: Edit) -> Result<Vec<(FileId, FileInfo)>> {
        state.data.check(&edit, self.cmp.as_ref())?;
        let record = edit.encode()?;
        state.log.append(&record)?;
        state.log.sync()?;
        Ok(state.data.apply(&edit, &state.sessions))
    }

    fn delete_files(&self, dead: Vec<(FileId, FileInfo)>) {
        for (id, info) in dead {
            self.tables.evict(id);
            match self.env.remove_file(&self.dir.join(&info.location)) {
                Ok(()) => tracing::debug!(file_id = id, "deleted unreferenced table"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(file_id = id, error = %e, "failed to delete table"),
            }
        }
    }

    /// Allocates a file number; also used for WAL numbers.
    pub fn create_file(&self) -> Result<(FileId, String)> {
        let mut state = self.state.write();
        let id = state.data.next_file_id;
        self.commit(&mut state, Edit::CreateFile { id })?;
        Ok((id, table_file_name(id)))
    }

    /// Installs a new current snapshot.
    pub fn new_snapshot(&self, req: NewSnapshotRequest) -> Result<SnapshotId> {
        let (id, dead) = {
            let mut state = self.state.write();
            let dead = self.commit(&mut state, Edit::NewSnapshot(req))?;
            (state.data.current_snapshot, dead)
        };
        self.delete_files(dead);
        Ok(id)
    }

    /// Records `number` as the live WAL; the previous one becomes retired.
    pub fn new_log(&self, number: u64) -> Result<()> {
        let mut state = self.state.write();
        self.commit(&mut state, Edit::NewLog { number })?;
        Ok(())
    }

    /// Durably pins the current snapshot.
    pub fn make_snapshot(&self) -> Result<SnapshotId> {
        let mut state = self.state.write();
        let id = state.data.current_snapshot;
        self.commit(&mut state, Edit::MakeSnapshot { id })?;
        Ok(id)
    }

    /// Drops a pin taken by [`make_snapshot`](Self::make_snapshot).
    pub fn delete_snapshot(&self, id: SnapshotId) -> Result<()> {
        let dead = {
            let mut state = self.state.write();
            self.commit(&mut state, Edit::DeleteSnapshot { id })?
        };
        self.delete_files(dead);
        Ok(())
    }

    /// Records that a retired WAL file is gone.
    pub fn reset_log(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        self.commit(
            &mut state,
            Edit::ResetLog {
                name: name.to_string(),
            },
        )?;
        Ok(())
    }

    /// Takes a session reference on the current snapshot.
    pub fn acquire_current(self: &Arc<Self>) -> SnapshotHandle {
        let mut state = self.state.write();
        let id = state.data.current_snapshot;
        *state.sessions.entry(id).or_insert(0) += 1;

        let levels = state
            .data
            .snapshots
            .get(&id)
            .map(|snap| {
                snap.levels
                    .iter()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|fid| {
                                state.data.files.get(fid).map(|f| LiveFile {
                                    id: *fid,
                                    location: f.location.clone(),
                                    begin_key: f.begin_key.clone(),
                                    end_key: f.end_key.clone(),
                                    size: f.size,
                                })
                            })
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        SnapshotHandle {
            manifest: Arc::clone(self),
            id,
            levels,
        }
    }

    fn release(&self, id: SnapshotId) {
        let dead = {
            let mut state = self.state.write();
            let remaining = match state.sessions.get_mut(&id) {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n
                }
                None => return,
            };
            if remaining > 0 {
                return;
            }
            state.sessions.remove(&id);
            let unreferenced = state.data.snapshots.get(&id).map_or(false, |s| s.refcnt == 0);
            if unreferenced {
                state.data.remove_snapshot(id)
            } else {
                Vec::new()
            }
        };
        self.delete_files(dead);
    }

    pub fn current_snapshot(&self) -> SnapshotId {
        self.state.read().data.current_snapshot
    }

    /// File ids of every level of the current snapshot.
    pub fn current_levels(&self) -> Vec<Vec<FileId>> {
        let state = self.state.read();
        state
            .data
            .snapshots
            .get(&state.data.current_snapshot)
            .map(|s| s.levels.clone())
            .unwrap_or_default()
    }

    pub fn file_info(&self, id: FileId) -> Option<FileInfo> {
        self.state.read().data.files.get(&id).cloned()
    }

    pub fn snapshot_info(&self, id: SnapshotId) -> Option<SnapshotInfo> {
        self.state.read().data.snapshots.get(&id).cloned()
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        self.state.read().data.files.keys().copied().collect()
    }

    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.state.read().data.snapshots.keys().copied().collect()
    }

    pub fn log_number(&self) -> u64 {
        self.state.read().data.log_number
    }

    pub fn retired_logs(&self) -> Vec<String> {
        self.state.read().data.retired_logs.clone()
    }

    /// Generation number of the manifest file being appended to.
    pub fn manifest_number(&self) -> u64 {
        self.state.read().number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tern_core::DiskEnv;
    use tern_sstable::bytewise;

    fn open(dir: &Path) -> Result<Arc<Manifest>> {
        let env: Arc<dyn Env> = Arc::new(DiskEnv);
        let tables = Arc::new(TableCache::new(Arc::clone(&env), dir.to_path_buf(), bytewise(), 4));
        Manifest::open(env, dir, bytewise(), tables, true)
    }

    fn new_file(manifest: &Manifest, dir: &Path, begin: &str, end: &str) -> NewFile {
        let (id, location) = manifest.create_file().unwrap();
        std::fs::write(dir.join(&location), b"table").unwrap();
        NewFile {
            id,
            location,
            begin_key: begin.as_bytes().to_vec(),
            end_key: end.as_bytes().to_vec(),
            size: 5,
        }
    }

    fn manifest_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with("manifest."))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_fresh_manifest_has_empty_current_snapshot() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        assert!(m.current_levels().is_empty());
        assert_eq!(m.log_number(), 0);
        assert_eq!(manifest_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_create_if_missing_false_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let env: Arc<dyn Env> = Arc::new(DiskEnv);
        let tables = Arc::new(TableCache::new(Arc::clone(&env), dir.path().to_path_buf(), bytewise(), 4));
        let err = Manifest::open(env, dir.path(), bytewise(), tables, false).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_debug_shows_generation_and_log() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let (log, _) = m.create_file().unwrap();
        m.new_log(log).unwrap();

        let shown = format!("{:?}", m);
        assert!(shown.contains(&format!("manifest_number: {}", m.manifest_number())));
        assert!(shown.contains(&format!("log_number: {}", log)));
        assert!(shown.contains("files: 0"));
    }

    #[test]
    fn test_reopen_restores_state_and_rotates_generation() {
        let dir = TempDir::new().unwrap();
        let (files, snapshots, log) = {
            let m = open(dir.path()).unwrap();
            let a = new_file(&m, dir.path(), "a", "c");
            let b = new_file(&m, dir.path(), "d", "f");
            m.new_snapshot(NewSnapshotRequest {
                levels: vec![vec![a.id], vec![b.id]],
                files: vec![a, b],
            })
            .unwrap();
            m.new_log(7).unwrap();
            let pinned = m.make_snapshot().unwrap();
            m.new_log(9).unwrap();
            m.reset_log(&log_file_name(7)).unwrap();
            assert_eq!(m.snapshot_info(pinned).unwrap().refcnt, 2);

            let files: Vec<_> = m.file_ids().into_iter().map(|id| (id, m.file_info(id))).collect();
            let snaps: Vec<_> = m.snapshot_ids().into_iter().map(|id| (id, m.snapshot_info(id))).collect();
            (files, snaps, m.log_number())
        };

        let m = open(dir.path()).unwrap();
        let files2: Vec<_> = m.file_ids().into_iter().map(|id| (id, m.file_info(id))).collect();
        let snaps2: Vec<_> = m.snapshot_ids().into_iter().map(|id| (id, m.snapshot_info(id))).collect();
        assert_eq!(files2, files);
        assert_eq!(snaps2, snapshots);
        assert_eq!(m.log_number(), log);
        assert!(m.retired_logs().is_empty());
        assert_eq!(manifest_files(dir.path()), vec![manifest_file_name(m.manifest_number())]);
    }

    #[test]
    fn test_previous_snapshot_files_deleted_at_zero() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let a = new_file(&m, dir.path(), "a", "b");
        let a_id = a.id;
        let a_path = dir.path().join(&a.location);
        m.new_snapshot(NewSnapshotRequest {
            levels: vec![vec![a_id]],
            files: vec![a],
        })
        .unwrap();

        let b = new_file(&m, dir.path(), "a", "b");
        let b_id = b.id;
        m.new_snapshot(NewSnapshotRequest {
            levels: vec![vec![b_id]],
            files: vec![b],
        })
        .unwrap();

        assert!(m.file_info(a_id).is_none());
        assert!(!a_path.exists());
        assert_eq!(m.file_info(b_id).unwrap().refcnt, 1);
    }

    #[test]
    fn test_session_reference_defers_deletion() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let a = new_file(&m, dir.path(), "a", "b");
        let a_id = a.id;
        let a_path = dir.path().join(&a.location);
        let s1 = m
            .new_snapshot(NewSnapshotRequest {
                levels: vec![vec![a_id]],
                files: vec![a],
            })
            .unwrap();

        let handle = m.acquire_current();
        assert_eq!(handle.id(), s1);
        assert_eq!(handle.levels()[0][0].id, a_id);

        // Only the session keeps file a alive now.
        m.new_snapshot(NewSnapshotRequest::default()).unwrap();
        assert!(a_path.exists());
        assert_eq!(m.snapshot_info(s1).unwrap().refcnt, 0);

        drop(handle);
        assert!(m.snapshot_info(s1).is_none());
        assert!(m.file_info(a_id).is_none());
        assert!(!a_path.exists());
    }

    #[test]
    fn test_unknown_file_reference_is_rejected() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let before = m.current_snapshot();
        let err = m
            .new_snapshot(NewSnapshotRequest {
                levels: vec![vec![4242]],
                files: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert_eq!(m.current_snapshot(), before);
    }

    #[test]
    fn test_overlapping_level_is_rejected() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let a = new_file(&m, dir.path(), "a", "m");
        let b = new_file(&m, dir.path(), "k", "z");
        let err = m
            .new_snapshot(NewSnapshotRequest {
                levels: vec![vec![a.id, b.id]],
                files: vec![a, b],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_pinned_snapshot_keeps_files_until_deleted() {
        let dir = TempDir::new().unwrap();
        let m = open(dir.path()).unwrap();
        let a = new_file(&m, dir.path(), "a", "b");
        let a_id = a.id;
        m.new_snapshot(NewSnapshotRequest {
            levels: vec![vec![a_id]],
            files: vec![a],
        })
        .unwrap();
        let pinned = m.make_snapshot().unwrap();
        m.new_snapshot(NewSnapshotRequest::default()).unwrap();
        assert!(m.file_info(a_id).is_some());

        m.delete_snapshot(pinned).unwrap();
        assert!(m.file_info(a_id).is_none());
        assert!(m.delete_snapshot(pinned).is_err());
    }

    #[test]
    fn test_falls_back_to_older_manifest() {
        let dir = TempDir::new().unwrap();
        let good = {
            let m = open(dir.path()).unwrap();
            m.new_log(3).unwrap();
            m.manifest_number()
        };
        let garbage = dir.path().join(manifest_file_name(good + 100));
        std::fs::write(&garbage, b"\x05\x00\x00\x00{oops").unwrap();

        let m = open(dir.path()).unwrap();
        assert_eq!(m.log_number(), 3);
        assert!(!garbage.exists());
        assert_eq!(manifest_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_edit_encoding_is_kind_prefixed_json() {
        let edit = Edit::ResetLog {
            name: "0000000001_db.log".to_string(),
        };
        let bytes = edit.encode().unwrap();
        assert_eq!(bytes[0], KIND_RESET_LOG);
        assert_eq!(&bytes[1..], br#"{"name":"0000000001_db.log"}"#);
        assert_eq!(Edit::decode(&bytes).unwrap(), edit);
        assert!(Edit::decode(&[99, b'{', b'}']).is_err());
    }
}
