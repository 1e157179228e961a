//! tern-observe: vendor-neutral observability ABI.
//!
//! Storage, consensus and placement crates depend only on these traits and
//! event types. Backends live elsewhere.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: TernEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: TernEvent) {}
}

/// Meter that keeps every emitted event and instrument value in memory.
///
/// Counters accumulate, gauges keep their last value and histograms keep
/// every sample. Meant for tests.
#[derive(Clone, Default)]
pub struct CaptureMeter {
    events: Arc<Mutex<Vec<TernEvent>>>,
    counters: Arc<Mutex<HashMap<&'static str, u64>>>,
    gauges: Arc<Mutex<HashMap<&'static str, i64>>>,
    samples: Arc<Mutex<HashMap<&'static str, Vec<f64>>>>,
}

struct CaptureC {
    name: &'static str,
    totals: Arc<Mutex<HashMap<&'static str, u64>>>,
}
impl Counter for CaptureC {
    fn inc(&self, v: u64) {
        *self.totals.lock().entry(self.name).or_insert(0) += v;
    }
}
struct CaptureG {
    name: &'static str,
    values: Arc<Mutex<HashMap<&'static str, i64>>>,
}
impl Gauge for CaptureG {
    fn set(&self, v: i64) {
        self.values.lock().insert(self.name, v);
    }
}
struct CaptureH {
    name: &'static str,
    samples: Arc<Mutex<HashMap<&'static str, Vec<f64>>>>,
}
impl Histogram for CaptureH {
    fn observe(&self, v: f64) {
        self.samples.lock().entry(self.name).or_default().push(v);
    }
}

impl CaptureMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all events emitted so far.
    pub fn events(&self) -> Vec<TernEvent> {
        self.events.lock().clone()
    }

    /// Sum of every increment of counter `name`.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Last value set on gauge `name`.
    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.gauges.lock().get(name).copied()
    }

    /// Every sample observed by histogram `name`, in order.
    pub fn samples(&self, name: &str) -> Vec<f64> {
        self.samples.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.counters.lock().clear();
        self.gauges.lock().clear();
        self.samples.lock().clear();
    }
}

impl Meter for CaptureMeter {
    fn counter(
        &self,
        n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(CaptureC {
            name: n,
            totals: Arc::clone(&self.counters),
        })
    }
    fn gauge(
        &self,
        n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(CaptureG {
            name: n,
            values: Arc::clone(&self.gauges),
        })
    }
    fn histo(
        &self,
        n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(CaptureH {
            name: n,
            samples: Arc::clone(&self.samples),
        })
    }
    fn emit(&self, e: TernEvent) {
        self.events.lock().push(e);
    }
}

/// Typed events (keys and values are never included).
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum TernEvent {
    Wal(WalEvt),
    Compaction(CompEvt),
    Raft(RaftEvt),
    Placement(PlacementEvt),
}

#[derive(Clone, Debug, PartialEq)]
pub struct WalEvt {
    pub log: u64,
    pub kind: WalKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum WalKind {
    Rotated { bytes: u64 },
    Replayed { records: u64 },
    CorruptionTruncated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompEvt {
    /// Target level of the compaction.
    pub level: u32,
    pub kind: CompKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum CompKind {
    /// Skiplist written as a new L0 level.
    L0Flush { file_id: u64, bytes: u64 },
    /// Skiplist and all L0 levels merged into the first sorted level.
    Merge { in_files: usize, out_files: usize, out_bytes: u64 },
    /// One file of level n merged into level n+1.
    LevelMerge { in_files: usize, out_files: usize, out_bytes: u64 },
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftEvt {
    pub region: String,
    pub term: u64,
    pub kind: RaftKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum RaftKind {
    VoteReq,
    VoteGranted { from: String },
    LeaderElected { node: String },
    StepDown,
    Committed { records: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlacementEvt {
    pub kind: PlacementKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum PlacementKind {
    InitialRegion { replicas: usize },
    Split,
    Merged,
    MergePending { moves: usize },
    Outage { regions: usize },
    ServersAdded { count: usize },
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}
