//! Key ranges and server identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open key range `[start, end)`.
///
/// An empty `start` is negative infinity and an empty `end` is positive
/// infinity, so `Region::full()` covers every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Region {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The region spanning the whole key space.
    pub fn full() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    /// True when `self` ends exactly where `right` starts.
    pub fn is_left_neighbor_of(&self, right: &Region) -> bool {
        !self.end.is_empty() && self.end == right.start
    }

    /// Stable textual identity, used as a namespace prefix and in logs.
    pub fn id(&self) -> String {
        format!("{}-{}", hex(&self.start), hex(&self.end))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", hex(&self.start), hex(&self.end))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Identity of one storage daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
