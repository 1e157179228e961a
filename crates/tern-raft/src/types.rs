//! Core replication types: sequences, roles, records, log entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use tern_core::ServerName;

/// Position in a region's replicated log.
///
/// Ordered by `(term, index)`; `ZERO` precedes every real entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RaftSequence {
    pub term: u64,
    pub index: u64,
}

impl RaftSequence {
    pub const ZERO: RaftSequence = RaftSequence { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for RaftSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}/I{}", self.term, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// A key/value edit as carried through edit queues and the raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RaftRecord {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One sequenced payload of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: RaftSequence,
    pub data: Vec<u8>,
}

/// Snapshot of a member's role state, answered by `GetRaftState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStateInfo {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<ServerName>,
    pub last_sequence: RaftSequence,
    pub leader: Option<ServerName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_orders_by_term_then_index() {
        assert!(RaftSequence::new(1, 9) < RaftSequence::new(2, 1));
        assert!(RaftSequence::new(2, 1) < RaftSequence::new(2, 2));
        assert!(RaftSequence::ZERO < RaftSequence::new(0, 1));
        assert_eq!(RaftSequence::default(), RaftSequence::ZERO);
    }

    #[test]
    fn test_record_codec() {
        let record = RaftRecord::new("k", "v");
        assert_eq!(RaftRecord::decode(&record.encode().unwrap()).unwrap(), record);
        assert!(RaftRecord::decode(b"not json").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(RaftSequence::new(3, 7).to_string(), "T3/I7");
        assert_eq!(Role::Leader.to_string(), "leader");
    }
}
