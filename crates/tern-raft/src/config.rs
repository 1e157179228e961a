//! Replication timeouts and limits.

use crate::error::{RaftError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-region raft tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Silence from the leader before a follower stands for election.
    ///
    /// The actual wait is randomized in `[1x, 2x)` to avoid split votes.
    pub candidate_wait_ms: u64,

    /// How long a candidate waits for vote replies.
    pub request_vote_timeout_ms: u64,

    /// Budget for every other RPC (collect, replicate, trim). A slow peer
    /// delays the next heartbeat by up to this much, so it stays below
    /// `candidate_wait_ms`.
    pub rpc_timeout_ms: u64,

    /// Records fetched from each member per collect.
    pub max_records_per_collect: u64,

    /// Leader sends an AppendEntries (possibly empty) at least this often.
    pub heartbeat_interval_ms: u64,

    /// Leader collects edit queues at this interval.
    pub collect_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            candidate_wait_ms: 1000,
            request_vote_timeout_ms: 150,
            rpc_timeout_ms: 300,
            max_records_per_collect: 256,
            heartbeat_interval_ms: 100,
            collect_interval_ms: 50,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.collect_interval_ms == 0 {
            return Err(RaftError::Config(
                "heartbeat_interval_ms and collect_interval_ms must be > 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.candidate_wait_ms {
            return Err(RaftError::Config(format!(
                "heartbeat_interval_ms ({}) must be < candidate_wait_ms ({})",
                self.heartbeat_interval_ms, self.candidate_wait_ms
            )));
        }
        if self.request_vote_timeout_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(RaftError::Config("RPC timeouts must be > 0".to_string()));
        }
        if self.rpc_timeout_ms >= self.candidate_wait_ms {
            return Err(RaftError::Config(format!(
                "rpc_timeout_ms ({}) must be < candidate_wait_ms ({})",
                self.rpc_timeout_ms, self.candidate_wait_ms
            )));
        }
        if self.max_records_per_collect == 0 {
            return Err(RaftError::Config("max_records_per_collect must be > 0".to_string()));
        }
        Ok(())
    }

    /// Randomized candidate wait in `[candidate_wait, 2 * candidate_wait)`.
    pub fn random_candidate_wait(&self) -> Duration {
        let base = self.candidate_wait_ms.max(1);
        Duration::from_millis(rand::thread_rng().gen_range(base..base * 2))
    }

    pub fn candidate_wait(&self) -> Duration {
        Duration::from_millis(self.candidate_wait_ms)
    }

    pub fn request_vote_timeout(&self) -> Duration {
        Duration::from_millis(self.request_vote_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }
}
