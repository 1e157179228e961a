//! Region RPC catalog and the traits both sides implement.
//!
//! Every request except `Echo` names its region; the receiving server
//! dispatches on that id. [`RegionTransport`] is the seam between callers and
//! the network: [`crate::InMemoryTransport`] hands requests straight to a
//! service, [`crate::GrpcTransport`] maps them onto the `RegionRpc` protobuf
//! service (see [`crate::convert`]).

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, RaftSequence, RaftStateInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tern_core::ServerName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionRequest {
    /// Liveness probe; answered with the same value.
    Echo { value: i64 },
    RequestVote {
        region: String,
        candidate: ServerName,
        term: u64,
        last_sequence: RaftSequence,
    },
    /// Empty `entries` is a heartbeat.
    AppendEntries {
        region: String,
        leader: ServerName,
        term: u64,
        guessed_sequence: RaftSequence,
        entries: Vec<LogEntry>,
    },
    GetRaftState { region: String },
    AppendEdit { region: String, data: Vec<u8> },
    /// `start_sequence == 0` reads from the first live entry.
    GetNRecords {
        region: String,
        start_sequence: u64,
        n: u64,
    },
    TrimEditQueue { region: String, end_sequence: u64 },
}

impl RegionRequest {
    pub fn region(&self) -> Option<&str> {
        match self {
            RegionRequest::Echo { .. } => None,
            RegionRequest::RequestVote { region, .. }
            | RegionRequest::AppendEntries { region, .. }
            | RegionRequest::GetRaftState { region }
            | RegionRequest::AppendEdit { region, .. }
            | RegionRequest::GetNRecords { region, .. }
            | RegionRequest::TrimEditQueue { region, .. } => Some(region),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            RegionRequest::Echo { .. } => "Echo",
            RegionRequest::RequestVote { .. } => "RequestVote",
            RegionRequest::AppendEntries { .. } => "AppendEntries",
            RegionRequest::GetRaftState { .. } => "GetRaftState",
            RegionRequest::AppendEdit { .. } => "AppendEdit",
            RegionRequest::GetNRecords { .. } => "GetNRecords",
            RegionRequest::TrimEditQueue { .. } => "TrimEditQueue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub ok: bool,
    pub my_term: u64,
}

/// Follower's answer to `AppendEntries`.
///
/// On success `real_sequence` is the follower's new last entry; on a
/// mismatch it is the follower's current last entry, which the leader uses
/// to rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReply {
    pub not_leader: bool,
    pub real_sequence: RaftSequence,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    pub found: bool,
    pub state: Option<RaftStateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordsReply {
    pub ok: bool,
    /// Sequence of `records[0]`.
    pub start_sequence: u64,
    pub records: Vec<Vec<u8>>,
}

impl RecordsReply {
    pub fn rejected() -> Self {
        Self {
            ok: false,
            start_sequence: 0,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionResponse {
    Echo { value: i64 },
    RequestVote(VoteReply),
    AppendEntries(AppendReply),
    GetRaftState(StateReply),
    AppendEdit { ok: bool },
    GetNRecords(RecordsReply),
    TrimEditQueue { ok: bool },
}

/// Server side: answers one request. Failures are folded into the reply.
#[async_trait]
pub trait RegionService: Send + Sync {
    async fn handle(&self, request: RegionRequest) -> RegionResponse;
}

/// Client side: delivers a request to `target` and returns its reply.
///
/// The typed helpers wrap [`call`](Self::call) and reject replies of the
/// wrong kind.
#[async_trait]
pub trait RegionTransport: Send + Sync {
    async fn call(&self, target: &ServerName, request: RegionRequest) -> Result<RegionResponse>;

    async fn echo(&self, target: &ServerName, value: i64) -> Result<i64> {
        match self.call(target, RegionRequest::Echo { value }).await? {
            RegionResponse::Echo { value } => Ok(value),
            other => Err(unexpected("Echo", &other)),
        }
    }

    async fn request_vote(
        &self,
        target: &ServerName,
        region: &str,
        candidate: &ServerName,
        term: u64,
        last_sequence: RaftSequence,
    ) -> Result<VoteReply> {
        let request = RegionRequest::RequestVote {
            region: region.to_string(),
            candidate: candidate.clone(),
            term,
            last_sequence,
        };
        match self.call(target, request).await? {
            RegionResponse::RequestVote(reply) => Ok(reply),
            other => Err(unexpected("RequestVote", &other)),
        }
    }

    async fn append_entries(
        &self,
        target: &ServerName,
        region: &str,
        leader: &ServerName,
        term: u64,
        guessed_sequence: RaftSequence,
        entries: Vec<LogEntry>,
    ) -> Result<AppendReply> {
        let request = RegionRequest::AppendEntries {
            region: region.to_string(),
            leader: leader.clone(),
            term,
            guessed_sequence,
            entries,
        };
        match self.call(target, request).await? {
            RegionResponse::AppendEntries(reply) => Ok(reply),
            other => Err(unexpected("AppendEntries", &other)),
        }
    }

    async fn get_raft_state(&self, target: &ServerName, region: &str) -> Result<StateReply> {
        let request = RegionRequest::GetRaftState {
            region: region.to_string(),
        };
        match self.call(target, request).await? {
            RegionResponse::GetRaftState(reply) => Ok(reply),
            other => Err(unexpected("GetRaftState", &other)),
        }
    }

    async fn append_edit(&self, target: &ServerName, region: &str, data: Vec<u8>) -> Result<bool> {
        let request = RegionRequest::AppendEdit {
            region: region.to_string(),
            data,
        };
        match self.call(target, request).await? {
            RegionResponse::AppendEdit { ok } => Ok(ok),
            other => Err(unexpected("AppendEdit", &other)),
        }
    }

    async fn get_n_records(
        &self,
        target: &ServerName,
        region: &str,
        start_sequence: u64,
        n: u64,
    ) -> Result<RecordsReply> {
        let request = RegionRequest::GetNRecords {
            region: region.to_string(),
            start_sequence,
            n,
        };
        match self.call(target, request).await? {
            RegionResponse::GetNRecords(reply) => Ok(reply),
            other => Err(unexpected("GetNRecords", &other)),
        }
    }

    async fn trim_edit_queue(
        &self,
        target: &ServerName,
        region: &str,
        end_sequence: u64,
    ) -> Result<bool> {
        let request = RegionRequest::TrimEditQueue {
            region: region.to_string(),
            end_sequence,
        };
        match self.call(target, request).await? {
            RegionResponse::TrimEditQueue { ok } => Ok(ok),
            other => Err(unexpected("TrimEditQueue", &other)),
        }
    }
}

fn unexpected(method: &str, reply: &RegionResponse) -> RaftError {
    RaftError::Protocol(format!("{method} answered with {reply:?}"))
}
