//! Region RPC client over gRPC.
//!
//! One cached [`RegionRpcClient`] per target. A cached channel whose peer
//! went away (restart, dropped connection) fails with a transport error; the
//! client is then evicted and the request is sent once more on a fresh
//! connection. A failure on a fresh connection is returned as is.

use crate::convert::{sequence, MAX_MESSAGE_BYTES};
use crate::error::{RaftError, Result};
use crate::proto::{self, region_rpc_client::RegionRpcClient};
use crate::rpc::{
    AppendReply, RecordsReply, RegionRequest, RegionResponse, RegionTransport, StateReply,
    VoteReply,
};
use crate::types::RaftStateInfo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tern_core::ServerName;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

pub struct GrpcTransport {
    clients: Mutex<HashMap<ServerName, RegionRpcClient<Channel>>>,
    timeout: Duration,
}

impl GrpcTransport {
    /// `timeout` bounds connecting and each request attempt.
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Targets with a cached client.
    pub fn connected(&self) -> Vec<ServerName> {
        let mut names: Vec<ServerName> = self.clients.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn cached(&self, target: &ServerName) -> Option<RegionRpcClient<Channel>> {
        self.clients.lock().get(target).cloned()
    }

    fn evict(&self, target: &ServerName) {
        self.clients.lock().remove(target);
    }

    async fn connect(&self, target: &ServerName) -> Result<RegionRpcClient<Channel>> {
        let endpoint = Endpoint::from_shared(format!("http://{}", target))
            .map_err(|e| RaftError::Config(format!("invalid endpoint {target}: {e}")))?
            .connect_timeout(self.timeout)
            .tcp_nodelay(true);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RaftError::Transport(format!("connect {target}: {e}")))?;
        tracing::debug!(peer = %target, "connected");

        let client = RegionRpcClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);
        self.clients.lock().insert(target.clone(), client.clone());
        Ok(client)
    }

    async fn send(&self, client: RegionRpcClient<Channel>, request: RegionRequest) -> Result<RegionResponse> {
        match tokio::time::timeout(self.timeout, dispatch(client, request)).await {
            Ok(reply) => reply,
            Err(_) => Err(RaftError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl RegionTransport for GrpcTransport {
    async fn call(&self, target: &ServerName, request: RegionRequest) -> Result<RegionResponse> {
        let method = request.method();
        if let Some(client) = self.cached(target) {
            match self.send(client, request.clone()).await {
                Err(RaftError::Transport(reason)) => {
                    tracing::debug!(peer = %target, method, reason = %reason, "cached connection failed, reconnecting");
                    self.evict(target);
                }
                done => return done,
            }
        }

        let reply = match self.connect(target).await {
            Ok(client) => self.send(client, request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &reply {
            tracing::debug!(peer = %target, method, error = %e, "rpc failed");
            if matches!(e, RaftError::Transport(_)) {
                self.evict(target);
            }
        }
        reply
    }
}

/// Connection-level failures become [`RaftError::Transport`]; anything the
/// server chose to answer with is a protocol error.
fn status_error(status: Status) -> RaftError {
    match status.code() {
        Code::Unavailable | Code::Unknown | Code::Cancelled => {
            RaftError::Transport(status.message().to_string())
        }
        code => RaftError::Protocol(format!("{:?}: {}", code, status.message())),
    }
}

async fn dispatch(mut client: RegionRpcClient<Channel>, request: RegionRequest) -> Result<RegionResponse> {
    let response = match request {
        RegionRequest::Echo { value } => {
            let reply = client
                .echo(proto::EchoRequest { value })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::Echo { value: reply.value }
        }
        RegionRequest::RequestVote {
            region,
            candidate,
            term,
            last_sequence,
        } => {
            let reply = client
                .request_vote(proto::RequestVoteRequest {
                    region,
                    candidate: Some((&candidate).into()),
                    term,
                    last_sequence: Some(last_sequence.into()),
                })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::RequestVote(VoteReply {
                ok: reply.ok,
                my_term: reply.my_term,
            })
        }
        RegionRequest::AppendEntries {
            region,
            leader,
            term,
            guessed_sequence,
            entries,
        } => {
            let reply = client
                .append_entries(proto::AppendEntriesRequest {
                    region,
                    leader: Some((&leader).into()),
                    term,
                    guessed_sequence: Some(guessed_sequence.into()),
                    entries: entries.into_iter().map(proto::LogEntry::from).collect(),
                })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::AppendEntries(AppendReply {
                not_leader: reply.not_leader,
                real_sequence: sequence(reply.real_sequence, "real_sequence")?,
                term: reply.term,
            })
        }
        RegionRequest::GetRaftState { region } => {
            let reply = client
                .get_raft_state(proto::GetRaftStateRequest { region })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::GetRaftState(StateReply {
                found: reply.found,
                state: reply.state.map(RaftStateInfo::try_from).transpose()?,
            })
        }
        RegionRequest::AppendEdit { region, data } => {
            let reply = client
                .append_edit(proto::AppendEditRequest { region, data })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::AppendEdit { ok: reply.ok }
        }
        RegionRequest::GetNRecords {
            region,
            start_sequence,
            n,
        } => {
            let reply = client
                .get_n_records(proto::GetNRecordsRequest {
                    region,
                    start_sequence,
                    n,
                })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::GetNRecords(RecordsReply {
                ok: reply.ok,
                start_sequence: reply.start_sequence,
                records: reply.records,
            })
        }
        RegionRequest::TrimEditQueue {
            region,
            end_sequence,
        } => {
            let reply = client
                .trim_edit_queue(proto::TrimEditQueueRequest {
                    region,
                    end_sequence,
                })
                .await
                .map_err(status_error)?
                .into_inner();
            RegionResponse::TrimEditQueue { ok: reply.ok }
        }
    };
    Ok(response)
}
