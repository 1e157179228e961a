//! Region RPC service (server side).
//!
//! Decodes each gRPC request into a [`RegionRequest`], hands it to the
//! server's [`RegionService`] and encodes the reply. Failures inside the
//! service are already folded into its replies; a [`Status`] is returned only
//! for undecodable requests or a reply of the wrong kind.

use crate::convert::{sequence, server_name, MAX_MESSAGE_BYTES};
use crate::error::RaftError;
use crate::proto::{
    self,
    region_rpc_server::{RegionRpc, RegionRpcServer},
};
use crate::rpc::{RegionRequest, RegionResponse, RegionService};
use crate::types::LogEntry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

pub struct RegionRpcService {
    service: Arc<dyn RegionService>,
}

impl RegionRpcService {
    pub fn new(service: Arc<dyn RegionService>) -> Self {
        Self { service }
    }

    async fn dispatch(&self, request: RegionRequest) -> RegionResponse {
        tracing::trace!(method = request.method(), region = request.region().unwrap_or("-"), "region rpc");
        self.service.handle(request).await
    }
}

fn invalid(e: RaftError) -> Status {
    Status::invalid_argument(e.to_string())
}

fn mismatched(method: &str, reply: &RegionResponse) -> Status {
    Status::internal(format!("{method} answered with {reply:?}"))
}

#[tonic::async_trait]
impl RegionRpc for RegionRpcService {
    async fn echo(
        &self,
        request: Request<proto::EchoRequest>,
    ) -> Result<Response<proto::EchoResponse>, Status> {
        let req = request.into_inner();
        match self.dispatch(RegionRequest::Echo { value: req.value }).await {
            RegionResponse::Echo { value } => Ok(Response::new(proto::EchoResponse { value })),
            other => Err(mismatched("Echo", &other)),
        }
    }

    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteRequest>,
    ) -> Result<Response<proto::RequestVoteResponse>, Status> {
        let req = request.into_inner();
        let request = RegionRequest::RequestVote {
            region: req.region,
            candidate: server_name(req.candidate, "candidate").map_err(invalid)?,
            term: req.term,
            last_sequence: sequence(req.last_sequence, "last_sequence").map_err(invalid)?,
        };
        match self.dispatch(request).await {
            RegionResponse::RequestVote(reply) => Ok(Response::new(proto::RequestVoteResponse {
                ok: reply.ok,
                my_term: reply.my_term,
            })),
            other => Err(mismatched("RequestVote", &other)),
        }
    }

    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let entries = req
            .entries
            .into_iter()
            .map(LogEntry::try_from)
            .collect::<crate::Result<Vec<_>>>()
            .map_err(invalid)?;
        let request = RegionRequest::AppendEntries {
            region: req.region,
            leader: server_name(req.leader, "leader").map_err(invalid)?,
            term: req.term,
            guessed_sequence: sequence(req.guessed_sequence, "guessed_sequence").map_err(invalid)?,
            entries,
        };
        match self.dispatch(request).await {
            RegionResponse::AppendEntries(reply) => {
                Ok(Response::new(proto::AppendEntriesResponse {
                    not_leader: reply.not_leader,
                    real_sequence: Some(reply.real_sequence.into()),
                    term: reply.term,
                }))
            }
            other => Err(mismatched("AppendEntries", &other)),
        }
    }

    async fn get_raft_state(
        &self,
        request: Request<proto::GetRaftStateRequest>,
    ) -> Result<Response<proto::GetRaftStateResponse>, Status> {
        let req = request.into_inner();
        match self.dispatch(RegionRequest::GetRaftState { region: req.region }).await {
            RegionResponse::GetRaftState(reply) => Ok(Response::new(proto::GetRaftStateResponse {
                found: reply.found,
                state: reply.state.map(proto::RaftState::from),
            })),
            other => Err(mismatched("GetRaftState", &other)),
        }
    }

    async fn append_edit(
        &self,
        request: Request<proto::AppendEditRequest>,
    ) -> Result<Response<proto::AppendEditResponse>, Status> {
        let req = request.into_inner();
        let request = RegionRequest::AppendEdit {
            region: req.region,
            data: req.data,
        };
        match self.dispatch(request).await {
            RegionResponse::AppendEdit { ok } => Ok(Response::new(proto::AppendEditResponse { ok })),
            other => Err(mismatched("AppendEdit", &other)),
        }
    }

    async fn get_n_records(
        &self,
        request: Request<proto::GetNRecordsRequest>,
    ) -> Result<Response<proto::GetNRecordsResponse>, Status> {
        let req = request.into_inner();
        let request = RegionRequest::GetNRecords {
            region: req.region,
            start_sequence: req.start_sequence,
            n: req.n,
        };
        match self.dispatch(request).await {
            RegionResponse::GetNRecords(reply) => Ok(Response::new(proto::GetNRecordsResponse {
                ok: reply.ok,
                start_sequence: reply.start_sequence,
                records: reply.records,
            })),
            other => Err(mismatched("GetNRecords", &other)),
        }
    }

    async fn trim_edit_queue(
        &self,
        request: Request<proto::TrimEditQueueRequest>,
    ) -> Result<Response<proto::TrimEditQueueResponse>, Status> {
        let req = request.into_inner();
        let request = RegionRequest::TrimEditQueue {
            region: req.region,
            end_sequence: req.end_sequence,
        };
        match self.dispatch(request).await {
            RegionResponse::TrimEditQueue { ok } => {
                Ok(Response::new(proto::TrimEditQueueResponse { ok }))
            }
            other => Err(mismatched("TrimEditQueue", &other)),
        }
    }
}

/// Serves `service` on `listener` until `shutdown` fires, then drains open
/// connections.
pub async fn serve_grpc(
    listener: TcpListener,
    service: Arc<dyn RegionService>,
    mut shutdown: broadcast::Receiver<()>,
) -> crate::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "region server listening");

    let rpc = RegionRpcServer::new(RegionRpcService::new(service))
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES);
    tonic::transport::Server::builder()
        .add_service(rpc)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| RaftError::Transport(format!("region server on {local}: {e}")))?;

    tracing::info!(addr = %local, "region server shut down");
    Ok(())
}
