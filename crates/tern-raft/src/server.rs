//! Per-server dispatch of region RPCs.

use crate::error::RaftError;
use crate::rpc::{
    AppendReply, RecordsReply, RegionRequest, RegionResponse, RegionService, StateReply, VoteReply,
};
use crate::state::RaftStates;
use crate::types::RaftSequence;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tern_core::ServerName;

/// Routes requests to the [`RaftStates`] of the named region.
///
/// Requests for a region this server does not host are answered with
/// `found = false` / `ok = false` (and `not_leader = true` for appends).
pub struct RegionServer {
    name: ServerName,
    regions: RwLock<HashMap<String, Arc<RaftStates>>>,
}

impl RegionServer {
    pub fn new(name: ServerName) -> Arc<Self> {
        Arc::new(Self {
            name,
            regions: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn add_region(&self, member: Arc<RaftStates>) {
        tracing::info!(server = %self.name, region = %member.region_id(), "hosting region");
        self.regions
            .write()
            .insert(member.region_id().to_string(), member);
    }

    pub fn remove_region(&self, region_id: &str) -> Option<Arc<RaftStates>> {
        self.regions.write().remove(region_id)
    }

    pub fn region(&self, region_id: &str) -> Option<Arc<RaftStates>> {
        self.regions.read().get(region_id).cloned()
    }

    pub fn region_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.regions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn log_failure(&self, method: &str, region: &str, error: &RaftError) {
        tracing::warn!(server = %self.name, method, region, error = %error, "request failed");
    }
}

#[async_trait]
impl RegionService for RegionServer {
    async fn handle(&self, request: RegionRequest) -> RegionResponse {
        let method = request.method();
        let member = request.region().and_then(|id| self.region(id));

        match request {
            RegionRequest::Echo { value } => RegionResponse::Echo { value },

            RegionRequest::RequestVote {
                region,
                candidate,
                term,
                last_sequence,
            } => {
                let reply = match member {
                    Some(m) => m
                        .handle_request_vote(&candidate, term, last_sequence)
                        .unwrap_or_else(|e| {
                            self.log_failure(method, &region, &e);
                            VoteReply {
                                ok: false,
                                my_term: m.current_term(),
                            }
                        }),
                    None => VoteReply {
                        ok: false,
                        my_term: 0,
                    },
                };
                RegionResponse::RequestVote(reply)
            }

            RegionRequest::AppendEntries {
                region,
                leader,
                term,
                guessed_sequence,
                entries,
            } => {
                let reply = match member {
                    Some(m) => m
                        .handle_append_entries(&leader, term, guessed_sequence, entries)
                        .unwrap_or_else(|e| {
                            self.log_failure(method, &region, &e);
                            AppendReply {
                                not_leader: false,
                                real_sequence: m.last_sequence(),
                                term: m.current_term(),
                            }
                        }),
                    None => AppendReply {
                        not_leader: true,
                        real_sequence: RaftSequence::ZERO,
                        term: 0,
                    },
                };
                RegionResponse::AppendEntries(reply)
            }

            RegionRequest::GetRaftState { .. } => RegionResponse::GetRaftState(StateReply {
                found: member.is_some(),
                state: member.map(|m| m.state_info()),
            }),

            RegionRequest::AppendEdit { region, data } => {
                let ok = match member {
                    Some(m) => match m.append_edit(&data).await {
                        Ok(_) => true,
                        Err(e) => {
                            self.log_failure(method, &region, &e);
                            false
                        }
                    },
                    None => false,
                };
                RegionResponse::AppendEdit { ok }
            }

            RegionRequest::GetNRecords {
                region,
                start_sequence,
                n,
            } => {
                let reply = match member {
                    Some(m) => match m.get_n_records(start_sequence, n).await {
                        Ok(reply) => reply,
                        Err(RaftError::SequenceNotFound { .. }) => RecordsReply::rejected(),
                        Err(e) => {
                            self.log_failure(method, &region, &e);
                            RecordsReply::rejected()
                        }
                    },
                    None => RecordsReply::rejected(),
                };
                RegionResponse::GetNRecords(reply)
            }

            RegionRequest::TrimEditQueue {
                region,
                end_sequence,
            } => {
                let ok = match member {
                    Some(m) => match m.trim_edit_queue(end_sequence).await {
                        Ok(()) => true,
                        Err(e) => {
                            self.log_failure(method, &region, &e);
                            false
                        }
                    },
                    None => false,
                };
                RegionResponse::TrimEditQueue { ok }
            }
        }
    }
}
