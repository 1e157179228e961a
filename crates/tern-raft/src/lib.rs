//! tern-raft: replicated edit pipeline for tern regions.
//!
//! Clients append edits to the edit queue of every member of a region. The
//! region's leader periodically collects the edits a majority holds, orders
//! them into its raft log, applies them to its [`RegionStore`] and
//! replicates them to followers, then trims the queues.
//!
//! ```text
//!  client --AppendEdit--> [EditQueue m1] [EditQueue m2] [EditQueue m3]
//!                                \             |             /
//!                                 +-- EditCollector (leader) +
//!                                              |
//!                                        RaftLog append
//!                                              |
//!                    RegionStore <--apply--+---+--AppendEntries--> followers
//!                                          |
//!                                   TrimEditQueue on every member
//! ```
//!
//! All members of one server share a metadata [`tern_lsm::Db`] (edit queues,
//! raft logs and hard state, namespaced per region); each region has its own
//! [`RegionStore`].

pub mod proto {
    //! Generated protobuf types and the region RPC service.
    tonic::include_proto!("tern.region.v1");
}

pub mod collector;
pub mod config;
pub mod convert;
pub mod edit_queue;
pub mod error;
pub mod grpc_service;
pub mod grpc_transport;
pub mod multicast;
pub mod raft_log;
pub mod region_store;
pub mod rpc;
pub mod server;
pub mod state;
pub mod transport;
pub mod types;

pub use collector::{CollectResult, EditCollector};
pub use config::RaftConfig;
pub use edit_queue::EditQueue;
pub use error::{RaftError, Result};
pub use grpc_service::{serve_grpc, RegionRpcService};
pub use grpc_transport::GrpcTransport;
pub use multicast::Multicast;
pub use raft_log::{HardState, RaftLog};
pub use region_store::{RegionStore, VersionedComparator};
pub use rpc::{
    AppendReply, RecordsReply, RegionRequest, RegionResponse, RegionService, RegionTransport,
    StateReply, VoteReply,
};
pub use server::RegionServer;
pub use state::{MemberContext, RaftStates};
pub use transport::{InMemoryNetwork, InMemoryTransport};
pub use types::{LogEntry, RaftRecord, RaftSequence, RaftStateInfo, Role};
