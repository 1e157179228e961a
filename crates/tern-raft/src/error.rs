//! Replication error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    /// Storage engine failure (edit queue, raft log, region store).
    #[error("Storage error: {0}")]
    Storage(#[from] tern_lsm::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or log entry encoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// `get_n` asked for a sequence that was already trimmed.
    #[error("Sequence {start} precedes first sequence {first}")]
    SequenceNotFound { start: u64, first: u64 },

    /// A peer answered with something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer unreachable or connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC timed out after {0}ms")]
    Timeout(u64),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RaftError>;
