//! Conversions between domain types and their protobuf messages.
//!
//! Message-typed fields are optional in proto3; a required one that is
//! absent is a [`RaftError::Protocol`].

use crate::error::{RaftError, Result};
use crate::proto;
use crate::types::{LogEntry, RaftSequence, RaftStateInfo, Role};
use tern_core::ServerName;

/// Largest encoded message either side accepts.
pub const MAX_MESSAGE_BYTES: usize = 64 << 20;

fn missing(field: &str) -> RaftError {
    RaftError::Protocol(format!("missing field `{field}`"))
}

impl From<RaftSequence> for proto::Sequence {
    fn from(seq: RaftSequence) -> Self {
        Self {
            term: seq.term,
            index: seq.index,
        }
    }
}

impl From<proto::Sequence> for RaftSequence {
    fn from(seq: proto::Sequence) -> Self {
        RaftSequence::new(seq.term, seq.index)
    }
}

pub(crate) fn sequence(field: Option<proto::Sequence>, name: &str) -> Result<RaftSequence> {
    field.map(RaftSequence::from).ok_or_else(|| missing(name))
}

impl From<&ServerName> for proto::ServerName {
    fn from(name: &ServerName) -> Self {
        Self {
            host: name.host.clone(),
            port: u32::from(name.port),
        }
    }
}

impl TryFrom<proto::ServerName> for ServerName {
    type Error = RaftError;

    fn try_from(name: proto::ServerName) -> Result<Self> {
        let port = u16::try_from(name.port)
            .map_err(|_| RaftError::Protocol(format!("port {} out of range", name.port)))?;
        Ok(ServerName::new(name.host, port))
    }
}

pub(crate) fn server_name(field: Option<proto::ServerName>, name: &str) -> Result<ServerName> {
    field.ok_or_else(|| missing(name))?.try_into()
}

fn optional_server_name(field: Option<proto::ServerName>) -> Result<Option<ServerName>> {
    field.map(ServerName::try_from).transpose()
}

impl From<LogEntry> for proto::LogEntry {
    fn from(entry: LogEntry) -> Self {
        Self {
            sequence: Some(entry.sequence.into()),
            data: entry.data,
        }
    }
}

impl TryFrom<proto::LogEntry> for LogEntry {
    type Error = RaftError;

    fn try_from(entry: proto::LogEntry) -> Result<Self> {
        Ok(LogEntry {
            sequence: sequence(entry.sequence, "entry.sequence")?,
            data: entry.data,
        })
    }
}

impl From<Role> for proto::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::Follower => proto::Role::Follower,
            Role::Candidate => proto::Role::Candidate,
            Role::Leader => proto::Role::Leader,
        }
    }
}

impl From<proto::Role> for Role {
    fn from(role: proto::Role) -> Self {
        match role {
            proto::Role::Follower => Role::Follower,
            proto::Role::Candidate => Role::Candidate,
            proto::Role::Leader => Role::Leader,
        }
    }
}

impl From<RaftStateInfo> for proto::RaftState {
    fn from(info: RaftStateInfo) -> Self {
        Self {
            role: proto::Role::from(info.role) as i32,
            current_term: info.current_term,
            voted_for: info.voted_for.as_ref().map(proto::ServerName::from),
            last_sequence: Some(info.last_sequence.into()),
            leader: info.leader.as_ref().map(proto::ServerName::from),
        }
    }
}

impl TryFrom<proto::RaftState> for RaftStateInfo {
    type Error = RaftError;

    fn try_from(state: proto::RaftState) -> Result<Self> {
        let role = proto::Role::try_from(state.role)
            .map_err(|_| RaftError::Protocol(format!("unknown role {}", state.role)))?;
        Ok(RaftStateInfo {
            role: role.into(),
            current_term: state.current_term,
            voted_for: optional_server_name(state.voted_for)?,
            last_sequence: sequence(state.last_sequence, "state.last_sequence")?,
            leader: optional_server_name(state.leader)?,
        })
    }
}
