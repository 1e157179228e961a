//! Placement error types.

use tern_core::{Region, ServerName};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// No rack has a live host, so no replica can be placed.
    #[error("No racks available for placement")]
    NoRacks,

    #[error("Unknown region: {0}")]
    UnknownRegion(Region),

    #[error("Unknown server: {0}")]
    UnknownServer(ServerName),

    /// Split and merge need `left.end == right.start`.
    #[error("Regions {left} and {right} are not adjacent")]
    NotAdjacent { left: Region, right: Region },

    /// The split halves must cover exactly the origin region.
    #[error("Split halves do not cover {origin}")]
    SplitMismatch { origin: Region },

    #[error("Region {0} is not one of the merge pair")]
    LightNotInPair(Region),

    /// The lighter region has no holder to copy from.
    #[error("Region {0} has no replicas")]
    NoReplicas(Region),

    /// The coordination store refused or failed the commit.
    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PlacementError>;
