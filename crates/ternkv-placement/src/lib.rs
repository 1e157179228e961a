//! ternkv-placement: where region replicas live.
//!
//! The [`Balancer`] decides which servers host each region. It spreads
//! replicas over racks using load-ordered [`IndexedHeap`]s, tells servers to
//! pick up replicas through a [`PlacementManager`], and commits region
//! additions and removals through a [`StateManager`] to the coordination
//! store that storage servers watch.
//!
//! ```text
//!  stats reports ──► Balancer ──► PlacementManager ──► servers (best effort)
//!                       │
//!                       └──────► StateManager ──► CoordinationStore ──► watchers
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod heap;
pub mod placement;
pub mod rack;
pub mod state;

pub use balancer::{Balancer, MergeOutcome, ServerStats};
pub use config::BalancerConfig;
pub use error::{PlacementError, Result};
pub use heap::IndexedHeap;
pub use placement::{ChannelPlacementManager, PlacementAction, PlacementManager};
pub use rack::{RackManager, RackMap, DEFAULT_RACK};
pub use state::{
    CoordinationStore, InMemoryCoordinationStore, RegionChange, StateManager, StoreStateManager,
};
