//! Region membership commits.
//!
//! The coordination store holds the authoritative set of regions. Storage
//! servers watch it and reconcile what they host against each change.
//!
//! ```text
//!  Balancer --commit(adds, removals)--> StateManager --apply--> CoordinationStore
//!                                                                    |
//!                                               watchers <--RegionChange{epoch}
//! ```

use crate::error::{PlacementError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tern_core::Region;
use tokio::sync::broadcast;

/// One committed change to the region set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionChange {
    /// Monotonic, starting at 1 for the first commit.
    pub epoch: u64,
    pub adds: Vec<Region>,
    pub removals: Vec<Region>,
}

/// Commits region additions and removals.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Applies both lists as one change and returns its epoch.
    async fn commit(&self, adds: Vec<Region>, removals: Vec<Region>) -> Result<u64>;
}

/// External store that holds the region set and notifies watchers.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically removes `removals` and adds `adds`.
    ///
    /// Fails without changing anything if a removal is absent or an add is
    /// already present.
    async fn apply(&self, adds: &[Region], removals: &[Region]) -> Result<RegionChange>;

    async fn regions(&self) -> Result<Vec<Region>>;

    /// Receives every change applied after subscribing.
    fn watch(&self) -> broadcast::Receiver<RegionChange>;
}

/// [`StateManager`] backed by a [`CoordinationStore`].
pub struct StoreStateManager {
    store: Arc<dyn CoordinationStore>,
}

impl StoreStateManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }
}

#[async_trait]
impl StateManager for StoreStateManager {
    async fn commit(&self, adds: Vec<Region>, removals: Vec<Region>) -> Result<u64> {
        let change = self.store.apply(&adds, &removals).await?;
        tracing::info!(
            epoch = change.epoch,
            adds = change.adds.len(),
            removals = change.removals.len(),
            "committed region change"
        );
        Ok(change.epoch)
    }
}

struct StoreInner {
    epoch: u64,
    regions: BTreeSet<Region>,
}

/// Coordination store kept in process memory.
pub struct InMemoryCoordinationStore {
    inner: RwLock<StoreInner>,
    updates: broadcast::Sender<RegionChange>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_regions(Vec::new())
    }

    /// Starts at epoch 0 holding `regions`.
    pub fn with_regions(regions: Vec<Region>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(StoreInner {
                epoch: 0,
                regions: regions.into_iter().collect(),
            }),
            updates,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn apply(&self, adds: &[Region], removals: &[Region]) -> Result<RegionChange> {
        let change = {
            let mut inner = self.inner.write();
            if let Some(missing) = removals.iter().find(|r| !inner.regions.contains(*r)) {
                return Err(PlacementError::Coordination(format!(
                    "cannot remove absent region {missing}"
                )));
            }
            let after_removal = |r: &Region| inner.regions.contains(r) && !removals.contains(r);
            if let Some(dup) = adds.iter().find(|r| after_removal(*r)) {
                return Err(PlacementError::Coordination(format!(
                    "region {dup} already present"
                )));
            }

            for r in removals {
                inner.regions.remove(r);
            }
            inner.regions.extend(adds.iter().cloned());
            inner.epoch += 1;
            RegionChange {
                epoch: inner.epoch,
                adds: adds.to_vec(),
                removals: removals.to_vec(),
            }
        };

        // No watchers is fine.
        let _ = self.updates.send(change.clone());
        Ok(change)
    }

    async fn regions(&self) -> Result<Vec<Region>> {
        Ok(self.inner.read().regions.iter().cloned().collect())
    }

    fn watch(&self) -> broadcast::Receiver<RegionChange> {
        self.updates.subscribe()
    }
}
