//! Placement actions and their delivery.
//!
//! Delivery is best-effort: the balancer never waits for a storage server
//! to act on an action. The coordination store commit is what servers
//! ultimately converge on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tern_core::{Region, ServerName};
use tern_observe::{obs_count, Meter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Ask `dest` to host a replica of `region`, copying from `src` if given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementAction {
    pub region: Region,
    pub src: Option<ServerName>,
    pub dest: ServerName,
}

/// Sink that executes placement actions.
pub trait PlacementManager: Send + Sync {
    /// Dispatches without waiting for the outcome.
    fn send(&self, action: PlacementAction);
}

/// Queues actions on a bounded channel for a dispatcher task.
///
/// When the channel is full or the receiver is gone the action is dropped
/// with a warning.
pub struct ChannelPlacementManager {
    tx: mpsc::Sender<PlacementAction>,
    meter: Arc<dyn Meter>,
}

impl ChannelPlacementManager {
    pub fn new(
        capacity: usize,
        meter: Arc<dyn Meter>,
    ) -> (Self, mpsc::Receiver<PlacementAction>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, meter }, rx)
    }
}

impl PlacementManager for ChannelPlacementManager {
    fn send(&self, action: PlacementAction) {
        match self.tx.try_send(action) {
            Ok(()) => obs_count!(self.meter, "placement_actions_sent", &[], 1),
            Err(TrySendError::Full(action)) => {
                obs_count!(self.meter, "placement_actions_dropped", &[], 1);
                tracing::warn!(
                    region = %action.region,
                    dest = %action.dest,
                    "placement queue full, dropping action"
                );
            }
            Err(TrySendError::Closed(action)) => {
                obs_count!(self.meter, "placement_actions_dropped", &[], 1);
                tracing::warn!(
                    region = %action.region,
                    dest = %action.dest,
                    "placement dispatcher gone, dropping action"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_observe::NoopMeter;

    fn action(port: u16) -> PlacementAction {
        PlacementAction {
            region: Region::full(),
            src: None,
            dest: ServerName::new("h", port),
        }
    }

    #[tokio::test]
    async fn test_actions_arrive_in_order() {
        let (manager, mut rx) = ChannelPlacementManager::new(4, Arc::new(NoopMeter));
        manager.send(action(1));
        manager.send(action(2));
        assert_eq!(rx.recv().await, Some(action(1)));
        assert_eq!(rx.recv().await, Some(action(2)));
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (manager, mut rx) = ChannelPlacementManager::new(1, Arc::new(NoopMeter));
        manager.send(action(1));
        manager.send(action(2));
        assert_eq!(rx.recv().await, Some(action(1)));
        assert!(rx.try_recv().is_err());

        drop(rx);
        manager.send(action(3));
    }
}
