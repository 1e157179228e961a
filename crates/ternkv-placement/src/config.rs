//! Balancer tuning.

use crate::error::{PlacementError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Replicas per region. Placement spreads them over distinct racks
    /// while racks last.
    pub num_replicas: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { num_replicas: 3 }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_replicas == 0 {
            return Err(PlacementError::Config(
                "num_replicas must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
