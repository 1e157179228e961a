//! In-process transport for region RPCs.
//!
//! [`InMemoryNetwork`] is a registry of services with partition control, for
//! tests and single-process clusters. Networked servers use
//! [`crate::grpc_transport::GrpcTransport`].

use crate::error::{RaftError, Result};
use crate::rpc::{RegionRequest, RegionResponse, RegionService, RegionTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tern_core::ServerName;

/// Registry of in-process services.
///
/// An isolated server can neither reach nor be reached by anyone else;
/// calls to itself still go through.
#[derive(Default)]
pub struct InMemoryNetwork {
    services: RwLock<HashMap<ServerName, Arc<dyn RegionService>>>,
    isolated: RwLock<HashSet<ServerName>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: ServerName, service: Arc<dyn RegionService>) {
        self.services.write().insert(name, service);
    }

    pub fn unregister(&self, name: &ServerName) {
        self.services.write().remove(name);
    }

    pub fn isolate(&self, name: &ServerName) {
        tracing::info!(server = %name, "isolating server");
        self.isolated.write().insert(name.clone());
    }

    pub fn heal(&self, name: &ServerName) {
        tracing::info!(server = %name, "healing server");
        self.isolated.write().remove(name);
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
    }

    /// Client handle that sends as `local`.
    pub fn transport(self: &Arc<Self>, local: ServerName) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            local,
            network: self.clone(),
        })
    }

    fn reachable(&self, from: &ServerName, to: &ServerName) -> bool {
        if from == to {
            return true;
        }
        let isolated = self.isolated.read();
        !isolated.contains(from) && !isolated.contains(to)
    }
}

pub struct InMemoryTransport {
    local: ServerName,
    network: Arc<InMemoryNetwork>,
}

impl InMemoryTransport {
    pub fn local(&self) -> &ServerName {
        &self.local
    }
}

#[async_trait]
impl RegionTransport for InMemoryTransport {
    async fn call(&self, target: &ServerName, request: RegionRequest) -> Result<RegionResponse> {
        if !self.network.reachable(&self.local, target) {
            return Err(RaftError::Transport(format!(
                "{} cannot reach {target}",
                self.local
            )));
        }
        let service = self
            .network
            .services
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("no server registered at {target}")))?;
        Ok(service.handle(request).await)
    }
}
