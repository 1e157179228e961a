//! Rack-aware replica placement.
//!
//! The balancer keeps three views of the cluster and two load queues:
//!
//! ```text
//!  server_map: ServerName -> [Region]        what each server hosts
//!  host_map:   host       -> [ServerName]    servers running on a host
//!  region_map: Region     -> [ServerName]    replica set of each region
//!
//!  rack_queue:        rack -> load           lowest load pops first
//!  host_queues[rack]: host -> load
//! ```
//!
//! Load is the number of regions hosted. A host's load is the sum over its
//! servers, a rack's load the sum over its hosts.
//!
//! # Process
//!
//! 1. Storage servers report what they host (`update_server_stats`); the
//!    maps and queues are rebuilt from the report.
//! 2. With no region at all, the full key space is placed on the least
//!    loaded racks, one replica per rack while racks last.
//! 3. Splits and merges are committed to the coordination store, which is
//!    the source of truth; placement actions are fire-and-forget.
//!
//! All mutation goes through `&mut self`: one control loop owns the balancer.

use crate::config::BalancerConfig;
use crate::error::{PlacementError, Result};
use crate::heap::IndexedHeap;
use crate::placement::{PlacementAction, PlacementManager};
use crate::rack::{RackManager, DEFAULT_RACK};
use crate::state::StateManager;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tern_core::{Region, ServerName};
use tern_observe::{obs_count, Meter, PlacementEvt, PlacementKind, TernEvent};

/// Regions one server reported hosting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub server: ServerName,
    pub regions: Vec<Region>,
}

impl ServerStats {
    pub fn new(server: ServerName, regions: Vec<Region>) -> Self {
        Self { server, regions }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Both halves shared a replica set and were replaced by this region.
    Merged(Region),
    /// Replica sets differ; this many moves were dispatched and the merge
    /// should be retried once they have landed.
    Pending { moves: usize },
}

pub struct Balancer {
    config: BalancerConfig,
    racks: Arc<dyn RackManager>,
    placement: Arc<dyn PlacementManager>,
    state: Arc<dyn StateManager>,
    meter: Arc<dyn Meter>,

    server_map: HashMap<ServerName, Vec<Region>>,
    host_map: BTreeMap<String, Vec<ServerName>>,
    region_map: BTreeMap<Region, Vec<ServerName>>,

    rack_queue: IndexedHeap<String, usize>,
    host_queues: HashMap<String, IndexedHeap<String, usize>>,

    last_report: u64,
}

impl Balancer {
    /// Seeds the maps and queues with `servers` at zero load.
    ///
    /// No region is created until the first stats report.
    pub fn new(
        config: BalancerConfig,
        servers: Vec<ServerName>,
        racks: Arc<dyn RackManager>,
        placement: Arc<dyn PlacementManager>,
        state: Arc<dyn StateManager>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config.validate()?;
        let mut balancer = Self {
            config,
            racks,
            placement,
            state,
            meter,
            server_map: HashMap::new(),
            host_map: BTreeMap::new(),
            region_map: BTreeMap::new(),
            rack_queue: IndexedHeap::new(),
            host_queues: HashMap::new(),
            last_report: 0,
        };
        balancer.reload(servers, Vec::new());
        Ok(balancer)
    }

    /// Resets to `servers` and the known `regions`, all with empty replica
    /// sets until servers report.
    pub fn reload(&mut self, servers: Vec<ServerName>, regions: Vec<Region>) {
        self.server_map.clear();
        self.host_map.clear();
        self.region_map.clear();

        for server in servers {
            self.register(server);
        }
        for region in regions {
            self.region_map.insert(region, Vec::new());
        }
        self.rebuild_queues();

        tracing::info!(
            servers = self.server_map.len(),
            regions = self.region_map.len(),
            "balancer reloaded"
        );
    }

    /// Rebuilds every map and queue from a full report.
    ///
    /// Reports older than the last accepted one are ignored. When no region
    /// is known afterwards, the initial full-range region is placed.
    pub async fn update_server_stats(&mut self, timestamp: u64, stats: Vec<ServerStats>) -> Result<()> {
        if timestamp < self.last_report {
            tracing::debug!(timestamp, last = self.last_report, "ignoring stale server stats");
            return Ok(());
        }
        self.last_report = timestamp;

        for regions in self.server_map.values_mut() {
            regions.clear();
        }
        for replicas in self.region_map.values_mut() {
            replicas.clear();
        }

        for ServerStats { server, mut regions } in stats {
            self.register(server.clone());
            regions.sort();
            regions.dedup();
            for region in &regions {
                self.region_map
                    .entry(region.clone())
                    .or_default()
                    .push(server.clone());
            }
            self.server_map.insert(server, regions);
        }
        for replicas in self.region_map.values_mut() {
            replicas.sort();
        }
        self.rebuild_queues();

        tracing::debug!(
            timestamp,
            servers = self.server_map.len(),
            regions = self.region_map.len(),
            "server stats applied"
        );

        if self.region_map.is_empty() {
            self.create_initial_region().await?;
        }
        Ok(())
    }

    /// Drops `server` from placement until it reports again.
    ///
    /// The server stays known (its host keeps it) because outages are
    /// assumed transient. Returns how many regions lost a replica.
    pub fn report_outage(&mut self, server: &ServerName) -> Result<usize> {
        let known = self
            .host_map
            .get(&server.host)
            .is_some_and(|servers| servers.contains(server));
        if !known {
            return Err(PlacementError::UnknownServer(server.clone()));
        }

        let regions = self.server_map.remove(server).unwrap_or_default();
        for region in &regions {
            if let Some(replicas) = self.region_map.get_mut(region) {
                replicas.retain(|s| s != server);
            }
        }
        self.adjust_load(server, -(regions.len() as isize));

        tracing::warn!(server = %server, regions = regions.len(), "server outage");
        self.emit(PlacementKind::Outage {
            regions: regions.len(),
        });
        Ok(regions.len())
    }

    /// Adds servers at zero load; already known servers are skipped.
    /// Returns how many were added.
    pub fn report_new_servers(&mut self, servers: Vec<ServerName>) -> usize {
        let mut added = 0;
        for server in servers {
            if self.is_known(&server) {
                continue;
            }
            self.register(server.clone());

            let rack = self.rack_for(&server.host);
            if !self.rack_queue.contains(&rack) {
                self.rack_queue.push(rack.clone(), 0);
            }
            let hosts = self.host_queues.entry(rack).or_default();
            if !hosts.contains(&server.host) {
                hosts.push(server.host.clone(), 0);
            }
            added += 1;
        }

        if added > 0 {
            tracing::info!(added, "new servers registered");
            self.emit(PlacementKind::ServersAdded { count: added });
        }
        added
    }

    /// Replaces `origin` by `left` and `right`, each keeping the replicas of
    /// `origin`.
    pub async fn split_region(&mut self, origin: &Region, left: &Region, right: &Region) -> Result<()> {
        ensure_adjacent(left, right)?;
        if left.start != origin.start || right.end != origin.end {
            return Err(PlacementError::SplitMismatch {
                origin: origin.clone(),
            });
        }
        let replicas = self.replica_set(origin)?;

        self.state
            .commit(vec![left.clone(), right.clone()], vec![origin.clone()])
            .await?;

        self.region_map.remove(origin);
        self.region_map.insert(left.clone(), replicas.clone());
        self.region_map.insert(right.clone(), replicas.clone());
        for server in &replicas {
            if let Some(regions) = self.server_map.get_mut(server) {
                regions.retain(|r| r != origin);
                regions.push(left.clone());
                regions.push(right.clone());
                regions.sort();
                self.adjust_load(server, 1);
            }
        }

        tracing::info!(origin = %origin, left = %left, right = %right, "region split");
        self.emit(PlacementKind::Split);
        Ok(())
    }

    /// Merges two neighbors, or moves replicas so that a later call can.
    ///
    /// `light` names the half whose replicas are copied when the sets
    /// differ: every holder of the other half that lacks `light` gets a copy
    /// from one of `light`'s holders.
    pub async fn merge_regions(
        &mut self,
        left: &Region,
        right: &Region,
        light: &Region,
    ) -> Result<MergeOutcome> {
        ensure_adjacent(left, right)?;
        if light != left && light != right {
            return Err(PlacementError::LightNotInPair(light.clone()));
        }
        let left_set = self.replica_set(left)?;
        let right_set = self.replica_set(right)?;

        if as_set(&left_set) == as_set(&right_set) {
            let merged = Region::new(left.start.clone(), right.end.clone());
            self.state
                .commit(vec![merged.clone()], vec![left.clone(), right.clone()])
                .await?;

            self.region_map.remove(left);
            self.region_map.remove(right);
            self.region_map.insert(merged.clone(), left_set.clone());
            for server in &left_set {
                if let Some(regions) = self.server_map.get_mut(server) {
                    regions.retain(|r| r != left && r != right);
                    regions.push(merged.clone());
                    regions.sort();
                    self.adjust_load(server, -1);
                }
            }

            tracing::info!(left = %left, right = %right, merged = %merged, "regions merged");
            self.emit(PlacementKind::Merged);
            return Ok(MergeOutcome::Merged(merged));
        }

        let (smaller_set, bigger_set) = if light == left {
            (left_set, right_set)
        } else {
            (right_set, left_set)
        };
        if smaller_set.is_empty() {
            return Err(PlacementError::NoReplicas(light.clone()));
        }
        let holders = as_set(&smaller_set);
        let missing: Vec<&ServerName> = bigger_set.iter().filter(|s| !holders.contains(*s)).collect();

        for (i, dest) in missing.iter().enumerate() {
            let src = &smaller_set[i % smaller_set.len()];
            tracing::debug!(region = %light, src = %src, dest = %dest, "merge move");
            self.placement.send(PlacementAction {
                region: light.clone(),
                src: Some(src.clone()),
                dest: (*dest).clone(),
            });
        }
        obs_count!(self.meter, "placement_merge_moves", &[], missing.len());

        tracing::info!(left = %left, right = %right, moves = missing.len(), "merge pending");
        self.emit(PlacementKind::MergePending {
            moves: missing.len(),
        });
        Ok(MergeOutcome::Pending {
            moves: missing.len(),
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn replicas(&self, region: &Region) -> Option<&[ServerName]> {
        self.region_map.get(region).map(Vec::as_slice)
    }

    pub fn regions(&self) -> Vec<Region> {
        self.region_map.keys().cloned().collect()
    }

    /// Regions `server` hosts; `None` if it is unknown or out.
    pub fn regions_of(&self, server: &ServerName) -> Option<&[Region]> {
        self.server_map.get(server).map(Vec::as_slice)
    }

    /// Every known server, including those currently out.
    pub fn servers(&self) -> Vec<ServerName> {
        self.host_map.values().flatten().cloned().collect()
    }

    pub fn rack_load(&self, rack: &str) -> Option<usize> {
        self.rack_queue.priority(&rack.to_string()).copied()
    }

    pub fn host_load(&self, host: &str) -> Option<usize> {
        let rack = self.rack_for(host);
        self.host_queues
            .get(&rack)
            .and_then(|hosts| hosts.priority(&host.to_string()).copied())
    }

    async fn create_initial_region(&mut self) -> Result<()> {
        let region = Region::full();
        let replicas = self.choose_replicas(self.config.num_replicas)?;

        for dest in &replicas {
            self.placement.send(PlacementAction {
                region: region.clone(),
                src: None,
                dest: dest.clone(),
            });
        }
        self.state.commit(vec![region.clone()], Vec::new()).await?;

        for server in &replicas {
            self.server_map
                .entry(server.clone())
                .or_default()
                .push(region.clone());
            self.adjust_load(server, 1);
        }
        self.region_map.insert(region.clone(), replicas.clone());

        tracing::info!(
            region = %region,
            replicas = ?replicas.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "initial region placed"
        );
        self.emit(PlacementKind::InitialRegion {
            replicas: replicas.len(),
        });
        Ok(())
    }

    /// Picks up to `n` distinct servers, one per rack while racks last.
    ///
    /// Racks and hosts are taken lowest load first. Once the racks run out
    /// the last one is reused, drawing its next host. Queues are left as
    /// they were.
    fn choose_replicas(&mut self, n: usize) -> Result<Vec<ServerName>> {
        let mut racks: Vec<(String, usize)> = Vec::new();
        while racks.len() < n {
            match self.rack_queue.pop() {
                Some(entry) => racks.push(entry),
                None => break,
            }
        }
        for (rack, load) in &racks {
            self.rack_queue.push(rack.clone(), *load);
        }
        let Some((last, _)) = racks.last().cloned() else {
            return Err(PlacementError::NoRacks);
        };
        let mut order: Vec<String> = racks.into_iter().map(|(rack, _)| rack).collect();
        order.resize(n, last);

        let mut rng = rand::thread_rng();
        let mut taken: HashMap<String, Vec<(String, usize)>> = HashMap::new();
        let mut chosen: Vec<ServerName> = Vec::new();

        for rack in &order {
            let popped = self.host_queues.get_mut(rack).and_then(|hosts| hosts.pop());
            let host = match popped {
                Some((host, load)) => {
                    taken
                        .entry(rack.clone())
                        .or_default()
                        .push((host.clone(), load));
                    host
                }
                None => match taken.get(rack).and_then(|hosts| hosts.last()) {
                    Some((host, _)) => host.clone(),
                    None => continue,
                },
            };

            let Some(servers) = self.host_map.get(&host) else {
                continue;
            };
            let fresh: Vec<&ServerName> = servers.iter().filter(|s| !chosen.contains(*s)).collect();
            if let Some(server) = fresh.choose(&mut rng) {
                chosen.push((*server).clone());
            }
        }

        for (rack, hosts) in taken {
            let queue = self.host_queues.entry(rack).or_default();
            for (host, load) in hosts {
                queue.push(host, load);
            }
        }

        if chosen.is_empty() {
            return Err(PlacementError::NoRacks);
        }
        Ok(chosen)
    }

    fn register(&mut self, server: ServerName) {
        let servers = self.host_map.entry(server.host.clone()).or_default();
        if !servers.contains(&server) {
            servers.push(server.clone());
            servers.sort();
        }
        self.server_map.entry(server).or_default();
    }

    fn is_known(&self, server: &ServerName) -> bool {
        self.host_map
            .get(&server.host)
            .is_some_and(|servers| servers.contains(server))
    }

    fn rack_for(&self, host: &str) -> String {
        self.racks
            .rack_of(host)
            .unwrap_or_else(|| DEFAULT_RACK.to_string())
    }

    fn replica_set(&self, region: &Region) -> Result<Vec<ServerName>> {
        self.region_map
            .get(region)
            .cloned()
            .ok_or_else(|| PlacementError::UnknownRegion(region.clone()))
    }

    fn rebuild_queues(&mut self) {
        let loads: Vec<(String, String, usize)> = self
            .host_map
            .iter()
            .map(|(host, servers)| {
                let load = servers
                    .iter()
                    .map(|s| self.server_map.get(s).map_or(0, Vec::len))
                    .sum();
                (self.rack_for(host), host.clone(), load)
            })
            .collect();

        self.rack_queue.clear();
        self.host_queues.clear();
        let mut rack_loads: BTreeMap<String, usize> = BTreeMap::new();
        for (rack, host, load) in loads {
            *rack_loads.entry(rack.clone()).or_default() += load;
            self.host_queues.entry(rack).or_default().push(host, load);
        }
        for (rack, load) in rack_loads {
            self.rack_queue.push(rack, load);
        }
    }

    /// Moves the host and rack of `server` by `delta` regions.
    fn adjust_load(&mut self, server: &ServerName, delta: isize) {
        let rack = self.rack_for(&server.host);
        if let Some(hosts) = self.host_queues.get_mut(&rack) {
            let current = hosts.priority(&server.host).copied();
            if let Some(load) = current {
                hosts.update(&server.host, shift(load, delta));
            }
        }
        let current = self.rack_queue.priority(&rack).copied();
        if let Some(load) = current {
            self.rack_queue.update(&rack, shift(load, delta));
        }
    }

    fn emit(&self, kind: PlacementKind) {
        self.meter.emit(TernEvent::Placement(PlacementEvt { kind }));
    }
}

fn ensure_adjacent(left: &Region, right: &Region) -> Result<()> {
    if left.is_left_neighbor_of(right) {
        Ok(())
    } else {
        Err(PlacementError::NotAdjacent {
            left: left.clone(),
            right: right.clone(),
        })
    }
}

fn as_set(servers: &[ServerName]) -> BTreeSet<&ServerName> {
    servers.iter().collect()
}

fn shift(load: usize, delta: isize) -> usize {
    if delta < 0 {
        load.saturating_sub(delta.unsigned_abs())
    } else {
        load + delta as usize
    }
}
