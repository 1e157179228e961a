//! Host to rack topology.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Rack assigned to hosts the topology does not list.
pub const DEFAULT_RACK: &str = "/default-rack";

/// Answers which rack a host sits in and which hosts a rack holds.
pub trait RackManager: Send + Sync {
    fn rack_of(&self, host: &str) -> Option<String>;

    fn hosts_in(&self, rack: &str) -> Vec<String>;

    fn racks(&self) -> Vec<String>;
}

/// Fixed topology, usually loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct RackMap {
    host_to_rack: HashMap<String, String>,
    rack_to_hosts: BTreeMap<String, BTreeSet<String>>,
}

impl RackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from `(rack, host)` pairs.
    pub fn from_pairs<I, R, H>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (R, H)>,
        R: Into<String>,
        H: Into<String>,
    {
        let mut map = Self::new();
        for (rack, host) in pairs {
            map.insert(rack, host);
        }
        map
    }

    /// Places `host` in `rack`, moving it if it was elsewhere.
    pub fn insert(&mut self, rack: impl Into<String>, host: impl Into<String>) {
        let (rack, host) = (rack.into(), host.into());
        if let Some(old) = self.host_to_rack.insert(host.clone(), rack.clone()) {
            if let Some(hosts) = self.rack_to_hosts.get_mut(&old) {
                hosts.remove(&host);
                if hosts.is_empty() {
                    self.rack_to_hosts.remove(&old);
                }
            }
        }
        self.rack_to_hosts.entry(rack).or_default().insert(host);
    }
}

impl RackManager for RackMap {
    fn rack_of(&self, host: &str) -> Option<String> {
        self.host_to_rack.get(host).cloned()
    }

    fn hosts_in(&self, rack: &str) -> Vec<String> {
        self.rack_to_hosts
            .get(rack)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn racks(&self) -> Vec<String> {
        self.rack_to_hosts.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_directions() {
        let map = RackMap::from_pairs([("r1", "h1"), ("r1", "h2"), ("r2", "h3")]);
        assert_eq!(map.rack_of("h2").as_deref(), Some("r1"));
        assert_eq!(map.rack_of("nowhere"), None);
        assert_eq!(map.hosts_in("r1"), vec!["h1".to_string(), "h2".to_string()]);
        assert!(map.hosts_in("r9").is_empty());
        assert_eq!(map.racks(), vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn test_insert_moves_host() {
        let mut map = RackMap::from_pairs([("r1", "h1")]);
        map.insert("r2", "h1");
        assert_eq!(map.rack_of("h1").as_deref(), Some("r2"));
        assert_eq!(map.racks(), vec!["r2".to_string()]);
    }
}
