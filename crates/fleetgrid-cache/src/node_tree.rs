//! Zone index over host names.
//!
//! Hosts are grouped by zone key (region + zone labels). [`NodeTree::list`]
//! walks the zones round-robin so consecutive hosts in the resulting order
//! come from different zones whenever possible.

use std::collections::HashMap;

use tracing::{debug, warn};

use fleetgrid_state::{Host, LABEL_TOPOLOGY_REGION, LABEL_TOPOLOGY_ZONE};

use crate::error::{CacheError, CacheResult};

/// Zone key of a host: `region:\0:zone`, or empty when the host carries
/// neither label.
pub fn zone_key(host: &Host) -> String {
    let region = host
        .labels
        .get(LABEL_TOPOLOGY_REGION)
        .map(String::as_str)
        .unwrap_or("");
    let zone = host
        .labels
        .get(LABEL_TOPOLOGY_ZONE)
        .map(String::as_str)
        .unwrap_or("");
    if region.is_empty() && zone.is_empty() {
        return String::new();
    }
    format!("{region}:\x00:{zone}")
}

/// Host names grouped by zone.
#[derive(Debug, Clone, Default)]
pub struct NodeTree {
    /// Zone key → host names in insertion order.
    tree: HashMap<String, Vec<String>>,
    /// Zone keys in the order they first appeared.
    zones: Vec<String>,
    num_nodes: usize,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts across all zones.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    /// Append `host` to its zone, creating the zone if needed. Adding a host
    /// twice is a no-op.
    pub fn add_node(&mut self, host: &Host) {
        let zone = zone_key(host);
        match self.tree.get_mut(&zone) {
            Some(names) => {
                if names.iter().any(|n| *n == host.name) {
                    debug!(host = %host.name, "host already in node tree, not adding");
                    return;
                }
                names.push(host.name.clone());
            }
            None => {
                self.zones.push(zone.clone());
                self.tree.insert(zone, vec![host.name.clone()]);
            }
        }
        self.num_nodes += 1;
        debug!(host = %host.name, zone = %zone_label(host), "added host to node tree");
    }

    /// Remove `host` from its zone. The zone goes away with its last host.
    pub fn remove_node(&mut self, host: &Host) -> CacheResult<()> {
        let zone = zone_key(host);
        let Some(names) = self.tree.get_mut(&zone) else {
            return Err(self.not_found(host));
        };
        let Some(pos) = names.iter().position(|n| *n == host.name) else {
            return Err(self.not_found(host));
        };
        names.remove(pos);
        if names.is_empty() {
            self.tree.remove(&zone);
            self.zones.retain(|z| *z != zone);
        }
        self.num_nodes -= 1;
        debug!(host = %host.name, zone = %zone_label(host), "removed host from node tree");
        Ok(())
    }

    /// Move a host whose zone labels changed. No-op when the zone is the same.
    pub fn update_node(&mut self, old: Option<&Host>, new: &Host) {
        let old_zone = old.map(zone_key).unwrap_or_default();
        if old_zone == zone_key(new) {
            return;
        }
        if let Some(old) = old {
            if let Err(e) = self.remove_node(old) {
                warn!(host = %old.name, error = %e, "host missing from its previous zone");
            }
        }
        self.add_node(new);
    }

    /// All host names, one per zone per pass.
    pub fn list(&self) -> CacheResult<Vec<String>> {
        let mut out = Vec::with_capacity(self.num_nodes);
        if self.zones.is_empty() {
            return Ok(out);
        }

        let mut exhausted = 0;
        let mut index = 0;
        while out.len() < self.num_nodes {
            if exhausted >= self.zones.len() {
                return Err(CacheError::NodeTree(
                    "all zones exhausted before reaching count of hosts expected".to_string(),
                ));
            }
            for zone in &self.zones {
                let names = self.tree.get(zone).map(Vec::as_slice).unwrap_or_default();
                match names.get(index) {
                    Some(name) => out.push(name.clone()),
                    None if index == names.len() => exhausted += 1,
                    None => {}
                }
            }
            index += 1;
        }
        Ok(out)
    }

    fn not_found(&self, host: &Host) -> CacheError {
        CacheError::NodeTree(format!(
            "host {:?} in zone {:?} was not found",
            host.name,
            zone_label(host)
        ))
    }
}

fn zone_label(host: &Host) -> String {
    zone_key(host).replace('\0', "")
}
