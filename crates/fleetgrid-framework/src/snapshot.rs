//! Point-in-time copy of the cache used for one scheduling attempt.

use std::collections::HashMap;
use std::sync::Arc;

use fleetgrid_state::{Host, NodeInfo, Workload};

/// Immutable-during-use view of every host.
///
/// The cache refreshes it incrementally between attempts; plugins only
/// ever read from it. `node_info_list` holds host names in the zone
/// round-robin order of the cache's node tree and always resolves through
/// `node_info_map`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub node_info_map: HashMap<String, NodeInfo>,
    pub node_info_list: Vec<String>,
    pub have_pods_with_affinity_list: Vec<String>,
    pub have_pods_with_required_anti_affinity_list: Vec<String>,
    /// Generation of the newest `NodeInfo` copied so far.
    pub generation: i64,
}

impl Snapshot {
    /// An empty snapshot, filled by the cache on first update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot directly from hosts and the workloads bound to
    /// them, keeping host order. Workloads bound to unknown hosts are
    /// ignored.
    pub fn from_hosts(hosts: Vec<Host>, workloads: Vec<Workload>) -> Self {
        let mut snapshot = Self::default();
        let mut by_host: HashMap<String, Vec<Workload>> = HashMap::new();
        for w in workloads {
            by_host.entry(w.node_name.clone()).or_default().push(w);
        }

        for host in hosts {
            let name = host.name.clone();
            let workloads = by_host.remove(&name).unwrap_or_default();
            let info = NodeInfo::with_workloads(host, workloads);
            if !info.pods_with_affinity.is_empty() {
                snapshot.have_pods_with_affinity_list.push(name.clone());
            }
            if !info.pods_with_required_anti_affinity.is_empty() {
                snapshot
                    .have_pods_with_required_anti_affinity_list
                    .push(name.clone());
            }
            snapshot.generation = snapshot.generation.max(info.generation);
            snapshot.node_info_map.insert(name.clone(), info);
            snapshot.node_info_list.push(name);
        }
        snapshot
    }

    /// Hosts in the snapshot, ghosts excluded.
    pub fn num_nodes(&self) -> usize {
        self.node_info_list.len()
    }

    /// Cache generation this snapshot was last brought up to.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// `NodeInfo` of host `name`.
    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.node_info_map.get(name)
    }

    /// All hosts in list order.
    pub fn list(&self) -> impl Iterator<Item = &NodeInfo> {
        resolve(&self.node_info_map, &self.node_info_list)
    }

    /// Hosts running at least one workload with (anti-)affinity terms.
    pub fn have_pods_with_affinity(&self) -> impl Iterator<Item = &NodeInfo> {
        resolve(&self.node_info_map, &self.have_pods_with_affinity_list)
    }

    /// Hosts running at least one workload with required anti-affinity.
    pub fn have_pods_with_required_anti_affinity(&self) -> impl Iterator<Item = &NodeInfo> {
        resolve(
            &self.node_info_map,
            &self.have_pods_with_required_anti_affinity_list,
        )
    }

    /// Every workload on every listed host.
    pub fn workloads(&self) -> impl Iterator<Item = &Arc<Workload>> {
        self.list().flat_map(|n| n.pods.iter().map(|p| &p.workload))
    }
}

fn resolve<'a>(
    map: &'a HashMap<String, NodeInfo>,
    names: &'a [String],
) -> impl Iterator<Item = &'a NodeInfo> {
    names.iter().filter_map(move |n| map.get(n))
}
