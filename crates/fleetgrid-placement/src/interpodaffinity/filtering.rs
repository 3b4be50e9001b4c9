use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use fleetgrid_framework::{
    CycleState, FilterPlugin, PreFilterExtensions, PreFilterPlugin, PreFilterResult, Snapshot,
    Status,
};
use fleetgrid_state::{AffinityTerm, Host, Labels, NodeInfo, PodInfo, Workload};

use super::InterPodAffinity;
use crate::helper::{TopologyPair, host_of, read_state, read_state_mut};

/// Reason given when a required affinity term has no match.
pub const ERR_REASON_AFFINITY_RULES_NOT_MATCH: &str = "node(s) didn't match pod affinity rules";
/// Reason given when a required anti-affinity term matches.
pub const ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH: &str =
    "node(s) didn't match pod anti-affinity rules";
/// Reason given when an existing workload's anti-affinity rejects the
/// incoming one.
pub const ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH: &str =
    "node(s) didn't satisfy existing pods anti-affinity rules";

const PRE_FILTER_STATE_KEY: &str = "PreFilterInterPodAffinity";

/// Number of matching terms per topology domain. Zero entries are
/// removed so an empty map means "nothing matched anywhere".
#[derive(Debug, Clone, Default)]
struct TopologyCounts(HashMap<TopologyPair, i64>);

impl TopologyCounts {
    fn get(&self, pair: &TopologyPair) -> i64 {
        self.0.get(pair).copied().unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn update(&mut self, pair: TopologyPair, delta: i64) {
        let count = self.0.entry(pair.clone()).or_insert(0);
        *count += delta;
        if *count == 0 {
            self.0.remove(&pair);
        }
    }

    /// Count `workload` once per term when it satisfies every term of
    /// `terms` at once.
    fn update_with_affinity_terms(
        &mut self,
        terms: &[AffinityTerm],
        workload: &Workload,
        node_labels: &Labels,
        delta: i64,
    ) {
        if !matches_all_terms(terms, workload) {
            return;
        }
        for term in terms {
            if let Some(value) = node_labels.get(&term.topology_key) {
                self.update(TopologyPair::new(&term.topology_key, value), delta);
            }
        }
    }

    /// Count `workload` once for every anti-affinity term it matches.
    fn update_with_anti_affinity_terms(
        &mut self,
        terms: &[AffinityTerm],
        workload: &Workload,
        node_labels: &Labels,
        delta: i64,
    ) {
        for term in terms.iter().filter(|t| t.matches(workload)) {
            if let Some(value) = node_labels.get(&term.topology_key) {
                self.update(TopologyPair::new(&term.topology_key, value), delta);
            }
        }
    }
}

pub(super) fn matches_all_terms(terms: &[AffinityTerm], workload: &Workload) -> bool {
    !terms.is_empty() && terms.iter().all(|t| t.matches(workload))
}

#[derive(Debug, Clone)]
struct PreFilterState {
    /// Domains where an existing workload's required anti-affinity selects
    /// the incoming workload.
    existing_anti_affinity_counts: TopologyCounts,
    /// Domains holding workloads that satisfy all of the incoming
    /// workload's required affinity terms.
    affinity_counts: TopologyCounts,
    /// Domains holding workloads selected by the incoming workload's
    /// required anti-affinity terms.
    anti_affinity_counts: TopologyCounts,
    pod_info: Arc<PodInfo>,
}

impl PreFilterState {
    fn update_with_pod(&mut self, existing: &PodInfo, node: &NodeInfo, delta: i64) {
        let Some(host) = node.host() else {
            return;
        };
        let incoming = &self.pod_info;
        self.existing_anti_affinity_counts.update_with_anti_affinity_terms(
            &existing.required_anti_affinity_terms,
            &incoming.workload,
            &host.labels,
            delta,
        );
        self.affinity_counts.update_with_affinity_terms(
            &incoming.required_affinity_terms,
            &existing.workload,
            &host.labels,
            delta,
        );
        self.anti_affinity_counts.update_with_anti_affinity_terms(
            &incoming.required_anti_affinity_terms,
            &existing.workload,
            &host.labels,
            delta,
        );
    }
}

fn existing_anti_affinity_counts(incoming: &Workload, snapshot: &Snapshot) -> TopologyCounts {
    let mut counts = TopologyCounts::default();
    for node in snapshot.have_pods_with_required_anti_affinity() {
        let Some(host) = node.host() else {
            continue;
        };
        for existing in &node.pods_with_required_anti_affinity {
            counts.update_with_anti_affinity_terms(
                &existing.required_anti_affinity_terms,
                incoming,
                &host.labels,
                1,
            );
        }
    }
    counts
}

fn incoming_affinity_counts(
    pod_info: &PodInfo,
    snapshot: &Snapshot,
) -> (TopologyCounts, TopologyCounts) {
    let mut affinity = TopologyCounts::default();
    let mut anti_affinity = TopologyCounts::default();
    if pod_info.required_affinity_terms.is_empty() && pod_info.required_anti_affinity_terms.is_empty() {
        return (affinity, anti_affinity);
    }
    for node in snapshot.list() {
        let Some(host) = node.host() else {
            continue;
        };
        for existing in &node.pods {
            affinity.update_with_affinity_terms(
                &pod_info.required_affinity_terms,
                &existing.workload,
                &host.labels,
                1,
            );
            anti_affinity.update_with_anti_affinity_terms(
                &pod_info.required_anti_affinity_terms,
                &existing.workload,
                &host.labels,
                1,
            );
        }
    }
    (affinity, anti_affinity)
}

impl PreFilterPlugin for InterPodAffinity {
    fn pre_filter(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status> {
        let pod_info = Arc::new(PodInfo::new(workload.clone()));
        let existing_anti_affinity_counts = existing_anti_affinity_counts(workload, snapshot);
        let (affinity_counts, anti_affinity_counts) = incoming_affinity_counts(&pod_info, snapshot);
        trace!(
            workload = %workload.full_name(),
            existing_anti_affinity = existing_anti_affinity_counts.0.len(),
            affinity = affinity_counts.0.len(),
            anti_affinity = anti_affinity_counts.0.len(),
            "inter-workload affinity domains counted"
        );
        state.write(
            PRE_FILTER_STATE_KEY,
            PreFilterState {
                existing_anti_affinity_counts,
                affinity_counts,
                anti_affinity_counts,
                pod_info,
            },
        );
        Ok(None)
    }

    fn extensions(&self) -> Option<&dyn PreFilterExtensions> {
        Some(self)
    }
}

impl PreFilterExtensions for InterPodAffinity {
    fn add_pod(
        &self,
        state: &mut CycleState,
        _to_schedule: &Workload,
        to_add: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        read_state_mut::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?.update_with_pod(to_add, node, 1);
        Ok(())
    }

    fn remove_pod(
        &self,
        state: &mut CycleState,
        _to_schedule: &Workload,
        to_remove: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        read_state_mut::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?.update_with_pod(to_remove, node, -1);
        Ok(())
    }
}

/// Every required affinity term must find a matching workload in the
/// host's domain. A workload whose terms select itself may start a new
/// group when no matching workload exists anywhere.
fn satisfies_pod_affinity(state: &PreFilterState, host: &Host) -> bool {
    let terms = &state.pod_info.required_affinity_terms;
    let mut pods_exist = true;
    for term in terms {
        let Some(value) = host.labels.get(&term.topology_key) else {
            return false;
        };
        if state.affinity_counts.get(&TopologyPair::new(&term.topology_key, value)) <= 0 {
            pods_exist = false;
        }
    }
    if pods_exist {
        return true;
    }
    state.affinity_counts.is_empty() && matches_all_terms(terms, &state.pod_info.workload)
}

fn satisfies_pod_anti_affinity(state: &PreFilterState, host: &Host) -> bool {
    if state.anti_affinity_counts.is_empty() {
        return true;
    }
    state.pod_info.required_anti_affinity_terms.iter().all(|term| {
        host.labels
            .get(&term.topology_key)
            .is_none_or(|value| state.anti_affinity_counts.get(&TopologyPair::new(&term.topology_key, value)) <= 0)
    })
}

fn satisfies_existing_pods_anti_affinity(state: &PreFilterState, host: &Host) -> bool {
    if state.existing_anti_affinity_counts.is_empty() {
        return true;
    }
    host.labels
        .iter()
        .all(|(k, v)| state.existing_anti_affinity_counts.get(&TopologyPair::new(k, v)) <= 0)
}

impl FilterPlugin for InterPodAffinity {
    fn filter(&self, state: &CycleState, _workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        let state = read_state::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?;

        if !satisfies_pod_affinity(state, host) {
            return Err(Status::unresolvable(ERR_REASON_AFFINITY_RULES_NOT_MATCH));
        }
        if !satisfies_pod_anti_affinity(state, host) {
            return Err(Status::unschedulable(ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH));
        }
        if !satisfies_existing_pods_anti_affinity(state, host) {
            return Err(Status::unschedulable(ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH));
        }
        Ok(())
    }
}
