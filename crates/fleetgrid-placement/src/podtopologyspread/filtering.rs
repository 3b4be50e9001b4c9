use std::collections::HashMap;

use fleetgrid_framework::{
    CycleState, FilterPlugin, PreFilterExtensions, PreFilterPlugin, PreFilterResult, Snapshot,
    Status,
};
use fleetgrid_state::{NodeInfo, PodInfo, UnsatisfiableConstraintAction, Workload};

use super::{Constraint, PodTopologySpread, count_matching, has_all_topology_keys};
use crate::helper::{TopologyPair, host_of, read_state, read_state_mut};
use crate::nodeaffinity::required_affinity_matches;

/// Reason given when placing the workload would exceed `max_skew`.
pub const ERR_REASON_CONSTRAINTS_NOT_MATCH: &str =
    "node(s) didn't match pod topology spread constraints";
/// Reason given when the host lacks a constraint's topology key.
pub const ERR_REASON_NODE_LABEL_NOT_MATCH: &str =
    "node(s) didn't match pod topology spread constraints (missing required label)";

const PRE_FILTER_STATE_KEY: &str = "PreFilterPodTopologySpread";

#[derive(Debug, Clone, Default)]
struct PreFilterState {
    constraints: Vec<Constraint>,
    /// Matching workloads per domain, over hosts the workload could run on.
    tp_pair_to_match_num: HashMap<TopologyPair, i64>,
}

impl PreFilterState {
    /// Count in the emptiest domain of `key`.
    fn min_match_num(&self, key: &str) -> i64 {
        self.tp_pair_to_match_num
            .iter()
            .filter(|(pair, _)| pair.key == key)
            .map(|(_, n)| *n)
            .min()
            .unwrap_or(0)
    }

    fn update_with_pod(&mut self, updated: &PodInfo, incoming: &Workload, node: &NodeInfo, delta: i64) {
        if updated.workload.namespace != incoming.namespace {
            return;
        }
        let Some(host) = node.host() else {
            return;
        };
        if !has_all_topology_keys(&host.labels, &self.constraints)
            || !required_affinity_matches(incoming, host)
        {
            return;
        }
        for c in &self.constraints {
            if !c.selects(&updated.workload.labels) {
                continue;
            }
            if let Some(value) = host.labels.get(&c.topology_key) {
                *self
                    .tp_pair_to_match_num
                    .entry(TopologyPair::new(&c.topology_key, value))
                    .or_insert(0) += delta;
            }
        }
    }
}

impl PodTopologySpread {
    fn pre_filter_state(&self, workload: &Workload, snapshot: &Snapshot) -> PreFilterState {
        let constraints = self.constraints_for(workload, UnsatisfiableConstraintAction::DoNotSchedule);
        if constraints.is_empty() {
            return PreFilterState::default();
        }

        let mut counts: HashMap<TopologyPair, i64> = HashMap::new();
        for node in snapshot.list() {
            let Some(host) = node.host() else {
                continue;
            };
            if !required_affinity_matches(workload, host)
                || !has_all_topology_keys(&host.labels, &constraints)
            {
                continue;
            }
            for c in &constraints {
                if let Some(value) = host.labels.get(&c.topology_key) {
                    *counts.entry(TopologyPair::new(&c.topology_key, value)).or_insert(0) +=
                        count_matching(&node.pods, c, &workload.namespace);
                }
            }
        }
        PreFilterState {
            constraints,
            tp_pair_to_match_num: counts,
        }
    }
}

impl PreFilterPlugin for PodTopologySpread {
    fn pre_filter(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status> {
        state.write(PRE_FILTER_STATE_KEY, self.pre_filter_state(workload, snapshot));
        Ok(None)
    }

    fn extensions(&self) -> Option<&dyn PreFilterExtensions> {
        Some(self)
    }
}

impl PreFilterExtensions for PodTopologySpread {
    fn add_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_add: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        read_state_mut::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?.update_with_pod(to_add, to_schedule, node, 1);
        Ok(())
    }

    fn remove_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_remove: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        read_state_mut::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?.update_with_pod(to_remove, to_schedule, node, -1);
        Ok(())
    }
}

impl FilterPlugin for PodTopologySpread {
    fn filter(&self, state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        let s = read_state::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?;

        for c in &s.constraints {
            let Some(value) = host.labels.get(&c.topology_key) else {
                return Err(Status::unresolvable(ERR_REASON_NODE_LABEL_NOT_MATCH));
            };
            let self_match = i64::from(c.selects(&workload.labels));
            let match_num = s
                .tp_pair_to_match_num
                .get(&TopologyPair::new(&c.topology_key, value))
                .copied()
                .unwrap_or(0);
            let skew = match_num + self_match - s.min_match_num(&c.topology_key);
            if skew > c.max_skew {
                return Err(Status::unschedulable(ERR_REASON_CONSTRAINTS_NOT_MATCH));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podtopologyspread::PodTopologySpreadArgs;
    use crate::podtopologyspread::testutil::*;
    use fleetgrid_framework::Code;
    use fleetgrid_state::{Host, LABEL_TOPOLOGY_ZONE};

    fn plugin() -> PodTopologySpread {
        PodTopologySpread::from_args(PodTopologySpreadArgs::default()).unwrap()
    }

    fn codes(incoming: &Workload, snapshot: &Snapshot) -> Vec<Code> {
        let p = plugin();
        let mut state = CycleState::new();
        p.pre_filter(&mut state, incoming, snapshot).unwrap();
        snapshot
            .list()
            .map(|n| match p.filter(&state, incoming, n) {
                Ok(()) => Code::Success,
                Err(s) => s.code(),
            })
            .collect()
    }

    fn spread_by_zone(max_skew: i32) -> Workload {
        let mut w = make_workload("in", "web", "");
        w.topology_spread_constraints = vec![spread(
            LABEL_TOPOLOGY_ZONE,
            max_skew,
            UnsatisfiableConstraintAction::DoNotSchedule,
            "web",
        )];
        w
    }

    fn four_hosts() -> Vec<Host> {
        vec![
            make_host("h1", "a"),
            make_host("h2", "a"),
            make_host("h3", "b"),
            make_host("h4", "b"),
        ]
    }

    fn existing() -> Vec<Workload> {
        vec![
            make_workload("p1", "web", "h1"),
            make_workload("p2", "web", "h2"),
            make_workload("p3", "web", "h3"),
        ]
    }

    #[test]
    fn skew_above_max_is_rejected() {
        let snapshot = Snapshot::from_hosts(four_hosts(), existing());
        assert_eq!(
            codes(&spread_by_zone(1), &snapshot),
            vec![Code::Unschedulable, Code::Unschedulable, Code::Success, Code::Success]
        );
        assert!(codes(&spread_by_zone(2), &snapshot)
            .iter()
            .all(|c| *c == Code::Success));
    }

    #[test]
    fn host_missing_the_key_is_unresolvable() {
        let mut hosts = four_hosts();
        hosts.push(make_host("h5", ""));
        let snapshot = Snapshot::from_hosts(hosts, existing());
        let p = plugin();
        let incoming = spread_by_zone(1);
        let mut state = CycleState::new();
        p.pre_filter(&mut state, &incoming, &snapshot).unwrap();
        let status = p
            .filter(&state, &incoming, snapshot.get("h5").unwrap())
            .unwrap_err();
        assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(status.message(), ERR_REASON_NODE_LABEL_NOT_MATCH);
    }

    #[test]
    fn other_namespaces_and_labels_are_not_counted() {
        let mut others = make_workload("p4", "web", "h3");
        others.namespace = "other".to_string();
        let mut pods = existing();
        pods.push(others);
        pods.push(make_workload("p5", "db", "h4"));
        let snapshot = Snapshot::from_hosts(four_hosts(), pods);
        assert_eq!(
            codes(&spread_by_zone(1), &snapshot),
            vec![Code::Unschedulable, Code::Unschedulable, Code::Success, Code::Success]
        );
    }

    #[test]
    fn hosts_outside_node_affinity_do_not_form_domains() {
        let mut hosts = four_hosts();
        hosts.push(make_host("h5", "c"));
        let snapshot = Snapshot::from_hosts(hosts, existing());

        // Zone c is empty, so counting it makes every other zone too full.
        let unrestricted = codes(&spread_by_zone(1), &snapshot);
        assert_eq!(unrestricted[2], Code::Unschedulable);

        let mut restricted = spread_by_zone(1);
        restricted.node_selector = labels(&[("pool", "general")]);
        let mut hosts = four_hosts();
        for h in &mut hosts {
            h.labels.insert("pool".to_string(), "general".to_string());
        }
        hosts.push(make_host("h5", "c"));
        let snapshot = Snapshot::from_hosts(hosts, existing());
        let got = codes(&restricted, &snapshot);
        assert_eq!(got[2], Code::Success);
        assert_eq!(got[3], Code::Success);
    }

    #[test]
    fn removing_a_workload_updates_counts() {
        let snapshot = Snapshot::from_hosts(four_hosts(), existing());
        let p = plugin();
        let incoming = spread_by_zone(1);
        let mut state = CycleState::new();
        p.pre_filter(&mut state, &incoming, &snapshot).unwrap();

        let h1 = snapshot.get("h1").unwrap();
        assert!(p.filter(&state, &incoming, h1).is_err());

        let victim = h1.pods[0].clone();
        p.remove_pod(&mut state, &incoming, &victim, h1).unwrap();
        assert!(p.filter(&state, &incoming, h1).is_ok());

        p.add_pod(&mut state, &incoming, &victim, h1).unwrap();
        assert!(p.filter(&state, &incoming, h1).is_err());
    }

    #[test]
    fn no_hard_constraints_passes_everything() {
        let snapshot = Snapshot::from_hosts(four_hosts(), existing());
        let got = codes(&make_workload("in", "web", ""), &snapshot);
        assert!(got.iter().all(|c| *c == Code::Success));
    }
}
