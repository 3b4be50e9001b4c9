use std::collections::{HashMap, HashSet};

use fleetgrid_framework::{
    CycleState, MAX_NODE_SCORE, NodeScore, PreScorePlugin, ScoreExtensions, ScorePlugin, Snapshot,
    Status,
};
use fleetgrid_state::{LABEL_HOSTNAME, NodeInfo, UnsatisfiableConstraintAction, Workload};

use super::{Constraint, PodTopologySpread, count_matching, has_all_topology_keys};
use crate::helper::{TopologyPair, host_of, read_state};
use crate::nodeaffinity::required_affinity_matches;

const PRE_SCORE_STATE_KEY: &str = "PreScorePodTopologySpread";

#[derive(Debug, Clone, Default)]
struct PreScoreState {
    constraints: Vec<Constraint>,
    /// Candidate hosts lacking a required topology key; they score 0.
    ignored_nodes: HashSet<String>,
    /// Matching workloads per domain that contains at least one candidate.
    /// Hostname domains are counted directly on the host instead.
    topology_pair_to_pod_counts: HashMap<TopologyPair, i64>,
    /// Per constraint, `ln(domains + 2)`: spreading over many domains
    /// weighs each match more.
    topology_normalizing_weight: Vec<f64>,
}

fn topology_normalizing_weight(size: usize) -> f64 {
    ((size + 2) as f64).ln()
}

fn score_for_count(count: i64, max_skew: i64, weight: f64) -> f64 {
    count as f64 * weight + (max_skew - 1) as f64
}

impl PodTopologySpread {
    fn pre_score_state(&self, workload: &Workload, snapshot: &Snapshot, nodes: &[&NodeInfo]) -> PreScoreState {
        let constraints = self.constraints_for(workload, UnsatisfiableConstraintAction::ScheduleAnyway);
        if constraints.is_empty() {
            return PreScoreState::default();
        }
        let require_all_topologies =
            !workload.topology_spread_constraints.is_empty() || !self.system_defaulted;

        let mut s = PreScoreState {
            constraints,
            ..Default::default()
        };
        let mut topology_size = vec![0usize; s.constraints.len()];
        for node in nodes {
            let Some(host) = node.host() else {
                continue;
            };
            if require_all_topologies && !has_all_topology_keys(&host.labels, &s.constraints) {
                s.ignored_nodes.insert(host.name.clone());
                continue;
            }
            for (i, c) in s.constraints.iter().enumerate() {
                if c.topology_key == LABEL_HOSTNAME {
                    continue;
                }
                let value = host.labels.get(&c.topology_key).map_or("", String::as_str);
                let pair = TopologyPair::new(&c.topology_key, value);
                if !s.topology_pair_to_pod_counts.contains_key(&pair) {
                    s.topology_pair_to_pod_counts.insert(pair, 0);
                    topology_size[i] += 1;
                }
            }
        }

        s.topology_normalizing_weight = s
            .constraints
            .iter()
            .zip(&topology_size)
            .map(|(c, size)| {
                let size = if c.topology_key == LABEL_HOSTNAME {
                    nodes.len() - s.ignored_nodes.len()
                } else {
                    *size
                };
                topology_normalizing_weight(size)
            })
            .collect();

        for node in snapshot.list() {
            let Some(host) = node.host() else {
                continue;
            };
            if !has_all_topology_keys(&host.labels, &s.constraints)
                || !required_affinity_matches(workload, host)
            {
                continue;
            }
            for c in &s.constraints {
                let value = host.labels.get(&c.topology_key).map_or("", String::as_str);
                let count = count_matching(&node.pods, c, &workload.namespace);
                if let Some(total) = s
                    .topology_pair_to_pod_counts
                    .get_mut(&TopologyPair::new(&c.topology_key, value))
                {
                    *total += count;
                }
            }
        }
        s
    }
}

impl PreScorePlugin for PodTopologySpread {
    fn pre_score(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        nodes: &[&NodeInfo],
    ) -> Result<(), Status> {
        state.write(PRE_SCORE_STATE_KEY, self.pre_score_state(workload, snapshot, nodes));
        Ok(())
    }
}

impl ScorePlugin for PodTopologySpread {
    /// Higher means more matching workloads nearby; normalization inverts it.
    fn score(&self, state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        let host = host_of(node)?;
        let s = read_state::<PreScoreState>(state, PRE_SCORE_STATE_KEY)?;
        if s.ignored_nodes.contains(&host.name) {
            return Ok(0);
        }

        let mut score = 0.0;
        for (i, c) in s.constraints.iter().enumerate() {
            let Some(value) = host.labels.get(&c.topology_key) else {
                continue;
            };
            let count = if c.topology_key == LABEL_HOSTNAME {
                count_matching(&node.pods, c, &workload.namespace)
            } else {
                s.topology_pair_to_pod_counts
                    .get(&TopologyPair::new(&c.topology_key, value))
                    .copied()
                    .unwrap_or(0)
            };
            score += score_for_count(count, c.max_skew, s.topology_normalizing_weight[i]);
        }
        Ok(score.round() as i64)
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for PodTopologySpread {
    /// Invert into `[0, MAX_NODE_SCORE]` so the least crowded host scores
    /// highest. Ignored hosts score 0.
    fn normalize_score(
        &self,
        state: &CycleState,
        _workload: &Workload,
        scores: &mut [NodeScore],
    ) -> Result<(), Status> {
        let s = read_state::<PreScoreState>(state, PRE_SCORE_STATE_KEY)?;
        if s.constraints.is_empty() {
            return Ok(());
        }

        let counted = || scores.iter().filter(|n| !s.ignored_nodes.contains(&n.name));
        let min = counted().map(|n| n.score).min().unwrap_or(0);
        let max = counted().map(|n| n.score).max().unwrap_or(0);
        for n in scores.iter_mut() {
            n.score = if s.ignored_nodes.contains(&n.name) {
                0
            } else if max == 0 {
                MAX_NODE_SCORE
            } else {
                MAX_NODE_SCORE * (max + min - n.score) / max
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podtopologyspread::testutil::*;
    use crate::podtopologyspread::{DefaultingType, PodTopologySpreadArgs, system_default_constraints};
    use fleetgrid_state::{Host, LABEL_TOPOLOGY_ZONE};

    fn run(plugin: &PodTopologySpread, incoming: &Workload, snapshot: &Snapshot) -> (Vec<i64>, Vec<i64>) {
        let nodes: Vec<&NodeInfo> = snapshot.list().collect();
        let mut state = CycleState::new();
        plugin.pre_score(&mut state, incoming, snapshot, &nodes).unwrap();
        let mut scores: Vec<NodeScore> = nodes
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: plugin.score(&state, incoming, n).unwrap(),
            })
            .collect();
        let raw = scores.iter().map(|n| n.score).collect();
        plugin.normalize_score(&state, incoming, &mut scores).unwrap();
        (raw, scores.iter().map(|n| n.score).collect())
    }

    fn system() -> PodTopologySpread {
        PodTopologySpread::from_args(PodTopologySpreadArgs::default()).unwrap()
    }

    fn soft(key: &str, max_skew: i32) -> Workload {
        let mut w = make_workload("in", "web", "");
        w.topology_spread_constraints = vec![spread(
            key,
            max_skew,
            UnsatisfiableConstraintAction::ScheduleAnyway,
            "web",
        )];
        w
    }

    #[test]
    fn hostname_spread_prefers_emptier_hosts() {
        let hosts = vec![make_host("h1", "a"), make_host("h2", "a"), make_host("h3", "a")];
        let pods = vec![
            make_workload("p1", "web", "h1"),
            make_workload("p2", "web", "h1"),
            make_workload("p3", "web", "h2"),
        ];
        let snapshot = Snapshot::from_hosts(hosts, pods);
        let (raw, normalized) = run(&system(), &soft(LABEL_HOSTNAME, 1), &snapshot);
        // ln(5) per matching workload.
        assert_eq!(raw, vec![3, 2, 0]);
        assert_eq!(normalized, vec![0, 33, 100]);
    }

    #[test]
    fn zone_spread_with_ignored_host() {
        let hosts = vec![
            make_host("h1", "a"),
            make_host("h2", "a"),
            make_host("h3", "b"),
            make_host("h4", ""),
        ];
        let pods = vec![make_workload("p1", "web", "h1")];
        let snapshot = Snapshot::from_hosts(hosts, pods);
        let (raw, normalized) = run(&system(), &soft(LABEL_TOPOLOGY_ZONE, 2), &snapshot);
        // Two zones: ln(4) per match plus max_skew - 1.
        assert_eq!(raw, vec![2, 2, 1, 0]);
        assert_eq!(normalized, vec![50, 50, 100, 0]);
    }

    #[test]
    fn system_defaults_spread_by_host_and_zone() {
        let hosts = vec![make_host("h1", "a"), make_host("h2", "b")];
        let pods = vec![make_workload("p1", "web", "h1")];
        let snapshot = Snapshot::from_hosts(hosts, pods);
        let (raw, normalized) = run(&system(), &make_workload("in", "web", ""), &snapshot);
        assert_eq!(raw, vec![9, 6]);
        assert_eq!(normalized, vec![66, 100]);
    }

    #[test]
    fn listed_defaults_ignore_hosts_without_keys() {
        let plugin = PodTopologySpread::from_args(PodTopologySpreadArgs {
            default_constraints: system_default_constraints(),
            defaulting_type: DefaultingType::List,
        })
        .unwrap();
        let hosts: Vec<Host> = vec![make_host("h1", "a"), make_host("h2", "")];
        let snapshot = Snapshot::from_hosts(hosts, vec![]);
        let (_, normalized) = run(&plugin, &make_workload("in", "web", ""), &snapshot);
        assert_eq!(normalized, vec![100, 0]);
    }

    #[test]
    fn unlabeled_workload_is_not_spread() {
        let snapshot = Snapshot::from_hosts(vec![make_host("h1", "a")], vec![]);
        let (raw, normalized) = run(&system(), &Workload::default(), &snapshot);
        assert_eq!(raw, vec![0]);
        assert_eq!(normalized, vec![0]);
    }
}
