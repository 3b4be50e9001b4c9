use std::collections::HashMap;
use std::sync::Arc;

use fleetgrid_framework::{
    CycleState, MAX_NODE_SCORE, NodeScore, PreScorePlugin, ScoreExtensions, ScorePlugin, Snapshot,
    Status,
};
use fleetgrid_state::{AffinityTerm, Host, NodeInfo, PodInfo, WeightedAffinityTerm, Workload};

use super::InterPodAffinity;
use crate::helper::{host_of, read_state};

const PRE_SCORE_STATE_KEY: &str = "PreScoreInterPodAffinity";

/// topology key → topology value → accumulated weight.
type TopologyScore = HashMap<String, HashMap<String, i64>>;

#[derive(Debug, Clone, Default)]
struct PreScoreState {
    topology_score: TopologyScore,
}

impl PreScoreState {
    fn process_term(&mut self, term: &AffinityTerm, weight: i64, candidate: &Workload, host: &Host) {
        if host.labels.is_empty() || !term.matches(candidate) {
            return;
        }
        if let Some(value) = host.labels.get(&term.topology_key) {
            *self
                .topology_score
                .entry(term.topology_key.clone())
                .or_default()
                .entry(value.clone())
                .or_insert(0) += weight;
        }
    }

    fn process_terms(
        &mut self,
        terms: &[WeightedAffinityTerm],
        candidate: &Workload,
        host: &Host,
        multiplier: i64,
    ) {
        for t in terms {
            self.process_term(&t.term, i64::from(t.weight) * multiplier, candidate, host);
        }
    }

    /// Credit the domains of `host` for the affinity relations between the
    /// incoming workload and `existing`, in both directions.
    fn process_existing(
        &mut self,
        incoming: &PodInfo,
        existing: &PodInfo,
        host: &Host,
        hard_pod_affinity_weight: i64,
    ) {
        self.process_terms(&incoming.preferred_affinity_terms, &existing.workload, host, 1);
        self.process_terms(&incoming.preferred_anti_affinity_terms, &existing.workload, host, -1);

        if hard_pod_affinity_weight > 0 {
            for term in &existing.required_affinity_terms {
                self.process_term(term, hard_pod_affinity_weight, &incoming.workload, host);
            }
        }
        self.process_terms(&existing.preferred_affinity_terms, &incoming.workload, host, 1);
        self.process_terms(&existing.preferred_anti_affinity_terms, &incoming.workload, host, -1);
    }
}

impl PreScorePlugin for InterPodAffinity {
    fn pre_score(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        _nodes: &[&NodeInfo],
    ) -> Result<(), Status> {
        let incoming = Arc::new(PodInfo::new(workload.clone()));
        let has_constraints = !incoming.preferred_affinity_terms.is_empty()
            || !incoming.preferred_anti_affinity_terms.is_empty();

        let mut s = PreScoreState::default();
        // Without preferred terms of its own the incoming workload can only
        // be scored by existing workloads that declare affinity.
        let nodes: Vec<&NodeInfo> = if has_constraints {
            snapshot.list().collect()
        } else {
            snapshot.have_pods_with_affinity().collect()
        };
        for node in nodes {
            let Some(host) = node.host() else {
                continue;
            };
            let existing = if has_constraints {
                &node.pods
            } else {
                &node.pods_with_affinity
            };
            for pod in existing {
                s.process_existing(&incoming, pod, host, i64::from(self.hard_pod_affinity_weight));
            }
        }
        state.write(PRE_SCORE_STATE_KEY, s);
        Ok(())
    }
}

impl ScorePlugin for InterPodAffinity {
    fn score(&self, state: &CycleState, _workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        let host = host_of(node)?;
        let s = read_state::<PreScoreState>(state, PRE_SCORE_STATE_KEY)?;
        Ok(s.topology_score
            .iter()
            .filter_map(|(key, by_value)| {
                host.labels.get(key).and_then(|v| by_value.get(v)).copied()
            })
            .sum())
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for InterPodAffinity {
    /// Min-max scaling into `[0, MAX_NODE_SCORE]`; scores may be negative
    /// before normalization.
    fn normalize_score(
        &self,
        state: &CycleState,
        _workload: &Workload,
        scores: &mut [NodeScore],
    ) -> Result<(), Status> {
        let s = read_state::<PreScoreState>(state, PRE_SCORE_STATE_KEY)?;
        if s.topology_score.is_empty() {
            return Ok(());
        }
        let min = scores.iter().map(|s| s.score).min().unwrap_or(0);
        let max = scores.iter().map(|s| s.score).max().unwrap_or(0);
        let diff = max - min;
        for score in scores.iter_mut() {
            score.score = if diff > 0 {
                (MAX_NODE_SCORE as f64 * ((score.score - min) as f64 / diff as f64)) as i64
            } else {
                0
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpodaffinity::InterPodAffinityArgs;
    use crate::interpodaffinity::testutil::*;
    use fleetgrid_state::LABEL_TOPOLOGY_ZONE;

    fn run(hard_weight: i32, incoming: &Workload, snapshot: &Snapshot) -> (Vec<i64>, Vec<i64>) {
        let p = InterPodAffinity::from_args(InterPodAffinityArgs {
            hard_pod_affinity_weight: hard_weight,
        })
        .unwrap();
        let nodes: Vec<&NodeInfo> = snapshot.list().collect();
        let mut state = CycleState::new();
        p.pre_score(&mut state, incoming, snapshot, &nodes).unwrap();
        let mut scores: Vec<NodeScore> = nodes
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: p.score(&state, incoming, n).unwrap(),
            })
            .collect();
        let raw = scores.iter().map(|s| s.score).collect();
        p.normalize_score(&state, incoming, &mut scores).unwrap();
        (raw, scores.iter().map(|s| s.score).collect())
    }

    fn zones() -> Vec<Host> {
        vec![make_host("h1", "a"), make_host("h2", "a"), make_host("h3", "b")]
    }

    #[test]
    fn preferred_affinity_favors_the_matching_zone() {
        let snapshot = Snapshot::from_hosts(zones(), vec![make_workload("db", "db", "h1")]);
        let incoming = with_affinity(
            make_workload("in", "web", ""),
            preferred(vec![weighted(5, term("db", LABEL_TOPOLOGY_ZONE))]),
            None,
        );
        let (raw, normalized) = run(1, &incoming, &snapshot);
        assert_eq!(raw, vec![5, 5, 0]);
        assert_eq!(normalized, vec![100, 100, 0]);
    }

    #[test]
    fn preferred_anti_affinity_pushes_away() {
        let snapshot = Snapshot::from_hosts(zones(), vec![make_workload("web-1", "web", "h1")]);
        let incoming = with_affinity(
            make_workload("in", "web", ""),
            None,
            preferred(vec![weighted(10, term("web", LABEL_TOPOLOGY_ZONE))]),
        );
        let (raw, normalized) = run(1, &incoming, &snapshot);
        assert_eq!(raw, vec![-10, -10, 0]);
        assert_eq!(normalized, vec![0, 0, 100]);
    }

    #[test]
    fn existing_required_affinity_uses_hard_weight() {
        let existing = with_affinity(
            make_workload("api", "api", "h3"),
            required(vec![term("web", LABEL_TOPOLOGY_ZONE)]),
            None,
        );
        let snapshot = Snapshot::from_hosts(zones(), vec![existing]);
        let incoming = make_workload("in", "web", "");

        let (raw, normalized) = run(7, &incoming, &snapshot);
        assert_eq!(raw, vec![0, 0, 7]);
        assert_eq!(normalized, vec![0, 0, 100]);

        let (raw, _) = run(0, &incoming, &snapshot);
        assert_eq!(raw, vec![0, 0, 0]);
    }

    #[test]
    fn nothing_to_score_leaves_zeros() {
        let snapshot = Snapshot::from_hosts(zones(), vec![make_workload("db", "db", "h1")]);
        let (raw, normalized) = run(1, &make_workload("in", "web", ""), &snapshot);
        assert_eq!(raw, vec![0, 0, 0]);
        assert_eq!(normalized, vec![0, 0, 0]);
    }
}
