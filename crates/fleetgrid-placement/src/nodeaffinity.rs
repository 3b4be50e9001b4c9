//! Host affinity: required terms filter hosts, preferred terms score them.
//!
//! The profile may add an administrator-configured affinity that applies
//! to every workload on top of the workload's own terms.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleetgrid_framework::{
    CycleState, FilterPlugin, FrameworkResult, MAX_NODE_SCORE, NodeScore, Plugin, PluginInstance,
    PreFilterPlugin, PreFilterResult, PreScorePlugin, ScoreExtensions, ScorePlugin, Snapshot,
    Status, decode_args, default_normalize_score,
};
use fleetgrid_state::{
    FIELD_HOST_NAME, Host, Labels, NodeAffinity, NodeInfo, NodeSelector, NodeSelectorOperator,
    PreferredSchedulingTerm, Workload,
};

use crate::helper::{host_of, invalid_args};
use crate::names::NODE_AFFINITY;

/// Reason given when the workload's own affinity or node selector fails.
pub const ERR_REASON_POD: &str = "node(s) didn't match Pod's node affinity/selector";
/// Reason given when the configured `added_affinity` fails.
pub const ERR_REASON_ENFORCED: &str = "node(s) didn't match scheduler-enforced node affinity";

const PRE_FILTER_STATE_KEY: &str = "PreFilterNodeAffinity";
const PRE_SCORE_STATE_KEY: &str = "PreScoreNodeAffinity";

/// Args of the `NodeAffinity` plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAffinityArgs {
    /// Applied to every workload in addition to its own affinity.
    pub added_affinity: Option<NodeAffinity>,
}

/// Host label and field affinity.
#[derive(Debug)]
pub struct NodeAffinityPlugin {
    added_required: Option<NodeSelector>,
    added_preferred: Vec<PreferredSchedulingTerm>,
}

#[derive(Debug, Clone)]
struct PreScoreState(Vec<PreferredSchedulingTerm>);

/// The node selector map plus the required affinity of a workload.
#[derive(Debug, Clone, Default)]
struct RequiredNodeAffinity {
    node_selector: Labels,
    required: Option<NodeSelector>,
}

impl RequiredNodeAffinity {
    fn of(workload: &Workload) -> Self {
        Self {
            node_selector: workload.node_selector.clone(),
            required: workload.node_affinity().and_then(|a| a.required.clone()),
        }
    }

    fn matches(&self, host: &Host) -> bool {
        let selector_ok = self
            .node_selector
            .iter()
            .all(|(k, v)| host.labels.get(k) == Some(v));
        selector_ok && self.required.as_ref().is_none_or(|s| s.matches(host))
    }
}

/// Whether `host` satisfies the workload's node selector and required
/// node affinity.
pub fn required_affinity_matches(workload: &Workload, host: &Host) -> bool {
    RequiredNodeAffinity::of(workload).matches(host)
}

impl NodeAffinityPlugin {
    /// Validate `args`; preferred term weights must be within 1..=100.
    pub fn from_args(args: NodeAffinityArgs) -> FrameworkResult<Self> {
        let (added_required, added_preferred) = match args.added_affinity {
            Some(a) => (a.required, a.preferred),
            None => (None, Vec::new()),
        };
        for (i, term) in added_preferred.iter().enumerate() {
            if !(1..=100).contains(&term.weight) {
                return Err(invalid_args(
                    NODE_AFFINITY,
                    format!("added_affinity.preferred[{i}].weight not in valid range [1, 100]"),
                ));
            }
        }
        Ok(Self {
            added_required,
            added_preferred,
        })
    }

    fn preferred_terms(&self, workload: &Workload) -> Vec<PreferredSchedulingTerm> {
        let mut terms = self.added_preferred.clone();
        if let Some(affinity) = workload.node_affinity() {
            terms.extend(affinity.preferred.iter().cloned());
        }
        terms
    }
}

/// Build the plugin from its optional TOML args.
pub fn new(args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let plugin = Arc::new(NodeAffinityPlugin::from_args(decode_args(NODE_AFFINITY, args)?)?);
    Ok(PluginInstance::new(NODE_AFFINITY)
        .with_pre_filter(plugin.clone())
        .with_filter(plugin.clone())
        .with_pre_score(plugin.clone())
        .with_score(plugin))
}

impl Plugin for NodeAffinityPlugin {
    fn name(&self) -> &str {
        NODE_AFFINITY
    }
}

impl PreFilterPlugin for NodeAffinityPlugin {
    fn pre_filter(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        _snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status> {
        let required = RequiredNodeAffinity::of(workload);
        let names = required.required.as_ref().and_then(host_names_from_terms);
        state.write(PRE_FILTER_STATE_KEY, required);

        match names {
            Some(names) if names.is_empty() => Err(Status::unresolvable(ERR_REASON_POD)),
            other => Ok(other),
        }
    }
}

/// The explicit host-name allow-list implied by `selector`, if every term
/// pins `metadata.name` with `In`. Terms are ORed, so their lists are
/// unioned; several pins within one term intersect.
fn host_names_from_terms(selector: &NodeSelector) -> Option<BTreeSet<String>> {
    let mut all = BTreeSet::new();
    for term in &selector.terms {
        let mut term_names: Option<BTreeSet<String>> = None;
        for r in &term.match_fields {
            if r.key != FIELD_HOST_NAME || r.operator != NodeSelectorOperator::In {
                continue;
            }
            let values: BTreeSet<String> = r.values.iter().cloned().collect();
            term_names = Some(match term_names {
                None => values,
                Some(prev) => prev.intersection(&values).cloned().collect(),
            });
        }
        all.extend(term_names?);
    }
    Some(all)
}

impl FilterPlugin for NodeAffinityPlugin {
    fn filter(&self, state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        if let Some(added) = &self.added_required {
            if !added.matches(host) {
                return Err(Status::unresolvable(ERR_REASON_ENFORCED));
            }
        }
        let matched = match state.read::<RequiredNodeAffinity>(PRE_FILTER_STATE_KEY) {
            Some(required) => required.matches(host),
            None => required_affinity_matches(workload, host),
        };
        if !matched {
            return Err(Status::unresolvable(ERR_REASON_POD));
        }
        Ok(())
    }
}

impl PreScorePlugin for NodeAffinityPlugin {
    fn pre_score(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        _snapshot: &Snapshot,
        _nodes: &[&NodeInfo],
    ) -> Result<(), Status> {
        state.write(PRE_SCORE_STATE_KEY, PreScoreState(self.preferred_terms(workload)));
        Ok(())
    }
}

impl ScorePlugin for NodeAffinityPlugin {
    /// Sum of the weights of all preferred terms `node` matches.
    fn score(&self, state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        let host = host_of(node)?;
        let computed;
        let terms = match state.read::<PreScoreState>(PRE_SCORE_STATE_KEY) {
            Some(s) => &s.0,
            None => {
                computed = self.preferred_terms(workload);
                &computed
            }
        };
        Ok(terms
            .iter()
            .filter(|t| t.weight != 0 && t.preference.matches(host))
            .map(|t| i64::from(t.weight))
            .sum())
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for NodeAffinityPlugin {
    fn normalize_score(
        &self,
        _state: &CycleState,
        _workload: &Workload,
        scores: &mut [NodeScore],
    ) -> Result<(), Status> {
        default_normalize_score(MAX_NODE_SCORE, false, scores);
        Ok(())
    }
}
