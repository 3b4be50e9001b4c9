//! Even spreading of matching workloads across topology domains.
//!
//! `DoNotSchedule` constraints are enforced by Filter: placing the workload
//! must not push a domain more than `max_skew` above the emptiest domain.
//! `ScheduleAnyway` constraints only steer Score. Workloads without
//! constraints of their own get the profile's default constraints, with
//! a selector over the workload's own labels.

mod filtering;
mod scoring;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleetgrid_framework::{FrameworkResult, Plugin, PluginInstance, decode_args};
use fleetgrid_state::{
    LABEL_HOSTNAME, LABEL_TOPOLOGY_ZONE, LabelSelector, Labels, PodInfo, TopologySpreadConstraint,
    UnsatisfiableConstraintAction, Workload, selector_matches,
};

use crate::helper::invalid_args;
use crate::names::POD_TOPOLOGY_SPREAD;

pub use filtering::{ERR_REASON_CONSTRAINTS_NOT_MATCH, ERR_REASON_NODE_LABEL_NOT_MATCH};

/// Where default constraints come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultingType {
    /// Built-in constraints over hostname and zone.
    #[default]
    System,
    /// `default_constraints` from the args.
    List,
}

/// Args of the `PodTopologySpread` plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodTopologySpreadArgs {
    /// Applied to workloads that declare no constraints. Must not carry a
    /// label selector.
    pub default_constraints: Vec<TopologySpreadConstraint>,
    pub defaulting_type: DefaultingType,
}

/// Soft spreading over hosts (max skew 3) and zones (max skew 5).
pub fn system_default_constraints() -> Vec<TopologySpreadConstraint> {
    vec![
        TopologySpreadConstraint {
            max_skew: 3,
            topology_key: LABEL_HOSTNAME.to_string(),
            when_unsatisfiable: UnsatisfiableConstraintAction::ScheduleAnyway,
            label_selector: None,
        },
        TopologySpreadConstraint {
            max_skew: 5,
            topology_key: LABEL_TOPOLOGY_ZONE.to_string(),
            when_unsatisfiable: UnsatisfiableConstraintAction::ScheduleAnyway,
            label_selector: None,
        },
    ]
}

/// A spread constraint resolved for one workload.
#[derive(Debug, Clone, PartialEq)]
struct Constraint {
    max_skew: i64,
    topology_key: String,
    selector: Option<LabelSelector>,
}

impl Constraint {
    fn selects(&self, labels: &Labels) -> bool {
        selector_matches(self.selector.as_ref(), labels)
    }
}

/// Whether `labels` carries every topology key in `constraints`.
fn has_all_topology_keys(labels: &Labels, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|c| labels.contains_key(&c.topology_key))
}

/// Workloads in `namespace` selected by `constraint`.
fn count_matching(pods: &[Arc<PodInfo>], constraint: &Constraint, namespace: &str) -> i64 {
    pods.iter()
        .filter(|p| p.workload.namespace == namespace && constraint.selects(&p.workload.labels))
        .count() as i64
}

/// Spreads workloads evenly across topology domains.
#[derive(Debug)]
pub struct PodTopologySpread {
    default_constraints: Vec<TopologySpreadConstraint>,
    system_defaulted: bool,
}

impl PodTopologySpread {
    /// Validate `args` and resolve the default constraints.
    pub fn from_args(args: PodTopologySpreadArgs) -> FrameworkResult<Self> {
        match args.defaulting_type {
            DefaultingType::System => {
                if !args.default_constraints.is_empty() {
                    return Err(invalid_args(
                        POD_TOPOLOGY_SPREAD,
                        "default_constraints must be empty when defaulting_type is System",
                    ));
                }
                Ok(Self {
                    default_constraints: system_default_constraints(),
                    system_defaulted: true,
                })
            }
            DefaultingType::List => {
                validate_default_constraints(&args.default_constraints)?;
                Ok(Self {
                    default_constraints: args.default_constraints,
                    system_defaulted: false,
                })
            }
        }
    }

    /// The workload's constraints with the given action, or the defaults
    /// when it declares none.
    fn constraints_for(&self, workload: &Workload, action: UnsatisfiableConstraintAction) -> Vec<Constraint> {
        if !workload.topology_spread_constraints.is_empty() {
            return workload
                .topology_spread_constraints
                .iter()
                .filter(|c| c.when_unsatisfiable == action)
                .map(|c| Constraint {
                    max_skew: i64::from(c.max_skew),
                    topology_key: c.topology_key.clone(),
                    selector: c.label_selector.clone(),
                })
                .collect();
        }
        if workload.labels.is_empty() {
            return Vec::new();
        }
        let selector = LabelSelector {
            match_labels: workload.labels.clone(),
            match_expressions: Vec::new(),
        };
        self.default_constraints
            .iter()
            .filter(|c| c.when_unsatisfiable == action)
            .map(|c| Constraint {
                max_skew: i64::from(c.max_skew),
                topology_key: c.topology_key.clone(),
                selector: Some(selector.clone()),
            })
            .collect()
    }
}

fn validate_default_constraints(constraints: &[TopologySpreadConstraint]) -> FrameworkResult<()> {
    let mut seen = HashSet::new();
    for (i, c) in constraints.iter().enumerate() {
        if c.max_skew <= 0 {
            return Err(invalid_args(
                POD_TOPOLOGY_SPREAD,
                format!("default_constraints[{i}].max_skew must be greater than zero"),
            ));
        }
        if c.topology_key.is_empty() {
            return Err(invalid_args(
                POD_TOPOLOGY_SPREAD,
                format!("default_constraints[{i}].topology_key can not be empty"),
            ));
        }
        if c.label_selector.is_some() {
            return Err(invalid_args(
                POD_TOPOLOGY_SPREAD,
                format!("default_constraints[{i}].label_selector must not be set"),
            ));
        }
        if !seen.insert((c.topology_key.as_str(), c.when_unsatisfiable)) {
            return Err(invalid_args(
                POD_TOPOLOGY_SPREAD,
                format!("default_constraints[{i}] duplicates topology key {}", c.topology_key),
            ));
        }
    }
    Ok(())
}

/// Build the plugin from its optional TOML args.
pub fn new(args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let args = decode_args(POD_TOPOLOGY_SPREAD, args)?;
    let plugin = Arc::new(PodTopologySpread::from_args(args)?);
    Ok(PluginInstance::new(POD_TOPOLOGY_SPREAD)
        .with_pre_filter(plugin.clone())
        .with_filter(plugin.clone())
        .with_pre_score(plugin.clone())
        .with_score(plugin))
}

impl Plugin for PodTopologySpread {
    fn name(&self) -> &str {
        POD_TOPOLOGY_SPREAD
    }
}
