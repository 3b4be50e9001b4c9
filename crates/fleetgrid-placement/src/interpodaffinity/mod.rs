//! Inter-workload affinity and anti-affinity.
//!
//! Filter enforces the incoming workload's required terms and the required
//! anti-affinity terms of workloads already placed. Score adds preferred
//! term weights per topology domain, plus `hard_pod_affinity_weight` for
//! every existing workload whose required affinity selects the incoming one.

mod filtering;
mod scoring;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleetgrid_framework::{FrameworkResult, Plugin, PluginInstance, decode_args};

use crate::helper::invalid_args;
use crate::names::INTER_POD_AFFINITY;

pub use filtering::{
    ERR_REASON_AFFINITY_RULES_NOT_MATCH, ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH,
    ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH,
};

pub const MAX_HARD_POD_AFFINITY_WEIGHT: i32 = 100;

/// Args of the `InterPodAffinity` plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterPodAffinityArgs {
    /// Score given per existing workload whose required affinity selects
    /// the incoming workload.
    pub hard_pod_affinity_weight: i32,
}

impl Default for InterPodAffinityArgs {
    fn default() -> Self {
        Self {
            hard_pod_affinity_weight: 1,
        }
    }
}

/// Affinity and anti-affinity towards workloads already placed.
#[derive(Debug)]
pub struct InterPodAffinity {
    hard_pod_affinity_weight: i32,
}

impl InterPodAffinity {
    /// Validate `args`.
    pub fn from_args(args: InterPodAffinityArgs) -> FrameworkResult<Self> {
        if !(0..=MAX_HARD_POD_AFFINITY_WEIGHT).contains(&args.hard_pod_affinity_weight) {
            return Err(invalid_args(
                INTER_POD_AFFINITY,
                format!(
                    "hard_pod_affinity_weight not in valid range [0, {MAX_HARD_POD_AFFINITY_WEIGHT}]"
                ),
            ));
        }
        Ok(Self {
            hard_pod_affinity_weight: args.hard_pod_affinity_weight,
        })
    }
}

/// Build the plugin from its optional TOML args.
pub fn new(args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let args = decode_args(INTER_POD_AFFINITY, args)?;
    let plugin = Arc::new(InterPodAffinity::from_args(args)?);
    Ok(PluginInstance::new(INTER_POD_AFFINITY)
        .with_pre_filter(plugin.clone())
        .with_filter(plugin.clone())
        .with_pre_score(plugin.clone())
        .with_score(plugin))
}

impl Plugin for InterPodAffinity {
    fn name(&self) -> &str {
        INTER_POD_AFFINITY
    }
}
