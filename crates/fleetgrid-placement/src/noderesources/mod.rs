//! Resource-based plugins.
//!
//! - `NodeResourcesFit` filters hosts without room for the workload and
//!   scores the rest with one of three strategies: least allocated, most
//!   allocated, or a requested-to-capacity ratio shape.
//! - `NodeResourcesBalancedAllocation` favors hosts whose utilization is
//!   even across resources.

mod allocation;
mod balanced;
mod fit;

pub use balanced::{BalancedAllocation, new as new_balanced_allocation};
pub use fit::{Fit, InsufficientResource, fits_request, new as new_fit};

use serde::{Deserialize, Serialize};

use fleetgrid_framework::{FrameworkResult, MAX_NODE_SCORE};
use fleetgrid_state::{RESOURCE_CPU, RESOURCE_MEMORY};

use crate::helper::{FunctionShapePoint, invalid_args};

/// Highest score allowed in a shape breakpoint. Shape scores are scaled
/// up to `MAX_NODE_SCORE`.
pub const MAX_CUSTOM_PRIORITY_SCORE: i64 = 10;
/// Upper bound of utilization, in percent.
pub const MAX_UTILIZATION: i64 = 100;
pub const MIN_RESOURCE_WEIGHT: i64 = 1;
pub const MAX_RESOURCE_WEIGHT: i64 = 100;

// ── Args ───────────────────────────────────────────────────────────

/// How `NodeResourcesFit` scores a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringStrategyType {
    #[default]
    LeastAllocated,
    MostAllocated,
    RequestedToCapacityRatio,
}

/// A resource and its weight in the combined score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

impl ResourceSpec {
    /// A resource weighted `weight`.
    pub fn new(name: impl Into<String>, weight: i64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// CPU and memory, each with weight 1.
pub fn default_resources() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new(RESOURCE_CPU, 1),
        ResourceSpec::new(RESOURCE_MEMORY, 1),
    ]
}

/// One breakpoint of a requested-to-capacity shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilizationShapePoint {
    /// Percent, 0..=100.
    pub utilization: i64,
    /// 0..=MAX_CUSTOM_PRIORITY_SCORE.
    pub score: i64,
}

/// Args of the `RequestedToCapacityRatio` strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedToCapacityRatioParam {
    /// Breakpoints in strictly increasing utilization order.
    pub shape: Vec<UtilizationShapePoint>,
}

/// Scoring strategy of `NodeResourcesFit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringStrategy {
    #[serde(rename = "type")]
    pub strategy: ScoringStrategyType,
    pub resources: Vec<ResourceSpec>,
    pub requested_to_capacity_ratio: Option<RequestedToCapacityRatioParam>,
}

impl Default for ScoringStrategy {
    fn default() -> Self {
        Self {
            strategy: ScoringStrategyType::LeastAllocated,
            resources: default_resources(),
            requested_to_capacity_ratio: None,
        }
    }
}

/// Args of the `NodeResourcesFit` plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitArgs {
    /// Resources the Filter does not check.
    pub ignored_resources: Vec<String>,
    pub scoring_strategy: ScoringStrategy,
}

/// Args of the `NodeResourcesBalancedAllocation` plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancedAllocationArgs {
    pub resources: Vec<ResourceSpec>,
}

impl Default for BalancedAllocationArgs {
    fn default() -> Self {
        Self {
            resources: default_resources(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────────

pub(crate) fn validate_resources(plugin: &str, resources: &[ResourceSpec]) -> FrameworkResult<()> {
    for r in resources {
        if !(MIN_RESOURCE_WEIGHT..=MAX_RESOURCE_WEIGHT).contains(&r.weight) {
            return Err(invalid_args(
                plugin,
                format!(
                    "resource weight of {} not in valid range [{MIN_RESOURCE_WEIGHT}, {MAX_RESOURCE_WEIGHT}]",
                    r.name
                ),
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_shape(plugin: &str, shape: &[UtilizationShapePoint]) -> FrameworkResult<()> {
    if shape.is_empty() {
        return Err(invalid_args(plugin, "at least one shape point must be specified"));
    }
    for (i, point) in shape.iter().enumerate() {
        if !(0..=MAX_UTILIZATION).contains(&point.utilization) {
            return Err(invalid_args(
                plugin,
                format!("shape[{i}].utilization not in valid range [0, {MAX_UTILIZATION}]"),
            ));
        }
        if !(0..=MAX_CUSTOM_PRIORITY_SCORE).contains(&point.score) {
            return Err(invalid_args(
                plugin,
                format!("shape[{i}].score not in valid range [0, {MAX_CUSTOM_PRIORITY_SCORE}]"),
            ));
        }
        if i > 0 && point.utilization <= shape[i - 1].utilization {
            return Err(invalid_args(
                plugin,
                format!("shape[{i}].utilization values must be sorted in increasing order"),
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_strategy(plugin: &str, strategy: &ScoringStrategy) -> FrameworkResult<()> {
    validate_resources(plugin, &strategy.resources)?;
    if strategy.strategy == ScoringStrategyType::RequestedToCapacityRatio {
        let Some(param) = &strategy.requested_to_capacity_ratio else {
            return Err(invalid_args(
                plugin,
                "requested_to_capacity_ratio is required for the RequestedToCapacityRatio strategy",
            ));
        };
        validate_shape(plugin, &param.shape)?;
    }
    Ok(())
}

/// Shape points in node-score units.
pub(crate) fn scaled_shape(shape: &[UtilizationShapePoint]) -> Vec<FunctionShapePoint> {
    shape
        .iter()
        .map(|p| FunctionShapePoint {
            utilization: p.utilization,
            score: p.score * (MAX_NODE_SCORE / MAX_CUSTOM_PRIORITY_SCORE),
        })
        .collect()
}
