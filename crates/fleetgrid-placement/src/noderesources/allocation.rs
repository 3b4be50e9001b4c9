//! Shared resource-allocation scoring.
//!
//! Every strategy turns `(requested, allocatable)` per configured resource
//! into a host score. Resources the host does not have (allocatable 0) are
//! left out, and so are extended resources the workload does not request.

use tracing::debug;

use fleetgrid_framework::{MAX_NODE_SCORE, Status};
use fleetgrid_state::{NodeInfo, Resource, Workload, is_scalar_resource_name, workload_request};

use super::{ResourceSpec, ScoringStrategy, ScoringStrategyType, scaled_shape};
use crate::helper::{BrokenLinear, host_of};

type ScoreFn = Box<dyn Fn(&[i64], &[i64]) -> i64 + Send + Sync>;

pub(crate) struct ResourceAllocationScorer {
    name: &'static str,
    resources: Vec<ResourceSpec>,
    scorer: ScoreFn,
}

impl std::fmt::Debug for ResourceAllocationScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocationScorer")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .finish()
    }
}

impl ResourceAllocationScorer {
    /// Scorer for one of the `NodeResourcesFit` strategies.
    pub fn for_strategy(strategy: &ScoringStrategy) -> Self {
        let resources = strategy.resources.clone();
        match strategy.strategy {
            ScoringStrategyType::LeastAllocated => Self {
                name: "LeastAllocated",
                scorer: weighted(resources.clone(), least_requested_score),
                resources,
            },
            ScoringStrategyType::MostAllocated => Self {
                name: "MostAllocated",
                scorer: weighted(resources.clone(), most_requested_score),
                resources,
            },
            ScoringStrategyType::RequestedToCapacityRatio => {
                let shape = strategy
                    .requested_to_capacity_ratio
                    .as_ref()
                    .map(|p| scaled_shape(&p.shape))
                    .unwrap_or_default();
                Self {
                    name: "RequestedToCapacityRatio",
                    scorer: requested_to_capacity_ratio(resources.clone(), BrokenLinear::new(shape)),
                    resources,
                }
            }
        }
    }

    /// Scorer for `NodeResourcesBalancedAllocation`.
    pub fn balanced(resources: Vec<ResourceSpec>) -> Self {
        Self {
            name: "BalancedAllocation",
            resources,
            scorer: Box::new(balanced_resource_score),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Score of `node` for `workload`, in `[0, MAX_NODE_SCORE]`.
    pub fn score(&self, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        let host = host_of(node)?;
        let request = workload_request(workload);

        let mut requested = vec![0; self.resources.len()];
        let mut allocatable = vec![0; self.resources.len()];
        for (i, r) in self.resources.iter().enumerate() {
            let (alloc, req) = allocatable_and_requested(node, &request, &r.name);
            if alloc == 0 {
                continue;
            }
            allocatable[i] = alloc;
            requested[i] = req;
        }

        let score = (self.scorer)(&requested, &allocatable);
        debug!(
            strategy = self.name,
            workload = %workload.full_name(),
            node = %host.name,
            ?allocatable,
            ?requested,
            score,
            "resource allocation score"
        );
        Ok(score)
    }
}

/// Allocatable and requested-after-placement quantities of one resource.
/// Both are 0 for an extended resource the workload does not request.
fn allocatable_and_requested(node: &NodeInfo, request: &Resource, name: &str) -> (i64, i64) {
    let wanted = request.get(name);
    if wanted == 0 && is_scalar_resource_name(name) {
        return (0, 0);
    }
    (node.allocatable.get(name), node.requested.get(name) + wanted)
}

// ── Strategies ─────────────────────────────────────────────────────

fn weighted(resources: Vec<ResourceSpec>, per_resource: fn(i64, i64) -> i64) -> ScoreFn {
    Box::new(move |requested, allocatable| {
        let (mut node_score, mut weight_sum) = (0, 0);
        for (i, r) in resources.iter().enumerate() {
            if allocatable[i] == 0 {
                continue;
            }
            node_score += per_resource(requested[i], allocatable[i]) * r.weight;
            weight_sum += r.weight;
        }
        if weight_sum == 0 {
            return 0;
        }
        node_score / weight_sum
    })
}

/// Share of the capacity left free, 0..=100.
pub(crate) fn least_requested_score(requested: i64, capacity: i64) -> i64 {
    if capacity == 0 || requested > capacity {
        return 0;
    }
    (capacity - requested) * MAX_NODE_SCORE / capacity
}

/// Share of the capacity in use, 0..=100.
pub(crate) fn most_requested_score(requested: i64, capacity: i64) -> i64 {
    if capacity == 0 {
        return 0;
    }
    requested.min(capacity) * MAX_NODE_SCORE / capacity
}

fn requested_to_capacity_ratio(resources: Vec<ResourceSpec>, shape: BrokenLinear) -> ScoreFn {
    let max_utilization = super::MAX_UTILIZATION;
    Box::new(move |requested, allocatable| {
        let resource_score = |req: i64, cap: i64| {
            if cap == 0 || req > cap {
                return shape.eval(max_utilization);
            }
            shape.eval(req * max_utilization / cap)
        };
        let (mut node_score, mut weight_sum) = (0, 0);
        for (i, r) in resources.iter().enumerate() {
            if allocatable[i] == 0 {
                continue;
            }
            let score = resource_score(requested[i], allocatable[i]);
            if score > 0 {
                node_score += score * r.weight;
                weight_sum += r.weight;
            }
        }
        if weight_sum == 0 {
            return 0;
        }
        (node_score as f64 / weight_sum as f64).round() as i64
    })
}

/// `(1 - std) * 100` over the utilization fractions, each capped at 1.
/// With two resources the deviation is half their difference.
fn balanced_resource_score(requested: &[i64], allocatable: &[i64]) -> i64 {
    let fractions: Vec<f64> = requested
        .iter()
        .zip(allocatable)
        .filter(|(_, alloc)| **alloc != 0)
        .map(|(req, alloc)| (*req as f64 / *alloc as f64).min(1.0))
        .collect();

    let std = match fractions.as_slice() {
        [] | [_] => 0.0,
        [a, b] => ((a - b) / 2.0).abs(),
        all => {
            let mean = all.iter().sum::<f64>() / all.len() as f64;
            let variance = all.iter().map(|f| (f - mean) * (f - mean)).sum::<f64>() / all.len() as f64;
            variance.sqrt()
        }
    };
    ((1.0 - std) * MAX_NODE_SCORE as f64) as i64
}
