use std::collections::HashSet;
use std::sync::Arc;

use fleetgrid_framework::{
    Code, CycleState, FilterPlugin, FrameworkResult, Plugin, PluginInstance, PreFilterPlugin,
    PreFilterResult, ScorePlugin, Snapshot, Status, decode_args,
};
use fleetgrid_state::{
    NodeInfo, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY, RESOURCE_PODS, Resource,
    Workload, workload_request,
};

use super::allocation::ResourceAllocationScorer;
use super::{FitArgs, validate_strategy};
use crate::helper::read_state;
use crate::names::NODE_RESOURCES_FIT;

const PRE_FILTER_STATE_KEY: &str = "PreFilterNodeResourcesFit";

#[derive(Debug, Clone)]
struct PreFilterState(Resource);

/// A resource the host cannot supply for the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsufficientResource {
    pub resource_name: String,
    pub reason: String,
    pub requested: i64,
    pub used: i64,
    pub capacity: i64,
}

/// Checks that a host has room for the workload, and scores hosts with the
/// configured strategy.
#[derive(Debug)]
pub struct Fit {
    ignored_resources: HashSet<String>,
    scorer: ResourceAllocationScorer,
}

impl Fit {
    /// Validate `args` and pick the scorer for its strategy.
    pub fn from_args(args: FitArgs) -> FrameworkResult<Self> {
        validate_strategy(NODE_RESOURCES_FIT, &args.scoring_strategy)?;
        Ok(Self {
            ignored_resources: args.ignored_resources.into_iter().collect(),
            scorer: ResourceAllocationScorer::for_strategy(&args.scoring_strategy),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.scorer.name()
    }
}

/// Build the plugin from its optional TOML args.
pub fn new(args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let fit = Arc::new(Fit::from_args(decode_args(NODE_RESOURCES_FIT, args)?)?);
    Ok(PluginInstance::new(NODE_RESOURCES_FIT)
        .with_pre_filter(fit.clone())
        .with_filter(fit.clone())
        .with_score(fit))
}

impl Plugin for Fit {
    fn name(&self) -> &str {
        NODE_RESOURCES_FIT
    }
}

impl PreFilterPlugin for Fit {
    fn pre_filter(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        _snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status> {
        state.write(PRE_FILTER_STATE_KEY, PreFilterState(workload_request(workload)));
        Ok(None)
    }
}

impl FilterPlugin for Fit {
    fn filter(&self, state: &CycleState, _workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let request = &read_state::<PreFilterState>(state, PRE_FILTER_STATE_KEY)?.0;
        let insufficient = fits_request(request, node, &self.ignored_resources);
        if insufficient.is_empty() {
            return Ok(());
        }
        Err(Status::with_reasons(
            Code::Unschedulable,
            insufficient.into_iter().map(|r| r.reason).collect(),
        ))
    }
}

impl ScorePlugin for Fit {
    fn score(&self, _state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        self.scorer.score(workload, node)
    }
}

/// Every resource `node` lacks for `request`. The pod-count check only
/// applies to hosts that declare a `pods` allocatable.
pub fn fits_request(
    request: &Resource,
    node: &NodeInfo,
    ignored_resources: &HashSet<String>,
) -> Vec<InsufficientResource> {
    let mut out = Vec::new();

    let allowed_pods = node.allocatable.allowed_pod_number;
    if allowed_pods > 0 && node.pods.len() as i64 + 1 > allowed_pods {
        out.push(InsufficientResource {
            resource_name: RESOURCE_PODS.to_string(),
            reason: "Too many pods".to_string(),
            requested: 1,
            used: node.pods.len() as i64,
            capacity: allowed_pods,
        });
    }

    let nothing_requested = request.milli_cpu == 0
        && request.memory == 0
        && request.ephemeral_storage == 0
        && request.scalar_resources.values().all(|q| *q == 0);
    if nothing_requested {
        return out;
    }

    for name in [RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_EPHEMERAL_STORAGE] {
        check(&mut out, name, request.get(name), node);
    }
    for (name, &qty) in &request.scalar_resources {
        if qty == 0 || ignored_resources.contains(name) {
            continue;
        }
        check(&mut out, name, qty, node);
    }
    out
}

fn check(out: &mut Vec<InsufficientResource>, name: &str, wanted: i64, node: &NodeInfo) {
    if wanted == 0 {
        return;
    }
    let capacity = node.allocatable.get(name);
    let used = node.requested.get(name);
    if capacity < wanted + used {
        out.push(InsufficientResource {
            resource_name: name.to_string(),
            reason: format!("Insufficient {name}"),
            requested: wanted,
            used,
            capacity,
        });
    }
}
