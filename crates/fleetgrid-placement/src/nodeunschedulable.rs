use std::sync::Arc;

use fleetgrid_framework::{CycleState, FilterPlugin, FrameworkResult, Plugin, PluginInstance, Status};
use fleetgrid_state::{NodeInfo, TAINT_NODE_UNSCHEDULABLE, Taint, TaintEffect, Workload};

use crate::helper::host_of;
use crate::names::NODE_UNSCHEDULABLE;

pub const ERR_REASON_UNSCHEDULABLE: &str = "node(s) were unschedulable";

/// Rejects cordoned hosts unless the workload tolerates the
/// unschedulable taint.
#[derive(Debug, Default)]
pub struct NodeUnschedulable;

/// Build the plugin. It takes no args.
pub fn new(_args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    Ok(PluginInstance::new(NODE_UNSCHEDULABLE).with_filter(Arc::new(NodeUnschedulable)))
}

impl Plugin for NodeUnschedulable {
    fn name(&self) -> &str {
        NODE_UNSCHEDULABLE
    }
}

impl FilterPlugin for NodeUnschedulable {
    fn filter(&self, _state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        if !host.unschedulable {
            return Ok(());
        }
        let cordon = Taint {
            key: TAINT_NODE_UNSCHEDULABLE.to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        };
        if workload.tolerations.iter().any(|t| t.tolerates(&cordon)) {
            return Ok(());
        }
        Err(Status::unresolvable(ERR_REASON_UNSCHEDULABLE))
    }
}
