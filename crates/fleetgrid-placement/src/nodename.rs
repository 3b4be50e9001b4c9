use std::sync::Arc;

use fleetgrid_framework::{CycleState, FilterPlugin, FrameworkResult, Plugin, PluginInstance, Status};
use fleetgrid_state::{NodeInfo, Workload};

use crate::helper::host_of;
use crate::names::NODE_NAME;

pub const ERR_REASON_NODE_NAME: &str = "node(s) didn't match the requested node name";

/// Pins a workload that names its host to that host.
#[derive(Debug, Default)]
pub struct NodeName;

pub fn new(_args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    Ok(PluginInstance::new(NODE_NAME).with_filter(Arc::new(NodeName)))
}

impl Plugin for NodeName {
    fn name(&self) -> &str {
        NODE_NAME
    }
}

impl FilterPlugin for NodeName {
    fn filter(&self, _state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        if workload.node_name.is_empty() || workload.node_name == host.name {
            return Ok(());
        }
        Err(Status::unresolvable(ERR_REASON_NODE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_framework::Code;
    use fleetgrid_state::Host;

    fn make_node(name: &str) -> NodeInfo {
        NodeInfo::with_workloads(
            Host {
                name: name.to_string(),
                ..Default::default()
            },
            vec![],
        )
    }

    fn pinned_to(node_name: &str) -> Workload {
        Workload {
            node_name: node_name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn unpinned_workload_fits_anywhere() {
        assert!(NodeName.filter(&CycleState::new(), &pinned_to(""), &make_node("h1")).is_ok());
    }

    #[test]
    fn pinned_workload_fits_only_its_host() {
        let w = pinned_to("h1");
        assert!(NodeName.filter(&CycleState::new(), &w, &make_node("h1")).is_ok());
        let status = NodeName.filter(&CycleState::new(), &w, &make_node("h2")).unwrap_err();
        assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(status.message(), ERR_REASON_NODE_NAME);
    }
}
