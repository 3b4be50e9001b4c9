use std::sync::Arc;

use fleetgrid_framework::{CycleState, FilterPlugin, FrameworkResult, Plugin, PluginInstance, Status};
use fleetgrid_state::{NodeInfo, TaintEffect, Workload, find_untolerated_taint};

use crate::helper::host_of;
use crate::names::TAINT_TOLERATION;

/// Rejects hosts carrying a `NoSchedule` or `NoExecute` taint the
/// workload does not tolerate.
#[derive(Debug, Default)]
pub struct TaintToleration;

pub fn new(_args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    Ok(PluginInstance::new(TAINT_TOLERATION).with_filter(Arc::new(TaintToleration)))
}

impl Plugin for TaintToleration {
    fn name(&self) -> &str {
        TAINT_TOLERATION
    }
}

impl FilterPlugin for TaintToleration {
    fn filter(&self, _state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<(), Status> {
        let host = host_of(node)?;
        let taint = find_untolerated_taint(&host.taints, &workload.tolerations, |t| {
            matches!(t.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
        });
        match taint {
            None => Ok(()),
            Some(t) => Err(Status::unresolvable(format!(
                "node(s) had untolerated taint {{{}: {}}}",
                t.key, t.value
            ))),
        }
    }
}
