use std::sync::Arc;

use fleetgrid_framework::{
    CycleState, FrameworkResult, Plugin, PluginInstance, ScorePlugin, Status, decode_args,
};
use fleetgrid_state::{NodeInfo, Workload};

use super::allocation::ResourceAllocationScorer;
use super::{BalancedAllocationArgs, validate_resources};
use crate::names::NODE_RESOURCES_BALANCED_ALLOCATION;

/// Favors hosts whose resource utilization stays even across dimensions
/// once the workload is placed.
#[derive(Debug)]
pub struct BalancedAllocation {
    scorer: ResourceAllocationScorer,
}

impl BalancedAllocation {
    pub fn from_args(args: BalancedAllocationArgs) -> FrameworkResult<Self> {
        validate_resources(NODE_RESOURCES_BALANCED_ALLOCATION, &args.resources)?;
        Ok(Self {
            scorer: ResourceAllocationScorer::balanced(args.resources),
        })
    }
}

/// Build the plugin from its optional TOML args.
pub fn new(args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let args = decode_args(NODE_RESOURCES_BALANCED_ALLOCATION, args)?;
    let plugin = Arc::new(BalancedAllocation::from_args(args)?);
    Ok(PluginInstance::new(NODE_RESOURCES_BALANCED_ALLOCATION).with_score(plugin))
}

impl Plugin for BalancedAllocation {
    fn name(&self) -> &str {
        NODE_RESOURCES_BALANCED_ALLOCATION
    }
}

impl ScorePlugin for BalancedAllocation {
    fn score(&self, _state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        self.scorer.score(workload, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_framework::{MAX_NODE_SCORE, Snapshot};
    use fleetgrid_state::{Container, Host, ResourceList};

    use crate::noderesources::ResourceSpec;

    fn list(pairs: &[(&str, i64)]) -> ResourceList {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn make_host(name: &str, cpu: i64, memory: i64, extra: &[(&str, i64)]) -> Host {
        let mut allocatable = list(&[("cpu", cpu), ("memory", memory)]);
        allocatable.extend(list(extra));
        Host {
            name: name.to_string(),
            capacity: allocatable.clone(),
            allocatable,
            ..Default::default()
        }
    }

    fn make_workload(uid: &str, node: &str, containers: &[&[(&str, i64)]]) -> Workload {
        Workload {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            node_name: node.to_string(),
            containers: containers
                .iter()
                .map(|r| Container {
                    requests: list(r),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn cpu_only(uid: &str, node: &str) -> Workload {
        make_workload(uid, node, &[&[("cpu", 1000)], &[("cpu", 2000)]])
    }

    fn cpu_and_memory(uid: &str, node: &str) -> Workload {
        make_workload(uid, node, &[
            &[("cpu", 1000), ("memory", 2000)],
            &[("cpu", 2000), ("memory", 3000)],
        ])
    }

    fn scores(incoming: &Workload, hosts: Vec<Host>, existing: Vec<Workload>) -> Vec<i64> {
        scores_with(BalancedAllocationArgs::default(), incoming, hosts, existing)
    }

    fn scores_with(
        args: BalancedAllocationArgs,
        incoming: &Workload,
        hosts: Vec<Host>,
        existing: Vec<Workload>,
    ) -> Vec<i64> {
        let plugin = BalancedAllocation::from_args(args).unwrap();
        let snapshot = Snapshot::from_hosts(hosts, existing);
        snapshot
            .list()
            .map(|n| plugin.score(&CycleState::new(), incoming, n).unwrap())
            .collect()
    }

    #[test]
    fn nothing_scheduled_nothing_requested() {
        let hosts = vec![make_host("m1", 4000, 10000, &[]), make_host("m2", 4000, 10000, &[])];
        let got = scores(&make_workload("in", "", &[]), hosts, vec![]);
        assert_eq!(got, vec![MAX_NODE_SCORE, MAX_NODE_SCORE]);
    }

    #[test]
    fn differently_sized_machines() {
        let hosts = vec![make_host("m1", 4000, 10000, &[]), make_host("m2", 6000, 10000, &[])];
        let got = scores(&cpu_and_memory("in", ""), hosts, vec![]);
        assert_eq!(got, vec![87, MAX_NODE_SCORE]);
    }

    #[test]
    fn existing_workloads_with_resources() {
        let hosts = || vec![make_host("m1", 10000, 20000, &[]), make_host("m2", 10000, 20000, &[])];
        let existing = || {
            vec![
                cpu_only("a", "m1"),
                cpu_only("b", "m1"),
                cpu_only("c", "m2"),
                cpu_and_memory("d", "m2"),
            ]
        };
        assert_eq!(scores(&make_workload("in", "", &[]), hosts(), existing()), vec![70, 82]);

        let existing = vec![cpu_only("a", "m1"), cpu_and_memory("b", "m2")];
        assert_eq!(scores(&cpu_and_memory("in", ""), hosts(), existing), vec![82, 95]);
    }

    #[test]
    fn differently_sized_machines_with_existing_workloads() {
        let hosts = vec![make_host("m1", 10000, 20000, &[]), make_host("m2", 10000, 50000, &[])];
        let existing = vec![cpu_only("a", "m1"), cpu_and_memory("b", "m2")];
        assert_eq!(scores(&cpu_and_memory("in", ""), hosts, existing), vec![82, 80]);
    }

    #[test]
    fn requested_at_capacity() {
        let hosts = vec![make_host("m1", 6000, 10000, &[]), make_host("m2", 6000, 10000, &[])];
        let existing = vec![cpu_only("a", "m1"), cpu_and_memory("b", "m2")];
        assert_eq!(scores(&cpu_only("in", ""), hosts, existing), vec![50, 75]);
    }

    #[test]
    fn zero_capacity_hosts_are_balanced() {
        let hosts = vec![make_host("m1", 0, 0, &[]), make_host("m2", 0, 0, &[])];
        let existing = vec![cpu_only("a", "m1"), cpu_and_memory("b", "m2")];
        let got = scores(&make_workload("in", "", &[]), hosts, existing);
        assert_eq!(got, vec![MAX_NODE_SCORE, MAX_NODE_SCORE]);
    }

    #[test]
    fn unrequested_extended_resource_is_skipped() {
        let args = BalancedAllocationArgs {
            resources: vec![ResourceSpec::new("cpu", 1), ResourceSpec::new("nvidia.com/gpu", 1)],
        };
        let hosts = vec![
            make_host("m1", 3500, 40000, &[("nvidia.com/gpu", 8)]),
            make_host("m2", 3500, 40000, &[]),
        ];
        let existing = vec![cpu_only("a", "m1"), cpu_only("b", "m2")];
        let got = scores_with(args, &make_workload("in", "", &[&[]]), hosts, existing);
        assert_eq!(got, vec![MAX_NODE_SCORE, MAX_NODE_SCORE]);
    }
}
