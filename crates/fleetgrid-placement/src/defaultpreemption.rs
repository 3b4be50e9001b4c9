//! Preemption: when no host fits, find one where evicting lower-priority
//! workloads would make room.
//!
//! Each candidate host is dry-run on a copy of the cycle state: every
//! lower-priority workload is removed, Filter must pass, then the removed
//! workloads are reprieved one by one (highest priority first) as long as
//! the host still fits. The host with the fewest victims wins, then the
//! one whose most important victim has the lowest priority, then host
//! order.

use std::sync::Arc;

use tracing::{debug, info};

use fleetgrid_framework::{
    CancelToken, Code, CycleState, FrameworkResult, Handle, NodeToStatusMap, Plugin,
    PluginInstance, PostFilterPlugin, PostFilterResult, Snapshot, Status,
};
use fleetgrid_state::{NodeInfo, PodInfo, Workload};

use crate::names::DEFAULT_PREEMPTION;

/// Evicts lower-priority workloads from one host when nothing fits.
#[derive(Debug, Default)]
pub struct DefaultPreemption;

#[derive(Debug)]
struct Candidate {
    node_name: String,
    /// Sorted by descending priority.
    victims: Vec<Arc<PodInfo>>,
}

impl Candidate {
    fn highest_victim_priority(&self) -> i32 {
        self.victims.first().map_or(i32::MIN, |v| v.workload.priority)
    }
}

/// Build the plugin. It takes no args.
pub fn new(_args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    Ok(PluginInstance::new(DEFAULT_PREEMPTION).with_post_filter(Arc::new(DefaultPreemption)))
}

impl Plugin for DefaultPreemption {
    fn name(&self) -> &str {
        DEFAULT_PREEMPTION
    }
}

fn remove_victim(
    handle: &dyn Handle,
    state: &mut CycleState,
    workload: &Workload,
    node: &mut NodeInfo,
    victim: &PodInfo,
) -> Result<(), Status> {
    node.remove_pod(&victim.workload)
        .map_err(|e| Status::error(e.to_string()))?;
    handle.run_pre_filter_extension_remove_pod(state, workload, victim, node)
}

/// Victims needed on `node_info`, or `None` when evicting every
/// lower-priority workload would still not make the host fit.
fn select_victims_on_node(
    handle: &dyn Handle,
    state: &CycleState,
    workload: &Workload,
    node_info: &NodeInfo,
) -> Result<Option<Vec<Arc<PodInfo>>>, Status> {
    let mut state = state.clone();
    let mut node = node_info.clone();

    let mut potential: Vec<Arc<PodInfo>> = node
        .pods
        .iter()
        .filter(|p| p.workload.priority < workload.priority)
        .cloned()
        .collect();
    if potential.is_empty() {
        return Ok(None);
    }
    for p in &potential {
        remove_victim(handle, &mut state, workload, &mut node, p)?;
    }
    if let Err(s) = handle.run_filter_plugins(&state, workload, &node) {
        if s.code() == Code::Error {
            return Err(s);
        }
        return Ok(None);
    }

    potential.sort_by(|a, b| b.workload.priority.cmp(&a.workload.priority));
    let mut victims = Vec::new();
    for p in potential {
        node.add_pod_info(p.clone());
        handle.run_pre_filter_extension_add_pod(&mut state, workload, &p, &node)?;
        if handle.run_filter_plugins(&state, workload, &node).is_err() {
            remove_victim(handle, &mut state, workload, &mut node, &p)?;
            victims.push(p);
        }
    }
    if victims.is_empty() {
        return Ok(None);
    }
    Ok(Some(victims))
}

impl PostFilterPlugin for DefaultPreemption {
    fn post_filter(
        &self,
        handle: &dyn Handle,
        state: &CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        statuses: &NodeToStatusMap,
    ) -> Result<PostFilterResult, Status> {
        // Only plain Unschedulable rejections can be fixed by evicting.
        let nodes: Vec<&NodeInfo> = snapshot
            .list()
            .filter(|n| {
                statuses
                    .get(n.name())
                    .is_some_and(|s| s.code() == Code::Unschedulable)
            })
            .collect();
        let unresolvable = snapshot.num_nodes() - nodes.len();

        let results = handle.parallelizer().map(&CancelToken::new(), nodes.len(), |i| {
            select_victims_on_node(handle, state, workload, nodes[i])
        });

        let mut candidates = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Some(Ok(Some(victims))) => {
                    debug!(
                        workload = %workload.full_name(),
                        node = node.name(),
                        victims = victims.len(),
                        "preemption candidate"
                    );
                    candidates.push(Candidate {
                        node_name: node.name().to_string(),
                        victims,
                    });
                }
                Some(Err(s)) => return Err(s.or_error("preemption")),
                Some(Ok(None)) | None => {}
            }
        }

        let Some(best) = candidates
            .into_iter()
            .min_by_key(|c| (c.victims.len(), c.highest_victim_priority()))
        else {
            return Err(Status::unschedulable(format!(
                "preemption: 0/{} nodes are available: {} no preemption victims found for incoming workload, {} preemption is not helpful for scheduling",
                snapshot.num_nodes(),
                nodes.len(),
                unresolvable
            )));
        };

        info!(
            workload = %workload.full_name(),
            node = %best.node_name,
            victims = best.victims.len(),
            "nominated host by preemption"
        );
        Ok(PostFilterResult {
            nominated_node_name: best.node_name,
            victims: best.victims.iter().map(|v| v.workload.clone()).collect(),
        })
    }
}
