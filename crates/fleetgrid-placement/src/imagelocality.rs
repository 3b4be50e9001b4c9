//! Prefers hosts that already hold the workload's container images.
//!
//! An image counts for `size × hosts_with_image / total_hosts`, so images
//! present on only a few hosts do not pull every workload onto them.

use std::sync::Arc;

use fleetgrid_framework::{
    CycleState, FrameworkResult, MAX_NODE_SCORE, Plugin, PluginInstance, PreScorePlugin,
    ScorePlugin, Snapshot, Status,
};
use fleetgrid_state::{Container, NodeInfo, Workload};

use crate::helper::read_state;
use crate::names::IMAGE_LOCALITY;

const MB: i64 = 1024 * 1024;
/// Below this the image sum is treated as zero.
const MIN_THRESHOLD: i64 = 23 * MB;
/// Ceiling per container.
const MAX_CONTAINER_THRESHOLD: i64 = 1000 * MB;

const PRE_SCORE_STATE_KEY: &str = "PreScoreImageLocality";

/// Favors hosts that already hold the workload's container images.
#[derive(Debug, Default)]
pub struct ImageLocality;

#[derive(Debug, Clone, Copy)]
struct TotalNodes(usize);

pub fn new(_args: Option<&toml::Value>) -> FrameworkResult<PluginInstance> {
    let plugin = Arc::new(ImageLocality);
    Ok(PluginInstance::new(IMAGE_LOCALITY)
        .with_pre_score(plugin.clone())
        .with_score(plugin))
}

impl Plugin for ImageLocality {
    fn name(&self) -> &str {
        IMAGE_LOCALITY
    }
}

impl PreScorePlugin for ImageLocality {
    fn pre_score(
        &self,
        state: &mut CycleState,
        _workload: &Workload,
        snapshot: &Snapshot,
        _nodes: &[&NodeInfo],
    ) -> Result<(), Status> {
        state.write(PRE_SCORE_STATE_KEY, TotalNodes(snapshot.num_nodes()));
        Ok(())
    }
}

impl ScorePlugin for ImageLocality {
    fn score(&self, state: &CycleState, workload: &Workload, node: &NodeInfo) -> Result<i64, Status> {
        let total = read_state::<TotalNodes>(state, PRE_SCORE_STATE_KEY)?.0;
        let containers: Vec<&Container> = workload
            .init_containers
            .iter()
            .chain(&workload.containers)
            .collect();
        Ok(calculate_priority(sum_image_scores(node, &containers, total), containers.len()))
    }
}

fn sum_image_scores(node: &NodeInfo, containers: &[&Container], total_nodes: usize) -> i64 {
    if total_nodes == 0 {
        return 0;
    }
    containers
        .iter()
        .filter_map(|c| {
            node.image_states
                .get(&c.image)
                .or_else(|| node.image_states.get(&normalized_image_name(&c.image)))
        })
        .map(|s| (s.size as f64 * (s.num_nodes as f64 / total_nodes as f64)) as i64)
        .sum()
}

/// Scale the image sum into `[0, MAX_NODE_SCORE]` between the thresholds.
fn calculate_priority(sum: i64, num_containers: usize) -> i64 {
    if num_containers == 0 {
        return 0;
    }
    let max_threshold = MAX_CONTAINER_THRESHOLD * num_containers as i64;
    let sum = sum.clamp(MIN_THRESHOLD, max_threshold);
    MAX_NODE_SCORE * (sum - MIN_THRESHOLD) / (max_threshold - MIN_THRESHOLD)
}

/// `name` with an explicit `:latest` tag when it carries none.
fn normalized_image_name(name: &str) -> String {
    let last_slash = name.rfind('/');
    match name.rfind(':') {
        Some(colon) if last_slash.is_none_or(|s| colon > s) => name.to_string(),
        _ => format!("{name}:latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{Host, ImageStateSummary};

    fn make_node(name: &str, images: &[(&str, i64, usize)]) -> NodeInfo {
        let mut info = NodeInfo::with_workloads(
            Host {
                name: name.to_string(),
                ..Default::default()
            },
            vec![],
        );
        for (image, size, num_nodes) in images {
            info.image_states.insert(
                image.to_string(),
                ImageStateSummary {
                    size: *size,
                    num_nodes: *num_nodes,
                },
            );
        }
        info
    }

    fn make_workload(images: &[&str]) -> Workload {
        Workload {
            uid: "w".to_string(),
            containers: images
                .iter()
                .map(|i| Container {
                    image: i.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn score(workload: &Workload, node: &NodeInfo, total: usize) -> i64 {
        let mut state = CycleState::new();
        state.write(PRE_SCORE_STATE_KEY, TotalNodes(total));
        ImageLocality.score(&state, workload, node).unwrap()
    }

    #[test]
    fn normalizes_untagged_names() {
        assert_eq!(normalized_image_name("nginx"), "nginx:latest");
        assert_eq!(normalized_image_name("nginx:1.25"), "nginx:1.25");
        assert_eq!(normalized_image_name("registry:5000/app"), "registry:5000/app:latest");
        assert_eq!(normalized_image_name("registry:5000/app:v2"), "registry:5000/app:v2");
    }

    #[test]
    fn image_sizes_are_scaled_by_spread() {
        // 250 MiB on every host plus 40 MiB on half of them.
        let node = make_node("h1", &[("gcr.io/40:latest", 40 * MB, 1), ("gcr.io/250:latest", 250 * MB, 2)]);
        let w = make_workload(&["gcr.io/40", "gcr.io/250"]);
        let sum = 20 * MB + 250 * MB;
        let expected = MAX_NODE_SCORE * (sum - MIN_THRESHOLD) / (2 * MAX_CONTAINER_THRESHOLD - MIN_THRESHOLD);
        assert_eq!(score(&w, &node, 2), expected);
    }

    #[test]
    fn small_images_score_zero() {
        let node = make_node("h1", &[("tiny:latest", 10 * MB, 1)]);
        assert_eq!(score(&make_workload(&["tiny"]), &node, 1), 0);
    }

    #[test]
    fn huge_images_saturate() {
        let node = make_node("h1", &[("huge:v1", 3000 * MB, 1)]);
        assert_eq!(score(&make_workload(&["huge:v1"]), &node, 1), MAX_NODE_SCORE);
    }

    #[test]
    fn workload_without_containers_scores_zero() {
        assert_eq!(score(&make_workload(&[]), &make_node("h1", &[]), 3), 0);
    }

    #[test]
    fn missing_pre_score_state_is_an_error() {
        let status = ImageLocality
            .score(&CycleState::new(), &make_workload(&["a"]), &make_node("h1", &[]))
            .unwrap_err();
        assert_eq!(status.code(), fleetgrid_framework::Code::Error);
    }
}
