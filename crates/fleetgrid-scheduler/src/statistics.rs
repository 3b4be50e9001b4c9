//! Per-host usage summaries.

use serde::Serialize;

use fleetgrid_state::{NodeInfo, Resource};

/// Usage of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatistics {
    pub host: String,
    pub workloads: usize,
    pub allocatable_milli_cpu: i64,
    pub allocatable_memory: i64,
    pub used_milli_cpu: i64,
    pub used_memory: i64,
    pub free_milli_cpu: i64,
    pub free_memory: i64,
    /// Copies of the probed workload that still fit. `None` without a
    /// probe, or when the probe requests nothing the host limits.
    pub max_new_workloads: Option<i64>,
}

/// Usage of a live host. Ghost hosts yield `None`.
pub fn host_statistics(info: &NodeInfo, request: Option<&Resource>) -> Option<HostStatistics> {
    let host = info.host()?;
    Some(HostStatistics {
        host: host.name.clone(),
        workloads: info.pods.len(),
        allocatable_milli_cpu: info.allocatable.milli_cpu,
        allocatable_memory: info.allocatable.memory,
        used_milli_cpu: info.requested.milli_cpu,
        used_memory: info.requested.memory,
        free_milli_cpu: free(info.allocatable.milli_cpu, info.requested.milli_cpu),
        free_memory: free(info.allocatable.memory, info.requested.memory),
        max_new_workloads: request.and_then(|r| max_new_workloads(info, r)),
    })
}

fn free(allocatable: i64, used: i64) -> i64 {
    (allocatable - used).max(0)
}

/// How many more workloads requesting `request` fit on `info`: the minimum
/// over CPU, memory, every requested scalar resource and the pod count.
pub fn max_new_workloads(info: &NodeInfo, request: &Resource) -> Option<i64> {
    let mut bounds = Vec::new();
    if request.milli_cpu > 0 {
        bounds.push(free(info.allocatable.milli_cpu, info.requested.milli_cpu) / request.milli_cpu);
    }
    if request.memory > 0 {
        bounds.push(free(info.allocatable.memory, info.requested.memory) / request.memory);
    }
    for (name, qty) in &request.scalar_resources {
        if *qty > 0 {
            bounds.push(free(info.allocatable.get(name), info.requested.get(name)) / qty);
        }
    }
    if info.allocatable.allowed_pod_number > 0 {
        bounds.push(free(info.allocatable.allowed_pod_number, info.pods.len() as i64));
    }
    bounds.into_iter().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{Container, Host, ResourceList, Workload, workload_request};

    fn list(pairs: &[(&str, i64)]) -> ResourceList {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn make_node(allocatable: &[(&str, i64)], used: &[&[(&str, i64)]]) -> NodeInfo {
        let host = Host {
            name: "h1".to_string(),
            allocatable: list(allocatable),
            ..Default::default()
        };
        let workloads = used.iter().enumerate().map(|(i, req)| Workload {
            uid: format!("w{i}"),
            node_name: "h1".to_string(),
            containers: vec![Container {
                requests: list(req),
                ..Default::default()
            }],
            ..Default::default()
        });
        NodeInfo::with_workloads(host, workloads)
    }

    fn request(pairs: &[(&str, i64)]) -> Resource {
        workload_request(&Workload {
            containers: vec![Container {
                requests: list(pairs),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[test]
    fn tightest_resource_bounds_new_workloads() {
        let node = make_node(&[("cpu", 4000), ("memory", 8000)], &[&[("cpu", 1000), ("memory", 6000)]]);
        assert_eq!(max_new_workloads(&node, &request(&[("cpu", 1000), ("memory", 1000)])), Some(2));
        assert_eq!(max_new_workloads(&node, &request(&[("cpu", 1000)])), Some(3));
    }

    #[test]
    fn scalar_and_pod_limits_apply() {
        let node = make_node(
            &[("cpu", 4000), ("example.com/gpu", 4), ("pods", 2)],
            &[&[("example.com/gpu", 1)]],
        );
        assert_eq!(max_new_workloads(&node, &request(&[("example.com/gpu", 2)])), Some(1));
        assert_eq!(max_new_workloads(&node, &request(&[("example.com/gpu", 1)])), Some(1));
    }

    #[test]
    fn unbounded_request_has_no_limit() {
        let node = make_node(&[("cpu", 4000)], &[]);
        assert_eq!(max_new_workloads(&node, &Resource::default()), None);
    }

    #[test]
    fn overcommitted_host_reports_zero_free() {
        let node = make_node(&[("cpu", 1000), ("memory", 1000)], &[&[("cpu", 1500), ("memory", 500)]]);
        let stats = host_statistics(&node, None).unwrap();
        assert_eq!(stats.free_milli_cpu, 0);
        assert_eq!(stats.free_memory, 500);
        assert_eq!(stats.used_milli_cpu, 1500);
        assert_eq!(stats.max_new_workloads, None);
    }

    #[test]
    fn ghost_host_has_no_statistics() {
        assert!(host_statistics(&NodeInfo::new(), None).is_none());
    }
}
