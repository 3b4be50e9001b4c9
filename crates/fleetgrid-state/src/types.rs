//! Domain types for the FleetGrid scheduling core.
//!
//! Workloads and hosts are supplied by the API and reporting layers as
//! plain in-memory values. All types are serializable so that inventories
//! and fixtures can be loaded from JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{StateError, StateResult};

/// Resource name → quantity. CPU is expressed in millicores, memory and
/// storage in bytes, everything else as a plain count.
pub type ResourceList = BTreeMap<String, i64>;

/// Label key → value.
pub type Labels = BTreeMap<String, String>;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const RESOURCE_PODS: &str = "pods";

/// Well-known host labels.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";

/// Taint placed on hosts marked unschedulable.
pub const TAINT_NODE_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";

/// Field selector key matched against the host name.
pub const FIELD_HOST_NAME: &str = "metadata.name";

// ── Workload ───────────────────────────────────────────────────────

/// A schedulable unit of work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Workload {
    /// Unique identifier; used as the cache key.
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    /// Profile that should schedule this workload.
    pub scheduler_name: String,
    /// Host the workload is bound (or assumed) to. Empty until placed.
    pub node_name: String,
    /// Higher values preempt lower ones.
    pub priority: i32,
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    /// Fixed per-workload overhead added on top of container requests.
    pub overhead: ResourceList,
    pub node_selector: Labels,
    pub affinity: Option<Affinity>,
    pub tolerations: Vec<Toleration>,
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

impl Workload {
    /// Cache key for this workload.
    pub fn key(&self) -> StateResult<&str> {
        if self.uid.is_empty() {
            return Err(StateError::EmptyKey(self.full_name()));
        }
        Ok(&self.uid)
    }

    /// `namespace/name`, for logs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Host affinity of the workload, if any.
    pub fn node_affinity(&self) -> Option<&NodeAffinity> {
        self.affinity.as_ref().and_then(|a| a.node_affinity.as_ref())
    }

    pub fn pod_affinity(&self) -> Option<&PodAffinity> {
        self.affinity.as_ref().and_then(|a| a.pod_affinity.as_ref())
    }

    pub fn pod_anti_affinity(&self) -> Option<&PodAffinity> {
        self.affinity.as_ref().and_then(|a| a.pod_anti_affinity.as_ref())
    }
}

/// A single container inside a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub requests: ResourceList,
    pub limits: ResourceList,
}

// ── Host ───────────────────────────────────────────────────────────

/// A compute host in the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Host {
    pub name: String,
    pub labels: Labels,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
    pub taints: Vec<Taint>,
    /// Cordoned hosts accept no new workloads unless tolerated.
    pub unschedulable: bool,
    /// Container images already present on the host.
    pub images: Vec<ContainerImage>,
}

impl Host {
    /// Value of the field addressed by a node selector `match_fields` entry.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            FIELD_HOST_NAME => Some(&self.name),
            _ => None,
        }
    }
}

/// An image reported by a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerImage {
    pub names: Vec<String>,
    pub size_bytes: i64,
}

// ── Taints & tolerations ───────────────────────────────────────────

/// What a taint does to workloads that do not tolerate it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A mark on a host that repels workloads without a matching toleration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// Lets a workload ignore matching taints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates every taint.
    pub key: String,
    pub operator: TolerationOperator,
    pub value: String,
    /// `None` matches all effects.
    pub effect: Option<TaintEffect>,
}

// ── Affinity ───────────────────────────────────────────────────────

/// Placement preferences and requirements of a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Affinity {
    pub node_affinity: Option<NodeAffinity>,
    pub pod_affinity: Option<PodAffinity>,
    pub pod_anti_affinity: Option<PodAffinity>,
}

/// Required and preferred host selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeAffinity {
    pub required: Option<NodeSelector>,
    pub preferred: Vec<PreferredSchedulingTerm>,
}

/// A disjunction of terms: the selector matches if any term matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSelector {
    pub terms: Vec<NodeSelectorTerm>,
}

/// A conjunction of requirements over host labels and fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<NodeSelectorRequirement>,
    pub match_fields: Vec<NodeSelectorRequirement>,
}

/// A single label or field requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// A node selector term with a score weight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreferredSchedulingTerm {
    pub weight: i32,
    pub preference: NodeSelectorTerm,
}

/// Affinity (or anti-affinity) towards co-located workloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodAffinity {
    pub required: Vec<PodAffinityTerm>,
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

/// Selects co-located workloads within a topology domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodAffinityTerm {
    /// `None` selects no workloads.
    pub label_selector: Option<LabelSelector>,
    pub namespaces: Vec<String>,
    /// `Some` with an empty selector selects every namespace.
    pub namespace_selector: Option<LabelSelector>,
    pub topology_key: String,
}

/// A pod affinity term with a score weight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightedPodAffinityTerm {
    pub weight: i32,
    pub term: PodAffinityTerm,
}

/// Selects workloads by label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelSelector {
    pub match_labels: Labels,
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Operator of a [`LabelSelectorRequirement`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

// ── Topology spread ────────────────────────────────────────────────

/// Bounds how unevenly matching workloads may spread across the domains of
/// `topology_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologySpreadConstraint {
    pub max_skew: i32,
    pub topology_key: String,
    pub when_unsatisfiable: UnsatisfiableConstraintAction,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
}

/// What to do when a spread constraint cannot be met.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UnsatisfiableConstraintAction {
    DoNotSchedule,
    ScheduleAnyway,
}
