//! Per-host aggregates held by the cache and copied into snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{StateError, StateResult};
use crate::resource::{Resource, calculate_resource};
use crate::selector::selector_matches;
use crate::types::{Host, LabelSelector, Labels, PodAffinityTerm, Workload};

static GENERATION: AtomicI64 = AtomicI64::new(0);

/// Next value of the process-wide generation counter. Every `NodeInfo`
/// mutation takes a fresh value, so a higher generation is always newer.
pub fn next_generation() -> i64 {
    GENERATION.fetch_add(1, Ordering::SeqCst) + 1
}

// ── Affinity terms ─────────────────────────────────────────────────

/// A workload affinity term with its namespace set resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct AffinityTerm {
    pub namespaces: BTreeSet<String>,
    pub selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    pub topology_key: String,
}

impl AffinityTerm {
    /// Parse `term` of `owner`. Without namespaces or a namespace selector the
    /// term applies to `owner`'s namespace.
    pub fn new(owner: &Workload, term: &PodAffinityTerm) -> Self {
        let namespaces = if term.namespaces.is_empty() && term.namespace_selector.is_none() {
            BTreeSet::from([owner.namespace.clone()])
        } else {
            term.namespaces.iter().cloned().collect()
        };
        Self {
            namespaces,
            selector: term.label_selector.clone(),
            namespace_selector: term.namespace_selector.clone(),
            topology_key: term.topology_key.clone(),
        }
    }

    /// Whether `workload` is selected by this term. Namespaces carry no
    /// labels in this model, so a namespace selector only admits every
    /// namespace when it is empty.
    pub fn matches(&self, workload: &Workload) -> bool {
        let in_namespace = self.namespaces.contains(&workload.namespace)
            || selector_matches(self.namespace_selector.as_ref(), &Labels::new());
        in_namespace && selector_matches(self.selector.as_ref(), &workload.labels)
    }
}

/// An [`AffinityTerm`] with a score weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedAffinityTerm {
    pub term: AffinityTerm,
    pub weight: i32,
}

// ── PodInfo ────────────────────────────────────────────────────────

/// A workload plus its pre-parsed affinity terms.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub workload: Arc<Workload>,
    pub required_affinity_terms: Vec<AffinityTerm>,
    pub required_anti_affinity_terms: Vec<AffinityTerm>,
    pub preferred_affinity_terms: Vec<WeightedAffinityTerm>,
    pub preferred_anti_affinity_terms: Vec<WeightedAffinityTerm>,
}

impl PodInfo {
    /// Parse the affinity terms of `workload` once.
    pub fn new(workload: Workload) -> Self {
        Self::from_arc(Arc::new(workload))
    }

    pub fn from_arc(workload: Arc<Workload>) -> Self {
        let required = |terms: Option<&crate::types::PodAffinity>| -> Vec<AffinityTerm> {
            terms
                .map(|a| {
                    a.required
                        .iter()
                        .map(|t| AffinityTerm::new(&workload, t))
                        .collect()
                })
                .unwrap_or_default()
        };
        let preferred = |terms: Option<&crate::types::PodAffinity>| -> Vec<WeightedAffinityTerm> {
            terms
                .map(|a| {
                    a.preferred
                        .iter()
                        .map(|w| WeightedAffinityTerm {
                            term: AffinityTerm::new(&workload, &w.term),
                            weight: w.weight,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            required_affinity_terms: required(workload.pod_affinity()),
            required_anti_affinity_terms: required(workload.pod_anti_affinity()),
            preferred_affinity_terms: preferred(workload.pod_affinity()),
            preferred_anti_affinity_terms: preferred(workload.pod_anti_affinity()),
            workload,
        }
    }

    fn has_affinity(&self) -> bool {
        self.workload.pod_affinity().is_some() || self.workload.pod_anti_affinity().is_some()
    }

    fn has_required_anti_affinity(&self) -> bool {
        !self.required_anti_affinity_terms.is_empty()
    }
}

// ── NodeInfo ───────────────────────────────────────────────────────

/// How widely an image is spread across the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStateSummary {
    pub size: i64,
    pub num_nodes: usize,
}

/// Aggregate view of one host and the workloads assigned to it.
///
/// A `NodeInfo` without a host is a "ghost": the host was removed while
/// some of its workloads were still being reported.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    host: Option<Arc<Host>>,
    pub pods: Vec<Arc<PodInfo>>,
    pub pods_with_affinity: Vec<Arc<PodInfo>>,
    pub pods_with_required_anti_affinity: Vec<Arc<PodInfo>>,
    /// Sum of requests of all workloads in `pods`.
    pub requested: Resource,
    /// Like `requested`, with zero CPU/memory requests replaced by defaults.
    pub non_zero_requested: Resource,
    pub allocatable: Resource,
    pub image_states: BTreeMap<String, ImageStateSummary>,
    pub generation: i64,
}

impl NodeInfo {
    /// An empty `NodeInfo` with a fresh generation.
    pub fn new() -> Self {
        Self {
            generation: next_generation(),
            ..Default::default()
        }
    }

    /// Build an aggregate for `host` holding `workloads`.
    pub fn with_workloads(host: Host, workloads: impl IntoIterator<Item = Workload>) -> Self {
        let mut info = Self::new();
        info.set_host(Arc::new(host));
        for w in workloads {
            info.add_pod(w);
        }
        info
    }

    pub fn host(&self) -> Option<&Host> {
        self.host.as_deref()
    }

    pub fn host_arc(&self) -> Option<&Arc<Host>> {
        self.host.as_ref()
    }

    /// Host name, or empty for a ghost.
    pub fn name(&self) -> &str {
        self.host.as_ref().map(|h| h.name.as_str()).unwrap_or("")
    }

    /// Attach a host description and bump the generation.
    pub fn set_host(&mut self, host: Arc<Host>) {
        self.allocatable = Resource::new(&host.allocatable);
        self.host = Some(host);
        self.generation = next_generation();
    }

    /// Detach the host, leaving a ghost entry.
    pub fn remove_host(&mut self) {
        self.host = None;
        self.generation = next_generation();
    }

    /// Add a workload and its requests.
    pub fn add_pod(&mut self, workload: Workload) {
        self.add_pod_info(Arc::new(PodInfo::new(workload)));
    }

    /// Add an already parsed workload and its requests.
    pub fn add_pod_info(&mut self, info: Arc<PodInfo>) {
        if info.has_affinity() {
            self.pods_with_affinity.push(info.clone());
        }
        if info.has_required_anti_affinity() {
            self.pods_with_required_anti_affinity.push(info.clone());
        }
        self.update_usage(&info.workload, 1);
        self.pods.push(info);
        self.generation = next_generation();
    }

    /// Remove the workload with the same key as `workload`.
    pub fn remove_pod(&mut self, workload: &Workload) -> StateResult<()> {
        let key = workload.key()?;
        let position = self
            .pods
            .iter()
            .position(|p| p.workload.uid == key)
            .ok_or_else(|| StateError::WorkloadNotOnHost {
                workload: workload.full_name(),
                host: self.name().to_string(),
            })?;

        self.pods_with_affinity.retain(|p| p.workload.uid != key);
        self.pods_with_required_anti_affinity
            .retain(|p| p.workload.uid != key);
        let removed = self.pods.swap_remove(position);
        self.update_usage(&removed.workload, -1);
        self.generation = next_generation();
        Ok(())
    }

    fn update_usage(&mut self, workload: &Workload, sign: i64) {
        let (res, non0_cpu, non0_mem) = calculate_resource(workload);
        let non_zero = Resource {
            milli_cpu: non0_cpu,
            memory: non0_mem,
            ..Default::default()
        };
        if sign < 0 {
            self.requested.sub_resource(&res);
            self.non_zero_requested.sub_resource(&non_zero);
        } else {
            self.requested.add_resource(&res);
            self.non_zero_requested.add_resource(&non_zero);
        }
    }
}
