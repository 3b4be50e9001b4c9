//! Plugin capability traits and the extension points they attach to.
//!
//! A plugin is any type implementing [`Plugin`] plus one or more of the
//! capability traits. Factories return a [`PluginInstance`] listing the
//! capabilities the plugin offers; the runtime checks them when it builds
//! a profile instead of probing types at run time.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use fleetgrid_state::{NodeInfo, PodInfo, Workload};

use crate::cycle_state::CycleState;
use crate::parallelize::Parallelizer;
use crate::snapshot::Snapshot;
use crate::status::{NodeScore, NodeToStatusMap, PostFilterResult, PreFilterResult, Status};

/// Highest score a Score plugin may return after normalization.
pub const MAX_NODE_SCORE: i64 = 100;
/// Lowest score a Score plugin may return after normalization.
pub const MIN_NODE_SCORE: i64 = 0;
/// Ceiling for the sum of all weighted scores.
pub const MAX_TOTAL_SCORE: i64 = i64::MAX;

/// Named phases of the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ExtensionPoint {
    PreFilter,
    Filter,
    PostFilter,
    PreScore,
    Score,
    Reserve,
    Unreserve,
}

impl ExtensionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionPoint::PreFilter => "PreFilter",
            ExtensionPoint::Filter => "Filter",
            ExtensionPoint::PostFilter => "PostFilter",
            ExtensionPoint::PreScore => "PreScore",
            ExtensionPoint::Score => "Score",
            ExtensionPoint::Reserve => "Reserve",
            ExtensionPoint::Unreserve => "Unreserve",
        }
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capabilities ───────────────────────────────────────────────────

/// Common supertrait of every extension point trait.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

/// Runs once per attempt before any host is filtered. May restrict the
/// candidate hosts.
pub trait PreFilterPlugin: Plugin {
    fn pre_filter(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status>;

    /// Incremental updates of the state written by `pre_filter`, used when
    /// evaluating hypothetical additions or removals (preemption).
    fn extensions(&self) -> Option<&dyn PreFilterExtensions> {
        None
    }
}

/// Keeps a PreFilter plugin's cycle state in step when workloads are
/// hypothetically added to or removed from a host.
pub trait PreFilterExtensions: Send + Sync {
    fn add_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_add: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status>;

    fn remove_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_remove: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status>;
}

/// Decides whether one host can run the workload. Called concurrently
/// for different hosts.
pub trait FilterPlugin: Plugin {
    fn filter(&self, state: &CycleState, workload: &Workload, node: &NodeInfo)
    -> Result<(), Status>;
}

/// Runs only when no host passed Filter.
pub trait PostFilterPlugin: Plugin {
    fn post_filter(
        &self,
        handle: &dyn Handle,
        state: &CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        statuses: &NodeToStatusMap,
    ) -> Result<PostFilterResult, Status>;
}

/// Runs once per attempt over the feasible hosts before scoring.
pub trait PreScorePlugin: Plugin {
    fn pre_score(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        nodes: &[&NodeInfo],
    ) -> Result<(), Status>;
}

/// Ranks one host. Called concurrently for different hosts.
pub trait ScorePlugin: Plugin {
    fn score(&self, state: &CycleState, workload: &Workload, node: &NodeInfo)
    -> Result<i64, Status>;

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        None
    }
}

/// Optional companion of a [`ScorePlugin`].
pub trait ScoreExtensions: Send + Sync {
    /// Rescale this plugin's scores for all hosts into
    /// `[MIN_NODE_SCORE, MAX_NODE_SCORE]`.
    fn normalize_score(
        &self,
        state: &CycleState,
        workload: &Workload,
        scores: &mut [NodeScore],
    ) -> Result<(), Status>;
}

/// Claims resources on the chosen host; `unreserve` undoes `reserve` and
/// must be idempotent.
pub trait ReservePlugin: Plugin {
    fn reserve(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        node_name: &str,
    ) -> Result<(), Status>;

    fn unreserve(&self, state: &mut CycleState, workload: &Workload, node_name: &str);
}

/// Runtime services offered to plugins that need to re-run parts of the
/// pipeline.
pub trait Handle: Send + Sync {
    fn run_filter_plugins(
        &self,
        state: &CycleState,
        workload: &Workload,
        node: &NodeInfo,
    ) -> Result<(), Status>;

    fn run_pre_filter_extension_add_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_add: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status>;

    fn run_pre_filter_extension_remove_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_remove: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status>;

    fn parallelizer(&self) -> &Parallelizer;
}

// ── Instances ──────────────────────────────────────────────────────

/// A constructed plugin and the capabilities it exposes.
#[derive(Clone)]
pub struct PluginInstance {
    name: String,
    pub pre_filter: Option<Arc<dyn PreFilterPlugin>>,
    pub filter: Option<Arc<dyn FilterPlugin>>,
    pub post_filter: Option<Arc<dyn PostFilterPlugin>>,
    pub pre_score: Option<Arc<dyn PreScorePlugin>>,
    pub score: Option<Arc<dyn ScorePlugin>>,
    pub reserve: Option<Arc<dyn ReservePlugin>>,
}

impl PluginInstance {
    /// An instance named `name` implementing no extension point yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pre_filter: None,
            filter: None,
            post_filter: None,
            pre_score: None,
            score: None,
            reserve: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the PreFilter implementation.
    pub fn with_pre_filter(mut self, p: Arc<dyn PreFilterPlugin>) -> Self {
        self.pre_filter = Some(p);
        self
    }

    /// Register the Filter implementation.
    pub fn with_filter(mut self, p: Arc<dyn FilterPlugin>) -> Self {
        self.filter = Some(p);
        self
    }

    /// Register the PostFilter implementation.
    pub fn with_post_filter(mut self, p: Arc<dyn PostFilterPlugin>) -> Self {
        self.post_filter = Some(p);
        self
    }

    /// Register the PreScore implementation.
    pub fn with_pre_score(mut self, p: Arc<dyn PreScorePlugin>) -> Self {
        self.pre_score = Some(p);
        self
    }

    /// Register the Score implementation.
    pub fn with_score(mut self, p: Arc<dyn ScorePlugin>) -> Self {
        self.score = Some(p);
        self
    }

    /// Register the Reserve implementation.
    pub fn with_reserve(mut self, p: Arc<dyn ReservePlugin>) -> Self {
        self.reserve = Some(p);
        self
    }

    /// Whether this instance can be attached to `point`.
    pub fn implements(&self, point: ExtensionPoint) -> bool {
        match point {
            ExtensionPoint::PreFilter => self.pre_filter.is_some(),
            ExtensionPoint::Filter => self.filter.is_some(),
            ExtensionPoint::PostFilter => self.post_filter.is_some(),
            ExtensionPoint::PreScore => self.pre_score.is_some(),
            ExtensionPoint::Score => self.score.is_some(),
            ExtensionPoint::Reserve | ExtensionPoint::Unreserve => self.reserve.is_some(),
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let points: Vec<&str> = [
            ExtensionPoint::PreFilter,
            ExtensionPoint::Filter,
            ExtensionPoint::PostFilter,
            ExtensionPoint::PreScore,
            ExtensionPoint::Score,
            ExtensionPoint::Reserve,
        ]
        .into_iter()
        .filter(|p| self.implements(*p))
        .map(|p| p.as_str())
        .collect();
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("extension_points", &points)
            .finish()
    }
}

/// Scale `scores` into `[0, max_priority]` relative to the highest score.
/// With `reverse`, higher raw scores become lower.
pub fn default_normalize_score(max_priority: i64, reverse: bool, scores: &mut [NodeScore]) {
    let max_count = scores.iter().map(|s| s.score).max().unwrap_or(0);
    if max_count == 0 {
        if reverse {
            for s in scores.iter_mut() {
                s.score = max_priority;
            }
        }
        return;
    }
    for s in scores.iter_mut() {
        let mut score = max_priority * s.score / max_count;
        if reverse {
            score = max_priority - score;
        }
        s.score = score;
    }
}
