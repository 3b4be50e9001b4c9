//! Plugin outcomes and the result types exchanged between phases.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use fleetgrid_state::Workload;

/// Outcome class of a plugin call, ordered by precedence when merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Code {
    Success,
    /// The workload may fit elsewhere, or later.
    Unschedulable,
    /// Rejection that only an operator can fix (e.g. a host-name affinity).
    UnschedulableAndUnresolvable,
    /// Internal plugin or framework fault.
    Error,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Success => "Success",
            Code::Unschedulable => "Unschedulable",
            Code::UnschedulableAndUnresolvable => "UnschedulableAndUnresolvable",
            Code::Error => "Error",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a plugin: a code, human-readable reasons and the
/// plugin that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    reasons: Vec<String>,
    plugin: String,
}

impl Status {
    /// A status with a single reason.
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reasons: vec![reason.into()],
            plugin: String::new(),
        }
    }

    /// A status with any number of reasons.
    pub fn with_reasons(code: Code, reasons: Vec<String>) -> Self {
        Self {
            code,
            reasons,
            plugin: String::new(),
        }
    }

    pub fn success() -> Self {
        Self::with_reasons(Code::Success, Vec::new())
    }

    /// The workload does not fit this host right now.
    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Self::new(Code::Unschedulable, reason)
    }

    /// The workload cannot fit this host without outside intervention.
    pub fn unresolvable(reason: impl Into<String>) -> Self {
        Self::new(Code::UnschedulableAndUnresolvable, reason)
    }

    /// An internal failure.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Code::Error, reason)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Reasons joined with `", "`.
    pub fn message(&self) -> String {
        self.reasons.join(", ")
    }

    /// Name of the plugin that produced this status, if recorded.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Attribute the status to `plugin`.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    /// Both unschedulable flavours.
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self.code,
            Code::Unschedulable | Code::UnschedulableAndUnresolvable
        )
    }

    /// Keep `Unschedulable*` as-is; anything else becomes an `Error` whose
    /// message is prefixed with `context`.
    pub fn or_error(self, context: impl fmt::Display) -> Self {
        if self.is_unschedulable() {
            return self;
        }
        let plugin = self.plugin.clone();
        Status::error(format!("{context}: {}", self.message())).with_plugin(plugin)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message())
        }
    }
}

impl std::error::Error for Status {}

/// Plugin name → status.
pub type PluginToStatus = BTreeMap<String, Status>;

/// Host name → status of the Filter phase on that host.
pub type NodeToStatusMap = HashMap<String, Status>;

/// Combine per-plugin statuses into one. The highest-precedence code wins
/// and every reason is kept. `None` when there is nothing to merge.
pub fn merge_statuses(statuses: &PluginToStatus) -> Option<Status> {
    if statuses.is_empty() {
        return None;
    }
    let mut merged = Status::success();
    for status in statuses.values() {
        if status.code > merged.code {
            merged.code = status.code;
            merged.plugin = status.plugin.clone();
        }
        merged.reasons.extend(status.reasons.iter().cloned());
    }
    Some(merged)
}

// ── Phase results ──────────────────────────────────────────────────

/// Candidate host names from PreFilter. `None` means every host.
pub type PreFilterResult = Option<BTreeSet<String>>;

/// Intersect two PreFilter restrictions, treating `None` as "all hosts".
pub fn merge_pre_filter_results(a: PreFilterResult, b: PreFilterResult) -> PreFilterResult {
    match (a, b) {
        (None, None) => None,
        (None, Some(s)) | (Some(s), None) => Some(s),
        (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
    }
}

/// What a PostFilter plugin proposes so the workload can fit later.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostFilterResult {
    pub nominated_node_name: String,
    /// Workloads that would have to be evicted from the nominated host.
    pub victims: Vec<Arc<Workload>>,
}

/// Score of one host from one plugin (or the total, after summing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeScore {
    pub name: String,
    pub score: i64,
}

/// Plugin name → per-host scores, in host order.
pub type PluginToNodeScores = BTreeMap<String, Vec<NodeScore>>;
