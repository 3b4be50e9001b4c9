//! Scheduler error types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use fleetgrid_cache::CacheError;
use fleetgrid_framework::{FrameworkError, NodeToStatusMap, Status};

/// Why each host was rejected during one attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnosis {
    pub node_to_status: NodeToStatusMap,
    /// Plugins that rejected at least one host.
    pub unschedulable_plugins: BTreeSet<String>,
    /// Set when a PreFilter plugin rejected the workload for every host.
    pub pre_filter_msg: Option<String>,
    pub post_filter_msg: Option<String>,
    /// Host proposed by PostFilter, once its victims are gone.
    pub nominated_node: Option<String>,
}

/// No host can run the workload.
#[derive(Debug, Clone, PartialEq)]
pub struct FitError {
    pub workload: String,
    pub num_all_nodes: usize,
    pub diagnosis: Diagnosis,
}

impl FitError {
    /// `"<count> <reason>"` for every distinct rejection reason, sorted.
    fn reason_histogram(&self) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for status in self.diagnosis.node_to_status.values() {
            for reason in status.reasons() {
                *counts.entry(reason.as_str()).or_insert(0) += 1;
            }
        }
        let mut out: Vec<String> = counts
            .into_iter()
            .map(|(reason, n)| format!("{n} {reason}"))
            .collect();
        out.sort();
        out
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0/{} nodes are available:", self.num_all_nodes)?;
        match &self.diagnosis.pre_filter_msg {
            Some(msg) => write!(f, " {msg}.")?,
            None => write!(f, " {}.", self.reason_histogram().join(", "))?,
        }
        if let Some(msg) = &self.diagnosis.post_filter_msg {
            write!(f, " {msg}.")?;
        }
        Ok(())
    }
}

impl std::error::Error for FitError {}

/// Errors that can occur while scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no nodes available to schedule workloads")]
    NoNodesAvailable,

    #[error("{0}")]
    Fit(FitError),

    #[error("profile not found for scheduler name {0:?}")]
    ProfileNotFound(String),

    #[error("no scheduling profiles configured")]
    NoProfiles,

    #[error("duplicate profile with scheduler name {0:?}")]
    DuplicateProfile(String),

    #[error("{0}")]
    Status(Status),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error("scheduling workload {index} of {total}: {source}")]
    Batch {
        index: usize,
        total: usize,
        source: Box<SchedulerError>,
    },
}

impl SchedulerError {
    /// Whether the workload could not be placed, as opposed to an internal
    /// failure.
    pub fn is_unschedulable(&self) -> bool {
        match self {
            SchedulerError::NoNodesAvailable | SchedulerError::Fit(_) => true,
            SchedulerError::Status(s) => s.is_unschedulable(),
            SchedulerError::Batch { source, .. } => source.is_unschedulable(),
            _ => false,
        }
    }
}

/// Convenience alias for scheduler results.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
