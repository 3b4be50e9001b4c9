//! Error types for the FleetGrid domain model.

use thiserror::Error;

/// Result type alias for domain model operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while manipulating workloads and host aggregates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot get cache key for workload {0} with empty UID")]
    EmptyKey(String),

    #[error("no corresponding workload {workload} in workloads of host {host}")]
    WorkloadNotOnHost { workload: String, host: String },
}
