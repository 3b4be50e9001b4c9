//! Cache error types.

use thiserror::Error;

use fleetgrid_state::StateError;

/// Errors returned by the host cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("workload {0} is not found in the cache")]
    NotFound(String),

    #[error("workload {0} is in the cache, so can't be assumed")]
    AlreadyAssumed(String),

    #[error("workload {0} was already in added state")]
    AlreadyAdded(String),

    #[error("workload {0} wasn't assumed so cannot be forgotten")]
    NotAssumed(String),

    #[error("workload {key} was assumed on {assumed} but assigned to {assigned}")]
    AssumedOnDifferentHost {
        key: String,
        assumed: String,
        assigned: String,
    },

    #[error("workload {0} is not added to the cache, so cannot be updated")]
    NotAdded(String),

    #[error("host {0} is not found")]
    HostNotFound(String),

    /// The cache's own bookkeeping disagrees with what callers report. Further
    /// decisions based on it cannot be trusted.
    #[error("cache is corrupted: {0}")]
    Corrupted(String),

    #[error(
        "snapshot state is not consistent, length of host list={list} not equal to hosts in tree={tree}, \
         host map={map}, hosts in cache={cached}"
    )]
    InconsistentSnapshot {
        list: usize,
        tree: usize,
        map: usize,
        cached: usize,
    },

    #[error("node tree: {0}")]
    NodeTree(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl CacheError {
    /// Whether the error signals broken cache invariants rather than a bad
    /// request.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CacheError::Corrupted(_) | CacheError::InconsistentSnapshot { .. }
        )
    }
}

/// Convenience alias for cache results.
pub type CacheResult<T> = Result<T, CacheError>;
