//! fleetgrid-state: domain model for the FleetGrid scheduler.
//!
//! Holds the in-memory representations the scheduling core works on:
//! - `Workload` / `Host` as supplied by the API and reporting layers
//! - `Resource` totals and workload request computation
//! - `PodInfo` / `NodeInfo` per-host aggregates owned by the cache
//! - label, node selector and toleration matching

pub mod error;
pub mod node_info;
pub mod resource;
pub mod selector;
pub mod types;

pub use error::{StateError, StateResult};
pub use node_info::{
    AffinityTerm, ImageStateSummary, NodeInfo, PodInfo, WeightedAffinityTerm, next_generation,
};
pub use resource::{
    DEFAULT_MEMORY_REQUEST, DEFAULT_MILLI_CPU_REQUEST, Resource, calculate_resource,
    is_scalar_resource_name, non_zero_requests, workload_request,
};
pub use selector::{find_untolerated_taint, selector_matches};
pub use types::*;
