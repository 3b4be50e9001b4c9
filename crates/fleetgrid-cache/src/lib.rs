//! fleetgrid-cache: authoritative per-host state for the scheduler.
//!
//! [`Cache`] tracks hosts and the workloads placed on them, including
//! assumed placements that still wait for binding confirmation, and
//! refreshes [`Snapshot`](fleetgrid_framework::Snapshot)s incrementally.
//! [`NodeTree`] orders hosts round-robin across zones.

pub mod cache;
pub mod error;
pub mod node_tree;
pub mod recency;

pub use cache::{Cache, CacheDump, DEFAULT_CLEANUP_PERIOD};
pub use error::{CacheError, CacheResult};
pub use node_tree::{NodeTree, zone_key};
pub use recency::RecencyList;
