//! fleetgrid-scheduler: workload placement on top of the framework.
//!
//! Wires a [`Cache`](fleetgrid_cache::Cache), one
//! [`Framework`](fleetgrid_framework::Framework) per profile and the
//! schedule-one flow together:
//!
//! - Host and workload events reconcile the cache
//! - `schedule_one` picks a host and assumes the workload there
//! - `schedule` places a batch, optionally as a dry run
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Cache (hosts, assumed workloads, snapshot source)
//!   ├── Framework per profile (plugins by extension point)
//!   └── Cycle (snapshot, rotating start index, rng)
//! ```

pub mod error;
pub mod scheduler;
pub mod statistics;

pub use error::{Diagnosis, FitError, SchedulerError, SchedulerResult};
pub use scheduler::{
    ScheduleResult, Scheduler, num_feasible_nodes_to_find, select_host,
};
pub use statistics::{HostStatistics, host_statistics, max_new_workloads};
