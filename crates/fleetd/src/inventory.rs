//! Fleet inventory files.
//!
//! An inventory is a JSON document listing hosts, workloads already running
//! on them and workloads waiting to be placed.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fleetgrid_scheduler::{Scheduler, SchedulerResult};
use fleetgrid_state::{Host, Workload};

/// Hosts and workloads to load into a fresh scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Inventory {
    pub hosts: Vec<Host>,
    /// Workloads already bound to a host.
    pub running: Vec<Workload>,
    /// Workloads to schedule, in order.
    pub pending: Vec<Workload>,
}

impl Inventory {
    /// Read an inventory from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("parsing inventory {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Feed hosts and running workloads into the scheduler's cache.
    pub fn load_into(&self, scheduler: &Scheduler) -> SchedulerResult<()> {
        for host in &self.hosts {
            scheduler.add_host(host.clone());
        }
        for workload in &self.running {
            scheduler.add_workload(workload.clone())?;
        }
        Ok(())
    }
}
