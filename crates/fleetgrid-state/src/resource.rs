//! Aggregated resource quantities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{
    RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY, RESOURCE_PODS, ResourceList,
    Workload,
};

/// CPU assumed for a container that requests none, when scoring.
pub const DEFAULT_MILLI_CPU_REQUEST: i64 = 100;
/// Memory assumed for a container that requests none, when scoring.
pub const DEFAULT_MEMORY_REQUEST: i64 = 200 * 1024 * 1024;

/// Anything other than the built-in resources is tracked as a scalar.
pub fn is_scalar_resource_name(name: &str) -> bool {
    !matches!(
        name,
        RESOURCE_CPU | RESOURCE_MEMORY | RESOURCE_EPHEMERAL_STORAGE | RESOURCE_PODS
    )
}

/// Resource totals for a host or a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub milli_cpu: i64,
    pub memory: i64,
    pub ephemeral_storage: i64,
    pub allowed_pod_number: i64,
    pub scalar_resources: BTreeMap<String, i64>,
}

impl Resource {
    /// Sum of `list`.
    pub fn new(list: &ResourceList) -> Self {
        let mut r = Self::default();
        r.add(list);
        r
    }

    /// Add every quantity in `list`. Unknown names become scalars.
    pub fn add(&mut self, list: &ResourceList) {
        for (name, &qty) in list {
            match name.as_str() {
                RESOURCE_CPU => self.milli_cpu += qty,
                RESOURCE_MEMORY => self.memory += qty,
                RESOURCE_EPHEMERAL_STORAGE => self.ephemeral_storage += qty,
                RESOURCE_PODS => self.allowed_pod_number += qty,
                _ => self.add_scalar(name, qty),
            }
        }
    }

    /// Add `other` field by field.
    pub fn add_resource(&mut self, other: &Resource) {
        self.milli_cpu += other.milli_cpu;
        self.memory += other.memory;
        self.ephemeral_storage += other.ephemeral_storage;
        self.allowed_pod_number += other.allowed_pod_number;
        for (name, &qty) in &other.scalar_resources {
            self.add_scalar(name, qty);
        }
    }

    /// Subtract `other` field by field.
    pub fn sub_resource(&mut self, other: &Resource) {
        self.milli_cpu -= other.milli_cpu;
        self.memory -= other.memory;
        self.ephemeral_storage -= other.ephemeral_storage;
        self.allowed_pod_number -= other.allowed_pod_number;
        for (name, &qty) in &other.scalar_resources {
            self.add_scalar(name, -qty);
        }
    }

    pub fn add_scalar(&mut self, name: &str, qty: i64) {
        *self.scalar_resources.entry(name.to_string()).or_default() += qty;
    }

    /// Overwrite the quantity of scalar `name`.
    pub fn set_scalar(&mut self, name: &str, qty: i64) {
        self.scalar_resources.insert(name.to_string(), qty);
    }

    /// Raise each quantity to at least the value in `list`.
    pub fn set_max_resource(&mut self, list: &ResourceList) {
        for (name, &qty) in list {
            match name.as_str() {
                RESOURCE_CPU => self.milli_cpu = self.milli_cpu.max(qty),
                RESOURCE_MEMORY => self.memory = self.memory.max(qty),
                RESOURCE_EPHEMERAL_STORAGE => {
                    self.ephemeral_storage = self.ephemeral_storage.max(qty)
                }
                RESOURCE_PODS => self.allowed_pod_number = self.allowed_pod_number.max(qty),
                _ => {
                    let cur = self.scalar_resources.entry(name.clone()).or_default();
                    *cur = (*cur).max(qty);
                }
            }
        }
    }

    /// Quantity by resource name; absent scalars are zero.
    pub fn get(&self, name: &str) -> i64 {
        match name {
            RESOURCE_CPU => self.milli_cpu,
            RESOURCE_MEMORY => self.memory,
            RESOURCE_EPHEMERAL_STORAGE => self.ephemeral_storage,
            RESOURCE_PODS => self.allowed_pod_number,
            _ => self.scalar_resources.get(name).copied().unwrap_or(0),
        }
    }

    pub fn has_scalar(&self, name: &str) -> bool {
        self.scalar_resources.contains_key(name)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m memory={} ephemeral-storage={} pods={}",
            self.milli_cpu, self.memory, self.ephemeral_storage, self.allowed_pod_number
        )?;
        for (name, qty) in &self.scalar_resources {
            write!(f, " {name}={qty}")?;
        }
        Ok(())
    }
}

/// Effective request of a workload: the sum over containers, raised to the
/// largest init container, plus overhead.
pub fn workload_request(workload: &Workload) -> Resource {
    let mut res = Resource::default();
    for c in &workload.containers {
        res.add(&c.requests);
    }
    for c in &workload.init_containers {
        res.set_max_resource(&c.requests);
    }
    res.add(&workload.overhead);
    res
}

/// CPU and memory request of one container, substituting defaults for zero.
pub fn non_zero_requests(requests: &ResourceList) -> (i64, i64) {
    let cpu = match requests.get(RESOURCE_CPU).copied().unwrap_or(0) {
        0 => DEFAULT_MILLI_CPU_REQUEST,
        v => v,
    };
    let memory = match requests.get(RESOURCE_MEMORY).copied().unwrap_or(0) {
        0 => DEFAULT_MEMORY_REQUEST,
        v => v,
    };
    (cpu, memory)
}

/// Workload request together with its non-zero CPU and memory totals.
pub fn calculate_resource(workload: &Workload) -> (Resource, i64, i64) {
    let res = workload_request(workload);

    let (mut non0_cpu, mut non0_mem) = (0, 0);
    for c in &workload.containers {
        let (cpu, mem) = non_zero_requests(&c.requests);
        non0_cpu += cpu;
        non0_mem += mem;
    }
    for c in &workload.init_containers {
        let (cpu, mem) = non_zero_requests(&c.requests);
        non0_cpu = non0_cpu.max(cpu);
        non0_mem = non0_mem.max(mem);
    }
    non0_cpu += workload.overhead.get(RESOURCE_CPU).copied().unwrap_or(0);
    non0_mem += workload.overhead.get(RESOURCE_MEMORY).copied().unwrap_or(0);

    (res, non0_cpu, non0_mem)
}
