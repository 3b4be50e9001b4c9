//! Authoritative host cache.
//!
//! The cache owns one [`NodeInfo`] per host plus the placement state of
//! every workload it knows about. Workloads go through two states:
//!
//! - **assumed**: placed by the scheduler, binding not yet confirmed
//! - **added**: confirmed by the reporting path
//!
//! Assumed workloads whose binding finished but were never confirmed
//! expire after the TTL. Hosts are kept in a recency list so
//! [`Cache::update_snapshot`] only copies what changed since the last
//! snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, enabled, error, info, warn, Level};

use fleetgrid_framework::{MetricsSink, NoopMetrics, Snapshot};
use fleetgrid_state::{Host, ImageStateSummary, NodeInfo, PodInfo, Workload};

use crate::error::{CacheError, CacheResult};
use crate::node_tree::NodeTree;
use crate::recency::RecencyList;

/// Default period of the expiry sweep.
pub const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(1);
/// Period of the debug dump emitted by [`Cache::run`].
pub const DUMP_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct PodState {
    workload: Arc<Workload>,
    /// Set once binding finished; the workload expires after it.
    deadline: Option<Instant>,
    binding_finished: bool,
}

#[derive(Debug, Clone)]
struct ImageState {
    size: i64,
    hosts: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    assumed_pods: HashSet<String>,
    pod_states: HashMap<String, PodState>,
    nodes: RecencyList<NodeInfo>,
    node_tree: NodeTree,
    image_states: HashMap<String, ImageState>,
}

/// Point-in-time copy of the cache for debugging.
#[derive(Debug, Clone)]
pub struct CacheDump {
    pub nodes: HashMap<String, NodeInfo>,
    pub assumed_pods: HashSet<String>,
}

/// Authoritative host and workload state, plus workloads assumed on a
/// host while their binding is in flight.
pub struct Cache {
    ttl: Duration,
    period: Duration,
    metrics: Arc<dyn MetricsSink>,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("ttl", &self.ttl)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Create a cache whose assumed workloads expire `ttl` after their
    /// binding finished.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            period: DEFAULT_CLEANUP_PERIOD,
            metrics: Arc::new(NoopMetrics),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Interval between sweeps of expired assumed workloads.
    pub fn with_cleanup_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Report cache sizes to `metrics` on every sweep.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// How long a workload stays assumed after its binding finished.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Tentatively place `workload` on `workload.node_name`.
    pub fn assume_pod(&self, workload: &Workload) -> CacheResult<()> {
        let key = workload.key()?;
        let mut inner = self.inner.write();
        if inner.pod_states.contains_key(key) {
            return Err(CacheError::AlreadyAssumed(key.to_string()));
        }
        inner.add_pod(Arc::new(workload.clone()), true)?;
        debug!(workload = %workload.full_name(), host = %workload.node_name, "assumed workload");
        Ok(())
    }

    /// Start the expiry clock of an assumed workload. Unknown or already
    /// confirmed workloads are ignored.
    pub fn finish_binding(&self, workload: &Workload) -> CacheResult<()> {
        self.finish_binding_at(workload, Instant::now())
    }

    /// [`Cache::finish_binding`] with an explicit clock.
    pub fn finish_binding_at(&self, workload: &Workload, now: Instant) -> CacheResult<()> {
        let key = workload.key()?;
        let mut inner = self.inner.write();
        if !inner.assumed_pods.contains(key) {
            return Ok(());
        }
        if let Some(state) = inner.pod_states.get_mut(key) {
            state.binding_finished = true;
            state.deadline = Some(now + self.ttl);
            debug!(workload = %workload.full_name(), "finished binding, workload can expire");
        }
        Ok(())
    }

    /// Drop an assumed workload.
    pub fn forget_pod(&self, workload: &Workload) -> CacheResult<()> {
        let key = workload.key()?;
        let mut inner = self.inner.write();

        let current = inner.pod_states.get(key).map(|s| s.workload.clone());
        if let Some(current) = &current {
            if current.node_name != workload.node_name {
                return Err(CacheError::AssumedOnDifferentHost {
                    key: key.to_string(),
                    assumed: workload.node_name.clone(),
                    assigned: current.node_name.clone(),
                });
            }
        }
        match current {
            Some(current) if inner.assumed_pods.contains(key) => inner.remove_pod(&current),
            _ => Err(CacheError::NotAssumed(key.to_string())),
        }
    }

    /// Record a workload confirmed by the reporting path.
    pub fn add_pod(&self, workload: Workload) -> CacheResult<()> {
        let key = workload.key()?.to_string();
        let workload = Arc::new(workload);
        let mut inner = self.inner.write();

        let current = inner.pod_states.get(&key).map(|s| s.workload.clone());
        match current {
            Some(current) if inner.assumed_pods.contains(&key) => {
                if current.node_name != workload.node_name {
                    warn!(
                        workload = %workload.full_name(),
                        assumed_host = %current.node_name,
                        host = %workload.node_name,
                        "workload was added to a different host than it was assumed on"
                    );
                    if let Err(e) = inner.update_pod(&current, workload) {
                        error!(error = %e, "moving workload to its reported host");
                    }
                } else {
                    inner.assumed_pods.remove(&key);
                    if let Some(state) = inner.pod_states.get_mut(&key) {
                        state.deadline = None;
                        state.workload = workload;
                    }
                }
                Ok(())
            }
            Some(_) => Err(CacheError::AlreadyAdded(key)),
            None => {
                // Expired or never assumed.
                if let Err(e) = inner.add_pod(workload, false) {
                    error!(error = %e, "adding workload");
                }
                Ok(())
            }
        }
    }

    /// Replace a confirmed workload. Moving it to another host this way
    /// means the cache missed an event and is reported as corruption.
    pub fn update_pod(&self, old: &Workload, new: Workload) -> CacheResult<()> {
        let key = old.key()?;
        let mut inner = self.inner.write();

        let current = match inner.pod_states.get(key) {
            Some(state) if !inner.assumed_pods.contains(key) => state.workload.clone(),
            _ => return Err(CacheError::NotAdded(key.to_string())),
        };
        if current.node_name != new.node_name {
            error!(
                workload = %old.full_name(),
                cached_host = %current.node_name,
                host = %new.node_name,
                "workload updated on a different host than previously added to"
            );
            return Err(CacheError::Corrupted(format!(
                "workload {key} updated on host {:?} but cached on {:?}",
                new.node_name, current.node_name
            )));
        }
        inner.update_pod(old, Arc::new(new))
    }

    /// Remove a confirmed or assumed workload. A host name that disagrees
    /// with the cached one is reported as corruption unless it is empty.
    pub fn remove_pod(&self, workload: &Workload) -> CacheResult<()> {
        let key = workload.key()?;
        let mut inner = self.inner.write();

        let current = inner
            .pod_states
            .get(key)
            .map(|s| s.workload.clone())
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        if current.node_name != workload.node_name {
            error!(
                workload = %workload.full_name(),
                cached_host = %current.node_name,
                host = %workload.node_name,
                "workload removed from a different host than it was added to"
            );
            // An empty host name means the reporting path lost track of the
            // binding; the cached copy is authoritative then.
            if !workload.node_name.is_empty() {
                return Err(CacheError::Corrupted(format!(
                    "workload {key} removed from host {:?} but cached on {:?}",
                    workload.node_name, current.node_name
                )));
            }
        }
        inner.remove_pod(&current)
    }

    /// Whether `workload` is assumed and not yet confirmed.
    pub fn is_assumed_pod(&self, workload: &Workload) -> CacheResult<bool> {
        let key = workload.key()?;
        Ok(self.inner.read().assumed_pods.contains(key))
    }

    /// Cached copy of `workload`, even if its host was removed since.
    pub fn get_pod(&self, workload: &Workload) -> CacheResult<Arc<Workload>> {
        let key = workload.key()?;
        self.inner
            .read()
            .pod_states
            .get(key)
            .map(|s| s.workload.clone())
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Add or replace a host and return a copy of its `NodeInfo`. A host that
    /// was removed while workloads remained on it is revived.
    pub fn add_node(&self, host: Host) -> NodeInfo {
        let mut inner = self.inner.write();
        let Inner {
            nodes,
            node_tree,
            image_states,
            ..
        } = &mut *inner;

        let info = nodes.get_or_insert_with(&host.name, NodeInfo::new);
        if let Some(previous) = info.host() {
            remove_host_image_states(image_states, previous);
        }
        node_tree.add_node(&host);
        info.image_states = add_host_image_states(image_states, &host);
        info.set_host(Arc::new(host));
        let out = info.clone();
        nodes.move_to_head(out.name());
        info!(host = %out.name(), "host added to cache");
        out
    }

    /// Replace a host's description, keeping its workloads.
    pub fn update_node(&self, old: &Host, new: Host) -> NodeInfo {
        let mut inner = self.inner.write();
        let Inner {
            nodes,
            node_tree,
            image_states,
            ..
        } = &mut *inner;

        let info = nodes.get_or_insert_with(&new.name, NodeInfo::new);
        match info.host() {
            Some(previous) => {
                remove_host_image_states(image_states, previous);
                node_tree.update_node(Some(old), &new);
            }
            // New host, or a ghost reported again.
            None => node_tree.add_node(&new),
        }
        info.image_states = add_host_image_states(image_states, &new);
        info.set_host(Arc::new(new));
        let out = info.clone();
        nodes.move_to_head(out.name());
        debug!(host = %out.name(), "host updated in cache");
        out
    }

    /// Remove a host. Its `NodeInfo` stays behind as a ghost until every
    /// workload on it has been removed; ghosts never appear in snapshots.
    pub fn remove_node(&self, host: &Host) -> CacheResult<()> {
        let mut inner = self.inner.write();
        let Inner {
            nodes,
            node_tree,
            image_states,
            ..
        } = &mut *inner;

        let info = nodes
            .get_mut(&host.name)
            .ok_or_else(|| CacheError::HostNotFound(host.name.clone()))?;
        info.remove_host();
        if info.pods.is_empty() {
            nodes.remove(&host.name);
        } else {
            debug!(host = %host.name, workloads = info.pods.len(), "keeping ghost host until its workloads are removed");
            nodes.move_to_head(&host.name);
        }
        node_tree.remove_node(host)?;
        remove_host_image_states(image_states, host);
        info!(host = %host.name, "host removed from cache");
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Bring `snapshot` up to date, copying only hosts changed since its
    /// generation.
    pub fn update_snapshot(&self, snapshot: &mut Snapshot) -> CacheResult<()> {
        let inner = self.inner.write();
        let last_generation = snapshot.generation;

        let mut update_all_lists = false;
        let mut update_affinity = false;
        let mut update_anti_affinity = false;

        for (_, info) in inner.nodes.iter() {
            if info.generation <= last_generation {
                break;
            }
            if info.host().is_none() {
                continue;
            }
            let name = info.name();
            let (had_affinity, had_anti_affinity) = match snapshot.node_info_map.get(name) {
                Some(existing) => (
                    !existing.pods_with_affinity.is_empty(),
                    !existing.pods_with_required_anti_affinity.is_empty(),
                ),
                None => {
                    update_all_lists = true;
                    (false, false)
                }
            };
            if had_affinity != !info.pods_with_affinity.is_empty() {
                update_affinity = true;
            }
            if had_anti_affinity != !info.pods_with_required_anti_affinity.is_empty() {
                update_anti_affinity = true;
            }
            snapshot.node_info_map.insert(name.to_string(), info.clone());
        }
        if let Some(head) = inner.nodes.head() {
            snapshot.generation = head.generation;
        }

        // Removed hosts leave the tree first; ghosts may still be cached.
        if snapshot.node_info_map.len() > inner.node_tree.num_nodes() {
            inner.remove_deleted_nodes_from_snapshot(snapshot);
            update_all_lists = true;
        }

        if update_all_lists || update_affinity || update_anti_affinity {
            inner.update_node_info_snapshot_list(snapshot, update_all_lists);
        }

        if snapshot.node_info_list.len() != inner.node_tree.num_nodes() {
            let err = CacheError::InconsistentSnapshot {
                list: snapshot.node_info_list.len(),
                tree: inner.node_tree.num_nodes(),
                map: snapshot.node_info_map.len(),
                cached: inner.nodes.len(),
            };
            error!(error = %err, "rebuilding snapshot lists");
            inner.update_node_info_snapshot_list(snapshot, true);
            return Err(err);
        }
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Hosts in the cache, ghosts included.
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Workloads across every cached host, ghosts included.
    pub fn pod_count(&self) -> usize {
        self.inner
            .read()
            .nodes
            .iter()
            .map(|(_, info)| info.pods.len())
            .sum()
    }

    /// Copy every host and the set of assumed workloads.
    pub fn dump(&self) -> CacheDump {
        let inner = self.inner.read();
        CacheDump {
            nodes: inner
                .nodes
                .iter()
                .map(|(name, info)| (name.to_string(), info.clone()))
                .collect(),
            assumed_pods: inner.assumed_pods.clone(),
        }
    }

    /// Log every host's usage at debug level.
    pub fn dump_to_log(&self) {
        if !enabled!(Level::DEBUG) {
            return;
        }
        let dump = self.dump();
        debug!(assumed_pods = dump.assumed_pods.len(), "cache dump");
        let ordered: BTreeMap<&String, &NodeInfo> = dump.nodes.iter().collect();
        for (name, info) in ordered {
            debug!(
                host = %name,
                workloads = info.pods.len(),
                unused_milli_cpu = info.allocatable.milli_cpu - info.requested.milli_cpu,
                unused_memory_mb = (info.allocatable.memory - info.requested.memory) / 1_000_000,
                requested_milli_cpu = info.requested.milli_cpu,
                requested_memory_mb = info.requested.memory / 1_000_000,
                labels = ?info.host().map(|h| &h.labels),
                "cache dump"
            );
        }
    }

    // ── Expiry ─────────────────────────────────────────────────────

    /// Remove assumed workloads whose binding finished and whose deadline
    /// passed before `now`, then report cache sizes.
    pub fn cleanup_assumed_pods(&self, now: Instant) -> CacheResult<()> {
        let mut inner = self.inner.write();
        let result = inner.cleanup_assumed_pods(now);
        self.metrics
            .set_cache_size("assumed_pods", inner.assumed_pods.len() as i64);
        self.metrics
            .set_cache_size("pods", inner.pod_states.len() as i64);
        self.metrics.set_cache_size("nodes", inner.nodes.len() as i64);
        result
    }

    /// Sweep expired workloads every cleanup period and dump the cache
    /// every [`DUMP_PERIOD`] until `shutdown` changes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_ms = self.period.as_millis() as u64,
            ttl_secs = self.ttl.as_secs(),
            "cache expiry loop started"
        );
        let mut cleanup = tokio::time::interval(self.period);
        let mut dump = tokio::time::interval(DUMP_PERIOD);

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_assumed_pods(Instant::now()) {
                        error!(error = %e, "expiring assumed workloads");
                    }
                }
                _ = dump.tick() => self.dump_to_log(),
                _ = shutdown.changed() => {
                    info!("cache expiry loop shutting down");
                    break;
                }
            }
        }
    }
}

impl Inner {
    fn add_pod(&mut self, workload: Arc<Workload>, assumed: bool) -> CacheResult<()> {
        let key = workload.key()?.to_string();
        let info = self.nodes.get_or_insert_with(&workload.node_name, NodeInfo::new);
        info.add_pod_info(Arc::new(PodInfo::from_arc(workload.clone())));
        self.nodes.move_to_head(&workload.node_name);
        if assumed {
            self.assumed_pods.insert(key.clone());
        }
        self.pod_states.insert(
            key,
            PodState {
                workload,
                deadline: None,
                binding_finished: false,
            },
        );
        Ok(())
    }

    fn update_pod(&mut self, old: &Workload, new: Arc<Workload>) -> CacheResult<()> {
        self.remove_pod(old)?;
        self.add_pod(new, false)
    }

    /// Drop `workload` from its host and from the placement state. A ghost
    /// host left without workloads is dropped as well.
    fn remove_pod(&mut self, workload: &Workload) -> CacheResult<()> {
        let key = workload.key()?;
        let host = workload.node_name.as_str();
        match self.nodes.get_mut(host) {
            None => {
                error!(host, workload = %workload.full_name(), "host not found when removing workload");
            }
            Some(info) => {
                info.remove_pod(workload)?;
                if info.pods.is_empty() && info.host().is_none() {
                    self.nodes.remove(host);
                } else {
                    self.nodes.move_to_head(host);
                }
            }
        }
        self.pod_states.remove(key);
        self.assumed_pods.remove(key);
        Ok(())
    }

    fn cleanup_assumed_pods(&mut self, now: Instant) -> CacheResult<()> {
        let keys: Vec<String> = self.assumed_pods.iter().cloned().collect();
        for key in keys {
            let Some(state) = self.pod_states.get(&key) else {
                return Err(CacheError::Corrupted(format!(
                    "key {key} found in assumed set but not in workload states"
                )));
            };
            if !state.binding_finished {
                debug!(workload = %state.workload.full_name(), "binding still in progress, not expiring");
                continue;
            }
            if state.deadline.is_some_and(|d| now > d) {
                let workload = state.workload.clone();
                info!(workload = %workload.full_name(), host = %workload.node_name, "assumed workload expired");
                if let Err(e) = self.remove_pod(&workload) {
                    error!(error = %e, workload = %workload.full_name(), "expiring workload");
                }
            }
        }
        Ok(())
    }

    fn remove_deleted_nodes_from_snapshot(&self, snapshot: &mut Snapshot) {
        let mut to_delete = snapshot
            .node_info_map
            .len()
            .saturating_sub(self.node_tree.num_nodes());
        snapshot.node_info_map.retain(|name, _| {
            if to_delete == 0 {
                return true;
            }
            let live = self.nodes.get(name).is_some_and(|n| n.host().is_some());
            if !live {
                to_delete -= 1;
            }
            live
        });
    }

    fn update_node_info_snapshot_list(&self, snapshot: &mut Snapshot, update_all: bool) {
        if update_all {
            let names = match self.node_tree.list() {
                Ok(names) => names,
                Err(e) => {
                    error!(error = %e, "listing hosts from node tree");
                    Vec::new()
                }
            };
            snapshot.node_info_list = Vec::with_capacity(names.len());
            for name in names {
                if snapshot.node_info_map.contains_key(&name) {
                    snapshot.node_info_list.push(name);
                } else {
                    error!(host = %name, "host exists in node tree but not in snapshot map");
                }
            }
        }

        let mut with_affinity = Vec::new();
        let mut with_anti_affinity = Vec::new();
        for name in &snapshot.node_info_list {
            let Some(info) = snapshot.node_info_map.get(name) else {
                continue;
            };
            if !info.pods_with_affinity.is_empty() {
                with_affinity.push(name.clone());
            }
            if !info.pods_with_required_anti_affinity.is_empty() {
                with_anti_affinity.push(name.clone());
            }
        }
        snapshot.have_pods_with_affinity_list = with_affinity;
        snapshot.have_pods_with_required_anti_affinity_list = with_anti_affinity;
    }
}

/// Register `host`'s images and return the per-image summary for its
/// `NodeInfo`.
fn add_host_image_states(
    states: &mut HashMap<String, ImageState>,
    host: &Host,
) -> BTreeMap<String, ImageStateSummary> {
    let mut summary = BTreeMap::new();
    for image in &host.images {
        for name in &image.names {
            let state = states.entry(name.clone()).or_insert_with(|| ImageState {
                size: image.size_bytes,
                hosts: BTreeSet::new(),
            });
            state.hosts.insert(host.name.clone());
            summary.entry(name.clone()).or_insert(ImageStateSummary {
                size: state.size,
                num_nodes: state.hosts.len(),
            });
        }
    }
    summary
}

/// Forget `host` in every image entry; images left on no host are dropped.
fn remove_host_image_states(states: &mut HashMap<String, ImageState>, host: &Host) {
    for image in &host.images {
        for name in &image.names {
            if let Some(state) = states.get_mut(name) {
                state.hosts.remove(&host.name);
                if state.hosts.is_empty() {
                    states.remove(name);
                }
            }
        }
    }
}
