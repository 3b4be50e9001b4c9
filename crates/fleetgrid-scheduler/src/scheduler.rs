//! Scheduler: places workloads on hosts one at a time.
//!
//! Every attempt:
//! - refreshes the scheduler's snapshot from the cache
//! - runs the workload's profile (PreFilter, Filter, PostFilter when
//!   nothing fits, PreScore, Score) against that snapshot
//! - assumes the workload on the chosen host and runs Reserve
//!
//! Attempts are serialized; the snapshot and the rotating start index are
//! owned by the scheduler and only touched under its cycle lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use fleetgrid_cache::{Cache, CacheError};
use fleetgrid_framework::config::DEFAULT_SCHEDULER_NAME;
use fleetgrid_framework::{
    AttemptResult, CancelToken, Code, CycleState, ErrorChannel, Framework, FrameworkOptions,
    MetricsSink, NodeScore, NoopMetrics, Parallelizer, Registry, SchedulerConfig, Snapshot,
    Status,
};
use fleetgrid_state::{Host, NodeInfo, Workload, workload_request};

use crate::error::{Diagnosis, FitError, SchedulerError, SchedulerResult};
use crate::statistics::{HostStatistics, host_statistics};

/// Below this many hosts every host is evaluated.
pub const MIN_FEASIBLE_NODES_TO_FIND: usize = 100;
/// Floor of the adaptive share of hosts evaluated in large fleets.
pub const MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND: i64 = 5;
/// Share of attempts, in percent, whose per-plugin timings are recorded.
const PLUGIN_METRICS_SAMPLE_PERCENT: u32 = 10;

/// Outcome of a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleResult {
    pub workload: String,
    pub suggested_host: String,
    /// Hosts that went through Filter.
    pub evaluated_nodes: usize,
    /// Hosts that passed Filter.
    pub feasible_nodes: usize,
}

/// State carried from one attempt to the next.
struct Cycle {
    snapshot: Snapshot,
    next_start_node_index: usize,
    rng: StdRng,
}

/// Places workloads using one [`Framework`] per configured profile.
pub struct Scheduler {
    cache: Arc<Cache>,
    profiles: HashMap<String, Framework>,
    percentage_of_nodes_to_score: u32,
    metrics: Arc<dyn MetricsSink>,
    cycle: Mutex<Cycle>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field(
                "percentage_of_nodes_to_score",
                &self.percentage_of_nodes_to_score,
            )
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build every profile of `config` from `registry`, with a fresh cache.
    pub fn new(config: &SchedulerConfig, registry: &Registry) -> SchedulerResult<Self> {
        Self::with_metrics(config, registry, Arc::new(NoopMetrics))
    }

    /// Like [`Scheduler::new`], reporting to `metrics`.
    pub fn with_metrics(
        config: &SchedulerConfig,
        registry: &Registry,
        metrics: Arc<dyn MetricsSink>,
    ) -> SchedulerResult<Self> {
        if config.profiles.is_empty() {
            return Err(SchedulerError::NoProfiles);
        }

        let options = FrameworkOptions::default()
            .with_parallelizer(Parallelizer::new(config.parallelism)?)
            .with_metrics(metrics.clone());
        let mut profiles = HashMap::new();
        for profile in &config.profiles {
            if profiles.contains_key(&profile.scheduler_name) {
                return Err(SchedulerError::DuplicateProfile(
                    profile.scheduler_name.clone(),
                ));
            }
            let fw = Framework::new(registry, profile, options.clone())?;
            debug!(profile = %profile.scheduler_name, plugins = ?fw.list_plugins(), "built profile");
            profiles.insert(profile.scheduler_name.clone(), fw);
        }

        let cache = Cache::new(config.assumed_ttl())
            .with_cleanup_period(config.cleanup_period())
            .with_metrics(metrics.clone());

        info!(
            profiles = profiles.len(),
            parallelism = config.parallelism,
            percentage_of_nodes_to_score = config.percentage_of_nodes_to_score,
            "scheduler created"
        );
        Ok(Self {
            cache: Arc::new(cache),
            profiles,
            percentage_of_nodes_to_score: config.percentage_of_nodes_to_score,
            metrics,
            cycle: Mutex::new(Cycle {
                snapshot: Snapshot::new(),
                next_start_node_index: 0,
                rng: StdRng::from_entropy(),
            }),
        })
    }

    /// The cache backing this scheduler. Run [`Cache::run`] on it to expire
    /// assumed workloads.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Configured profile names, sorted.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn framework_for(&self, workload: &Workload) -> SchedulerResult<&Framework> {
        let name = if workload.scheduler_name.is_empty() {
            DEFAULT_SCHEDULER_NAME
        } else {
            workload.scheduler_name.as_str()
        };
        self.profiles
            .get(name)
            .ok_or_else(|| SchedulerError::ProfileNotFound(name.to_string()))
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Pick a host for `workload`, assume it there and finish binding.
    pub fn schedule_one(&self, workload: &Workload) -> SchedulerResult<ScheduleResult> {
        let start = Instant::now();
        let fw = self.framework_for(workload)?;

        let result = {
            let mut cycle = self.cycle.lock();
            self.schedule_locked(&mut cycle, fw, workload)
        };

        let outcome = match &result {
            Ok(r) => {
                info!(
                    workload = %workload.full_name(),
                    host = %r.suggested_host,
                    evaluated = r.evaluated_nodes,
                    feasible = r.feasible_nodes,
                    "scheduled workload"
                );
                AttemptResult::Scheduled
            }
            Err(e) if e.is_unschedulable() => {
                info!(workload = %workload.full_name(), reason = %e, "unable to schedule workload");
                AttemptResult::Unschedulable
            }
            Err(e) => {
                error!(workload = %workload.full_name(), error = %e, "error scheduling workload");
                AttemptResult::Error
            }
        };
        self.metrics
            .observe_attempt(outcome, fw.profile_name(), start.elapsed());
        result
    }

    fn schedule_locked(
        &self,
        cycle: &mut Cycle,
        fw: &Framework,
        workload: &Workload,
    ) -> SchedulerResult<ScheduleResult> {
        if let Err(e) = self.cache.update_snapshot(&mut cycle.snapshot) {
            if e.is_corruption() {
                error!(error = %e, "cache invariants violated");
            }
            return Err(e.into());
        }

        let Cycle {
            snapshot,
            next_start_node_index,
            rng,
        } = cycle;
        if snapshot.num_nodes() == 0 {
            return Err(SchedulerError::NoNodesAvailable);
        }

        let mut state = CycleState::new();
        state.set_record_plugin_metrics(rng.gen_range(0..100) < PLUGIN_METRICS_SAMPLE_PERCENT);

        let (feasible, diagnosis) =
            self.find_nodes_that_fit(fw, &mut state, workload, snapshot, next_start_node_index)?;
        if feasible.is_empty() {
            return Err(self.fit_error(fw, &state, workload, snapshot, diagnosis));
        }
        let evaluated_nodes = feasible.len() + diagnosis.node_to_status.len();

        let host = if feasible.len() == 1 {
            feasible[0].name().to_string()
        } else {
            let scores = self.prioritize_nodes(fw, &mut state, workload, snapshot, &feasible)?;
            select_host(&scores, rng)
                .ok_or_else(|| SchedulerError::Status(Status::error("empty priority list")))?
                .to_string()
        };

        self.assume_and_reserve(fw, &mut state, workload, &host)?;
        Ok(ScheduleResult {
            workload: workload.full_name(),
            suggested_host: host,
            evaluated_nodes,
            feasible_nodes: feasible.len(),
        })
    }

    /// Run PreFilter and Filter. PreFilter rejections mark every host with
    /// the same status.
    fn find_nodes_that_fit<'a>(
        &self,
        fw: &Framework,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &'a Snapshot,
        next_start_node_index: &mut usize,
    ) -> SchedulerResult<(Vec<&'a NodeInfo>, Diagnosis)> {
        let mut diagnosis = Diagnosis::default();

        let restriction = match fw.run_pre_filter_plugins(state, workload, snapshot) {
            Ok(restriction) => restriction,
            Err(s) if s.code() == Code::Error => return Err(SchedulerError::Status(s)),
            Err(s) => {
                for node in snapshot.list() {
                    diagnosis
                        .node_to_status
                        .insert(node.name().to_string(), s.clone());
                }
                if !s.plugin().is_empty() {
                    diagnosis.unschedulable_plugins.insert(s.plugin().to_string());
                }
                diagnosis.pre_filter_msg = Some(s.message());
                return Ok((Vec::new(), diagnosis));
            }
        };

        let nodes: Vec<&NodeInfo> = match &restriction {
            Some(names) => names
                .iter()
                .map(|n| {
                    snapshot.get(n).ok_or_else(|| {
                        SchedulerError::Status(Status::error(format!(
                            "nodeinfo not found for node name {n:?}"
                        )))
                    })
                })
                .collect::<SchedulerResult<_>>()?,
            None => snapshot.list().collect(),
        };
        let feasible = self.find_nodes_that_pass_filters(
            fw,
            state,
            workload,
            &nodes,
            &mut diagnosis,
            next_start_node_index,
        )?;
        Ok((feasible, diagnosis))
    }

    /// Filter hosts in parallel, starting at the rotating start index and
    /// stopping once enough feasible hosts were found.
    fn find_nodes_that_pass_filters<'a>(
        &self,
        fw: &Framework,
        state: &CycleState,
        workload: &Workload,
        nodes: &[&'a NodeInfo],
        diagnosis: &mut Diagnosis,
        next_start_node_index: &mut usize,
    ) -> SchedulerResult<Vec<&'a NodeInfo>> {
        let num_all = nodes.len();
        if num_all == 0 {
            return Ok(Vec::new());
        }
        let to_find = num_feasible_nodes_to_find(self.percentage_of_nodes_to_score, num_all);
        let start = *next_start_node_index % num_all;

        if !fw.has_filter_plugins() {
            let feasible: Vec<&NodeInfo> =
                (0..to_find).map(|i| nodes[(start + i) % num_all]).collect();
            *next_start_node_index = (start + feasible.len()) % num_all;
            return Ok(feasible);
        }

        let cancel = CancelToken::new();
        let errors: ErrorChannel<Status> = ErrorChannel::new();
        let found = AtomicUsize::new(0);
        let results = fw.parallelizer().map(&cancel, num_all, |i| {
            let node = nodes[(start + i) % num_all];
            match fw.run_filter_plugins(state, workload, node) {
                Ok(()) => {
                    let n = found.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= to_find {
                        cancel.cancel();
                    }
                    if n > to_find {
                        found.fetch_sub(1, Ordering::SeqCst);
                        return None;
                    }
                    Some(Ok(()))
                }
                Err(s) if s.code() == Code::Error => {
                    errors.send_with_cancel(s, &cancel);
                    None
                }
                Err(s) => Some(Err(s)),
            }
        });
        if let Some(s) = errors.receive() {
            return Err(SchedulerError::Status(s));
        }

        let mut feasible = Vec::with_capacity(found.load(Ordering::SeqCst));
        let mut processed = 0;
        for (i, result) in results.into_iter().enumerate() {
            let node = nodes[(start + i) % num_all];
            match result.flatten() {
                Some(Ok(())) => feasible.push(node),
                Some(Err(s)) => {
                    if !s.plugin().is_empty() {
                        diagnosis.unschedulable_plugins.insert(s.plugin().to_string());
                    }
                    diagnosis
                        .node_to_status
                        .insert(node.name().to_string(), s);
                }
                None => continue,
            }
            processed += 1;
        }
        *next_start_node_index = (start + processed) % num_all;
        debug!(
            workload = %workload.full_name(),
            feasible = feasible.len(),
            processed,
            next_start = *next_start_node_index,
            "filtered hosts"
        );
        Ok(feasible)
    }

    /// Run PostFilter, if any, and wrap the outcome into a [`FitError`]. A
    /// failing PostFilter is logged; the workload is still reported as
    /// unschedulable.
    fn fit_error(
        &self,
        fw: &Framework,
        state: &CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        mut diagnosis: Diagnosis,
    ) -> SchedulerError {
        if fw.has_post_filter_plugins() {
            match fw.run_post_filter_plugins(state, workload, snapshot, &diagnosis.node_to_status) {
                Ok(result) => {
                    info!(
                        workload = %workload.full_name(),
                        host = %result.nominated_node_name,
                        victims = result.victims.len(),
                        "nominated host"
                    );
                    diagnosis.nominated_node = Some(result.nominated_node_name);
                }
                Err(s) if s.code() == Code::Error => {
                    error!(
                        workload = %workload.full_name(),
                        plugin = s.plugin(),
                        error = %s,
                        "PostFilter failed"
                    );
                }
                Err(s) => diagnosis.post_filter_msg = Some(s.message()),
            }
        }
        SchedulerError::Fit(FitError {
            workload: workload.full_name(),
            num_all_nodes: snapshot.num_nodes(),
            diagnosis,
        })
    }

    /// Total weighted score per feasible host. Every host scores 1 when the
    /// profile has no Score plugins.
    fn prioritize_nodes(
        &self,
        fw: &Framework,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        nodes: &[&NodeInfo],
    ) -> SchedulerResult<Vec<NodeScore>> {
        if !fw.has_score_plugins() {
            return Ok(nodes
                .iter()
                .map(|n| NodeScore {
                    name: n.name().to_string(),
                    score: 1,
                })
                .collect());
        }

        fw.run_pre_score_plugins(state, workload, snapshot, nodes)
            .map_err(SchedulerError::Status)?;
        let per_plugin = fw
            .run_score_plugins(state, workload, nodes)
            .map_err(SchedulerError::Status)?;

        let mut totals: Vec<NodeScore> = nodes
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: 0,
            })
            .collect();
        for (plugin, scores) in &per_plugin {
            for (total, s) in totals.iter_mut().zip(scores) {
                debug!(
                    workload = %workload.full_name(),
                    plugin = %plugin,
                    node = %s.name,
                    score = s.score,
                    "plugin scored host"
                );
                total.score += s.score;
            }
        }
        Ok(totals)
    }

    fn assume_and_reserve(
        &self,
        fw: &Framework,
        state: &mut CycleState,
        workload: &Workload,
        host: &str,
    ) -> SchedulerResult<()> {
        let mut assumed = workload.clone();
        assumed.node_name = host.to_string();
        self.cache.assume_pod(&assumed)?;

        if let Err(s) = fw.run_reserve_plugins_reserve(state, &assumed, host) {
            fw.run_reserve_plugins_unreserve(state, &assumed, host);
            if let Err(e) = self.cache.forget_pod(&assumed) {
                error!(workload = %assumed.full_name(), error = %e, "forgetting workload after failed reserve");
            }
            return Err(SchedulerError::Status(s));
        }

        self.cache.finish_binding(&assumed)?;
        Ok(())
    }

    /// Schedule `workloads` in order. If any fails, every workload placed
    /// by this call is forgotten again. A dry run forgets them on success
    /// too, leaving the cache as it was.
    pub fn schedule(
        &self,
        workloads: &[Workload],
        dry_run: bool,
    ) -> SchedulerResult<Vec<ScheduleResult>> {
        let total = workloads.len();
        let mut placed: Vec<Workload> = Vec::with_capacity(total);
        let mut results = Vec::with_capacity(total);

        for (i, workload) in workloads.iter().enumerate() {
            match self.schedule_one(workload) {
                Ok(result) => {
                    let mut bound = workload.clone();
                    bound.node_name = result.suggested_host.clone();
                    placed.push(bound);
                    results.push(result);
                }
                Err(e) => {
                    self.forget_all(&placed);
                    if total > 1 {
                        return Err(SchedulerError::Batch {
                            index: i + 1,
                            total,
                            source: Box::new(e),
                        });
                    }
                    return Err(e);
                }
            }
        }

        if dry_run {
            self.forget_all(&placed);
        }
        Ok(results)
    }

    fn forget_all(&self, placed: &[Workload]) {
        for workload in placed.iter().rev() {
            if let Err(e) = self.cache.forget_pod(workload) {
                warn!(workload = %workload.full_name(), error = %e, "forgetting placed workload");
            }
        }
    }

    // ── Event handlers ─────────────────────────────────────────────

    /// Add or replace a host.
    pub fn add_host(&self, host: Host) {
        self.cache.add_node(host);
    }

    /// Replace a host's description.
    pub fn update_host(&self, old: &Host, new: Host) {
        self.cache.update_node(old, new);
    }

    /// Remove a host. Its workloads keep it as a ghost until they are removed.
    pub fn remove_host(&self, host: &Host) -> SchedulerResult<()> {
        self.cache
            .remove_node(host)
            .map_err(|e| log_cache_error("removing host", &host.name, e))
    }

    /// Record a workload reported as running. Workloads without a host have
    /// nothing to reconcile yet.
    pub fn add_workload(&self, workload: Workload) -> SchedulerResult<()> {
        if workload.node_name.is_empty() {
            debug!(workload = %workload.full_name(), "ignoring unbound workload");
            return Ok(());
        }
        let name = workload.full_name();
        self.cache
            .add_pod(workload)
            .map_err(|e| log_cache_error("adding workload", &name, e))
    }

    /// Apply a workload change. Workloads without a host on either side are
    /// ignored.
    pub fn update_workload(&self, old: &Workload, new: Workload) -> SchedulerResult<()> {
        if old.node_name.is_empty() && new.node_name.is_empty() {
            return Ok(());
        }
        if old.node_name.is_empty() {
            return self.add_workload(new);
        }
        self.cache
            .update_pod(old, new)
            .map_err(|e| log_cache_error("updating workload", &old.full_name(), e))
    }

    /// Remove a workload. An unbound workload the cache does not know is
    /// ignored.
    pub fn remove_workload(&self, workload: &Workload) -> SchedulerResult<()> {
        if workload.node_name.is_empty() && !self.is_known(workload) {
            return Ok(());
        }
        self.cache
            .remove_pod(workload)
            .map_err(|e| log_cache_error("removing workload", &workload.full_name(), e))
    }

    fn is_known(&self, workload: &Workload) -> bool {
        self.cache.get_pod(workload).is_ok()
    }

    /// The external binder confirmed the placement; start the expiry clock.
    pub fn confirm_binding(&self, workload: &Workload) -> SchedulerResult<()> {
        Ok(self.cache.finish_binding(workload)?)
    }

    /// Drop a placement that will not be bound after all.
    pub fn forget(&self, workload: &Workload) -> SchedulerResult<()> {
        self.cache
            .forget_pod(workload)
            .map_err(|e| log_cache_error("forgetting workload", &workload.full_name(), e))
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Usage of every live host, sorted by name. With `request`, also how
    /// many more copies of that workload each host could take.
    pub fn statistics(&self, request: Option<&Workload>) -> Vec<HostStatistics> {
        let request = request.map(workload_request);
        let dump = self.cache.dump();
        let mut stats: Vec<HostStatistics> = dump
            .nodes
            .values()
            .filter_map(|info| host_statistics(info, request.as_ref()))
            .collect();
        stats.sort_by(|a, b| a.host.cmp(&b.host));
        stats
    }
}

fn log_cache_error(action: &str, subject: &str, e: CacheError) -> SchedulerError {
    if e.is_corruption() {
        error!(subject, error = %e, "{action}: cache invariants violated");
    } else {
        warn!(subject, error = %e, "{action}");
    }
    e.into()
}

/// How many feasible hosts to look for before Filter stops. Small fleets
/// are searched fully; larger ones use `percentage`, or an adaptive share
/// shrinking with fleet size when it is 0.
pub fn num_feasible_nodes_to_find(percentage: u32, num_all_nodes: usize) -> usize {
    if num_all_nodes < MIN_FEASIBLE_NODES_TO_FIND || percentage >= 100 {
        return num_all_nodes;
    }
    let mut adaptive = i64::from(percentage);
    if adaptive <= 0 {
        adaptive = (50 - num_all_nodes as i64 / 125).max(MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND);
    }
    let num = num_all_nodes * adaptive as usize / 100;
    num.max(MIN_FEASIBLE_NODES_TO_FIND)
}

/// Host with the highest total. Ties are broken uniformly at random by
/// reservoir sampling.
pub fn select_host<'a, R: Rng + ?Sized>(scores: &'a [NodeScore], rng: &mut R) -> Option<&'a str> {
    let (first, rest) = scores.split_first()?;
    let mut selected = first;
    let mut max = first.score;
    let mut ties = 1u32;
    for s in rest {
        if s.score > max {
            max = s.score;
            selected = s;
            ties = 1;
        } else if s.score == max {
            ties += 1;
            if rng.gen_range(0..ties) == 0 {
                selected = s;
            }
        }
    }
    Some(selected.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use fleetgrid_framework::{
        Handle, InMemoryMetrics, NodeToStatusMap, Plugin, PluginInstance, PluginSet, Plugins,
        PostFilterPlugin, PostFilterResult, Profile,
    };
    use fleetgrid_placement::names::NODE_RESOURCES_FIT;
    use fleetgrid_placement::{default_config, in_tree_registry};
    use fleetgrid_state::{Container, ResourceList};

    const GI: i64 = 1 << 30;

    fn list(pairs: &[(&str, i64)]) -> ResourceList {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn make_host(name: &str, cpu: i64, memory: i64) -> Host {
        let allocatable = list(&[("cpu", cpu), ("memory", memory), ("pods", 110)]);
        Host {
            name: name.to_string(),
            capacity: allocatable.clone(),
            allocatable,
            ..Default::default()
        }
    }

    fn make_workload(uid: &str, node: &str, cpu: i64, memory: i64) -> Workload {
        Workload {
            uid: uid.to_string(),
            name: uid.to_string(),
            namespace: "default".to_string(),
            node_name: node.to_string(),
            containers: vec![Container {
                requests: list(&[("cpu", cpu), ("memory", memory)]),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn make_scheduler() -> Scheduler {
        Scheduler::new(&default_config(), &in_tree_registry().unwrap()).unwrap()
    }

    struct BrokenPostFilter;

    impl Plugin for BrokenPostFilter {
        fn name(&self) -> &str {
            "BrokenPostFilter"
        }
    }

    impl PostFilterPlugin for BrokenPostFilter {
        fn post_filter(
            &self,
            _handle: &dyn Handle,
            _state: &CycleState,
            _workload: &Workload,
            _snapshot: &Snapshot,
            _statuses: &NodeToStatusMap,
        ) -> Result<PostFilterResult, Status> {
            Err(Status::error("victim lister unavailable"))
        }
    }

    /// Resource fit plus a PostFilter that always fails.
    fn make_scheduler_with_broken_post_filter(metrics: Arc<InMemoryMetrics>) -> Scheduler {
        let mut registry = in_tree_registry().unwrap();
        registry
            .register("BrokenPostFilter", |_| {
                Ok(PluginInstance::new("BrokenPostFilter")
                    .with_post_filter(Arc::new(BrokenPostFilter)))
            })
            .unwrap();
        let plugins = Plugins {
            pre_filter: PluginSet::enabled(&[NODE_RESOURCES_FIT]),
            filter: PluginSet::enabled(&[NODE_RESOURCES_FIT]),
            post_filter: PluginSet::enabled(&["BrokenPostFilter"]),
            ..Default::default()
        };
        let config = SchedulerConfig {
            profiles: vec![Profile::new(DEFAULT_SCHEDULER_NAME, plugins)],
            ..Default::default()
        };
        Scheduler::with_metrics(&config, &registry, metrics).unwrap()
    }

    fn scores(pairs: &[(&str, i64)]) -> Vec<NodeScore> {
        pairs
            .iter()
            .map(|(n, s)| NodeScore {
                name: n.to_string(),
                score: *s,
            })
            .collect()
    }

    #[test]
    fn feasible_nodes_to_find_scales_with_fleet_size() {
        assert_eq!(num_feasible_nodes_to_find(0, 50), 50);
        assert_eq!(num_feasible_nodes_to_find(0, 1000), 420);
        assert_eq!(num_feasible_nodes_to_find(0, 5000), 500);
        assert_eq!(num_feasible_nodes_to_find(0, 10_000), 500);
        assert_eq!(num_feasible_nodes_to_find(5, 1000), 100);
        assert_eq!(num_feasible_nodes_to_find(30, 1000), 300);
        assert_eq!(num_feasible_nodes_to_find(100, 1000), 1000);
    }

    #[test]
    fn select_host_picks_highest_score() {
        let mut rng = StdRng::seed_from_u64(7);
        let s = scores(&[("h1", 10), ("h2", 30), ("h3", 20)]);
        assert_eq!(select_host(&s, &mut rng), Some("h2"));
        assert_eq!(select_host(&[], &mut rng), None);
    }

    #[test]
    fn select_host_spreads_ties() {
        let mut rng = StdRng::seed_from_u64(42);
        let s = scores(&[("h1", 50), ("h2", 10), ("h3", 50), ("h4", 50)]);
        let picked: HashSet<&str> = (0..200)
            .filter_map(|_| select_host(&s, &mut rng))
            .collect();
        assert_eq!(picked, HashSet::from(["h1", "h3", "h4"]));
    }

    #[test]
    fn empty_cache_has_no_nodes() {
        let scheduler = make_scheduler();
        let err = scheduler
            .schedule_one(&make_workload("w1", "", 100, GI))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoNodesAvailable));
        assert!(err.is_unschedulable());
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let scheduler = make_scheduler();
        let mut w = make_workload("w1", "", 100, GI);
        w.scheduler_name = "gpu-scheduler".to_string();
        assert!(matches!(
            scheduler.schedule_one(&w),
            Err(SchedulerError::ProfileNotFound(name)) if name == "gpu-scheduler"
        ));
    }

    #[test]
    fn config_without_profiles_is_rejected() {
        let config = SchedulerConfig::default();
        assert!(matches!(
            Scheduler::new(&config, &in_tree_registry().unwrap()),
            Err(SchedulerError::NoProfiles)
        ));
    }

    #[test]
    fn duplicate_profiles_are_rejected() {
        let mut config = default_config();
        config.profiles.push(config.profiles[0].clone());
        assert!(matches!(
            Scheduler::new(&config, &in_tree_registry().unwrap()),
            Err(SchedulerError::DuplicateProfile(_))
        ));
    }

    #[test]
    fn places_workload_on_least_loaded_host() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler.add_host(make_host("h2", 4000, 4 * GI));
        scheduler
            .add_workload(make_workload("busy", "h1", 2000, 2 * GI))
            .unwrap();

        let incoming = make_workload("w1", "", 1000, GI);
        let result = scheduler.schedule_one(&incoming).unwrap();
        assert_eq!(result.suggested_host, "h2");
        assert_eq!(result.evaluated_nodes, 2);
        assert_eq!(result.feasible_nodes, 2);

        let mut bound = incoming.clone();
        bound.node_name = "h2".to_string();
        assert!(scheduler.cache().is_assumed_pod(&bound).unwrap());
        assert_eq!(scheduler.cache().pod_count(), 2);
    }

    #[test]
    fn single_feasible_host_is_chosen_without_scoring() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler.add_host(make_host("h2", 1000, 4 * GI));
        let result = scheduler
            .schedule_one(&make_workload("w1", "", 2000, GI))
            .unwrap();
        assert_eq!(result.suggested_host, "h1");
        assert_eq!(result.evaluated_nodes, 2);
        assert_eq!(result.feasible_nodes, 1);
    }

    #[test]
    fn nothing_fits_reports_every_host() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler.add_host(make_host("h2", 4000, 4 * GI));
        let err = scheduler
            .schedule_one(&make_workload("w1", "", 8000, GI))
            .unwrap_err();

        let SchedulerError::Fit(fit) = &err else {
            panic!("expected fit error, got {err}");
        };
        assert_eq!(fit.num_all_nodes, 2);
        assert_eq!(fit.diagnosis.node_to_status.len(), 2);
        assert!(fit.diagnosis.unschedulable_plugins.contains("NodeResourcesFit"));
        assert!(fit.diagnosis.nominated_node.is_none());
        let msg = err.to_string();
        assert!(msg.starts_with("0/2 nodes are available: 2 Insufficient cpu."), "{msg}");
        assert!(msg.contains("preemption: 0/2 nodes are available"), "{msg}");
    }

    #[test]
    fn preemption_nominates_a_host() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler
            .add_workload(make_workload("low", "h1", 3000, GI))
            .unwrap();

        let mut incoming = make_workload("high", "", 2000, GI);
        incoming.priority = 100;
        let err = scheduler.schedule_one(&incoming).unwrap_err();
        let SchedulerError::Fit(fit) = err else {
            panic!("expected fit error");
        };
        assert_eq!(fit.diagnosis.nominated_node.as_deref(), Some("h1"));
    }

    #[test]
    fn failing_post_filter_still_reports_fit_error() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let scheduler = make_scheduler_with_broken_post_filter(metrics.clone());
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler.add_host(make_host("h2", 4000, 4 * GI));

        let err = scheduler
            .schedule_one(&make_workload("w1", "", 8000, GI))
            .unwrap_err();
        assert!(err.is_unschedulable());
        let SchedulerError::Fit(fit) = &err else {
            panic!("expected fit error, got {err}");
        };
        assert_eq!(fit.diagnosis.node_to_status.len(), 2);
        assert!(fit.diagnosis.unschedulable_plugins.contains(NODE_RESOURCES_FIT));
        assert!(fit.diagnosis.nominated_node.is_none());
        assert!(fit.diagnosis.post_filter_msg.is_none());
        assert_eq!(err.to_string(), "0/2 nodes are available: 2 Insufficient cpu.");

        assert_eq!(metrics.attempts(AttemptResult::Unschedulable).count, 1);
        assert_eq!(metrics.attempts(AttemptResult::Error).count, 0);
    }

    #[test]
    fn dry_run_leaves_cache_untouched() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        let batch = vec![
            make_workload("w1", "", 1000, GI),
            make_workload("w2", "", 1000, GI),
        ];
        let results = scheduler.schedule(&batch, true).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(scheduler.cache().pod_count(), 0);
    }

    #[test]
    fn failed_batch_forgets_earlier_placements() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        let batch = vec![
            make_workload("w1", "", 3000, GI),
            make_workload("w2", "", 3000, GI),
        ];
        let err = scheduler.schedule(&batch, false).unwrap_err();
        assert!(err.to_string().starts_with("scheduling workload 2 of 2: 0/1 nodes are available"));
        assert_eq!(scheduler.cache().pod_count(), 0);
    }

    #[test]
    fn batch_places_every_workload() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler.add_host(make_host("h2", 4000, 4 * GI));
        let batch: Vec<Workload> = (0..4)
            .map(|i| make_workload(&format!("w{i}"), "", 2000, GI))
            .collect();
        let results = scheduler.schedule(&batch, false).unwrap();
        let per_host = |h: &str| results.iter().filter(|r| r.suggested_host == h).count();
        assert_eq!(per_host("h1"), 2);
        assert_eq!(per_host("h2"), 2);
        assert_eq!(scheduler.cache().pod_count(), 4);
    }

    #[test]
    fn forget_releases_capacity() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        let w = make_workload("w1", "", 4000, GI);
        let result = scheduler.schedule_one(&w).unwrap();
        assert!(scheduler.schedule_one(&make_workload("w2", "", 1000, GI)).is_err());

        let mut bound = w.clone();
        bound.node_name = result.suggested_host;
        scheduler.forget(&bound).unwrap();
        assert!(scheduler.schedule_one(&make_workload("w2", "", 1000, GI)).is_ok());
    }

    #[test]
    fn unbound_workload_events_are_ignored() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        let w = make_workload("w1", "", 1000, GI);
        scheduler.add_workload(w.clone()).unwrap();
        scheduler.remove_workload(&w).unwrap();
        assert_eq!(scheduler.cache().pod_count(), 0);
    }

    #[test]
    fn removing_unknown_workload_is_an_error() {
        let scheduler = make_scheduler();
        let err = scheduler
            .remove_workload(&make_workload("w1", "h1", 1000, GI))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Cache(CacheError::NotFound(_))));
    }

    #[test]
    fn statistics_report_free_capacity() {
        let scheduler = make_scheduler();
        scheduler.add_host(make_host("h2", 4000, 4 * GI));
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler
            .add_workload(make_workload("busy", "h1", 3000, GI))
            .unwrap();

        let request = make_workload("probe", "", 500, GI);
        let stats = scheduler.statistics(Some(&request));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].host, "h1");
        assert_eq!(stats[0].free_milli_cpu, 1000);
        assert_eq!(stats[0].max_new_workloads, Some(2));
        assert_eq!(stats[1].max_new_workloads, Some(4));
    }

    #[test]
    fn attempts_are_reported_to_metrics() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let scheduler = Scheduler::with_metrics(
            &default_config(),
            &in_tree_registry().unwrap(),
            metrics.clone(),
        )
        .unwrap();
        scheduler.add_host(make_host("h1", 4000, 4 * GI));
        scheduler
            .schedule_one(&make_workload("w1", "", 1000, GI))
            .unwrap();
        assert!(scheduler
            .schedule_one(&make_workload("w2", "", 8000, GI))
            .is_err());

        assert_eq!(metrics.attempts(AttemptResult::Scheduled).count, 1);
        assert_eq!(metrics.attempts(AttemptResult::Unschedulable).count, 1);
    }
}
