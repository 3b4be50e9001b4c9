//! Framework runtime: builds a profile's plugin pipelines and runs them.
//!
//! Each extension point owns a typed list of plugins. Lists are filled
//! from the profile's explicit plugin sets and its multi-point set:
//! plugins re-configured at a specific point keep their explicit position
//! ahead of the remaining multi-point plugins, and any other explicitly
//! enabled plugins follow.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use fleetgrid_state::{NodeInfo, PodInfo, Workload};

use crate::config::{PluginRef, PluginSet, Plugins, Profile};
use crate::cycle_state::CycleState;
use crate::error::{FrameworkError, FrameworkResult};
use crate::interface::{
    ExtensionPoint, FilterPlugin, Handle, MAX_NODE_SCORE, MAX_TOTAL_SCORE, MIN_NODE_SCORE,
    PluginInstance, PostFilterPlugin, PreFilterPlugin, PreScorePlugin, ReservePlugin, ScorePlugin,
};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::parallelize::{CancelToken, DEFAULT_PARALLELISM, ErrorChannel, Parallelizer};
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use crate::status::{
    NodeScore, NodeToStatusMap, PluginToNodeScores, PluginToStatus, PostFilterResult,
    PreFilterResult, Status, merge_pre_filter_results, merge_statuses,
};

/// Collaborators injected into a [`Framework`].
#[derive(Clone)]
pub struct FrameworkOptions {
    parallelizer: Option<Parallelizer>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for FrameworkOptions {
    fn default() -> Self {
        Self {
            parallelizer: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl FrameworkOptions {
    /// Share an existing worker pool instead of building one per framework.
    pub fn with_parallelizer(mut self, parallelizer: Parallelizer) -> Self {
        self.parallelizer = Some(parallelizer);
        self
    }

    /// Sink for extension point and plugin timings.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// A built profile: ordered plugin lists per extension point.
pub struct Framework {
    profile_name: String,
    pre_filter_plugins: Vec<Arc<dyn PreFilterPlugin>>,
    filter_plugins: Vec<Arc<dyn FilterPlugin>>,
    post_filter_plugins: Vec<Arc<dyn PostFilterPlugin>>,
    pre_score_plugins: Vec<Arc<dyn PreScorePlugin>>,
    score_plugins: Vec<Arc<dyn ScorePlugin>>,
    reserve_plugins: Vec<Arc<dyn ReservePlugin>>,
    score_plugin_weight: HashMap<String, i64>,
    parallelizer: Parallelizer,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("profile_name", &self.profile_name)
            .field("plugins", &self.list_plugins())
            .finish()
    }
}

impl Framework {
    /// Instantiate the plugins `profile` needs from `registry` and attach
    /// them to their extension points.
    pub fn new(
        registry: &Registry,
        profile: &Profile,
        options: FrameworkOptions,
    ) -> FrameworkResult<Self> {
        let plugins = profile
            .plugins
            .as_ref()
            .ok_or_else(|| FrameworkError::MissingPlugins(profile.scheduler_name.clone()))?;

        let mut args: HashMap<&str, &toml::Value> = HashMap::new();
        for pc in &profile.plugin_config {
            if args.insert(pc.name.as_str(), &pc.args).is_some() {
                return Err(FrameworkError::RepeatedConfig(pc.name.clone()));
            }
        }

        let needed = plugins_needed(plugins);
        let mut instances: BTreeMap<String, PluginInstance> = BTreeMap::new();
        for name in &needed {
            let Some(factory) = registry.get(name) else {
                // Reported with the extension point while attaching.
                continue;
            };
            let instance = factory(args.get(name.as_str()).copied()).map_err(|e| {
                FrameworkError::PluginInit {
                    plugin: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            instances.insert(name.clone(), instance);
        }

        let multi = &plugins.multi_point;
        let pre_filter_plugins = attach(
            ExtensionPoint::PreFilter,
            &plugins.pre_filter,
            multi,
            &instances,
            |i| i.pre_filter.clone(),
        )?;
        let filter_plugins = attach(
            ExtensionPoint::Filter,
            &plugins.filter,
            multi,
            &instances,
            |i| i.filter.clone(),
        )?;
        let post_filter_plugins = attach(
            ExtensionPoint::PostFilter,
            &plugins.post_filter,
            multi,
            &instances,
            |i| i.post_filter.clone(),
        )?;
        let pre_score_plugins = attach(
            ExtensionPoint::PreScore,
            &plugins.pre_score,
            multi,
            &instances,
            |i| i.pre_score.clone(),
        )?;
        let score_plugins = attach(
            ExtensionPoint::Score,
            &plugins.score,
            multi,
            &instances,
            |i| i.score.clone(),
        )?;
        let reserve_plugins = attach(
            ExtensionPoint::Reserve,
            &plugins.reserve,
            multi,
            &instances,
            |i| i.reserve.clone(),
        )?;

        let score_plugin_weight = score_weights(
            &score_plugins,
            plugins.score.enabled.iter().chain(multi.enabled.iter()),
        )?;

        let parallelizer = match options.parallelizer {
            Some(p) => p,
            None => Parallelizer::new(DEFAULT_PARALLELISM)?,
        };

        let framework = Self {
            profile_name: profile.scheduler_name.clone(),
            pre_filter_plugins,
            filter_plugins,
            post_filter_plugins,
            pre_score_plugins,
            score_plugins,
            reserve_plugins,
            score_plugin_weight,
            parallelizer,
            metrics: options.metrics,
        };
        debug!(profile = %framework.profile_name, plugins = instances.len(), "framework built");
        Ok(framework)
    }

    /// Scheduler name of the profile this framework was built from.
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Whether any Filter plugin is configured.
    pub fn has_filter_plugins(&self) -> bool {
        !self.filter_plugins.is_empty()
    }

    /// Whether any PostFilter plugin is configured.
    pub fn has_post_filter_plugins(&self) -> bool {
        !self.post_filter_plugins.is_empty()
    }

    /// Whether any Score plugin is configured.
    pub fn has_score_plugins(&self) -> bool {
        !self.score_plugins.is_empty()
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn parallelizer(&self) -> &Parallelizer {
        &self.parallelizer
    }

    /// Configured plugins per extension point, in execution order. Score
    /// entries carry their effective weight.
    pub fn list_plugins(&self) -> Plugins {
        fn set<T: ?Sized + crate::interface::Plugin>(list: &[Arc<T>]) -> PluginSet {
            PluginSet {
                enabled: list.iter().map(|p| PluginRef::new(p.name())).collect(),
                disabled: Vec::new(),
            }
        }
        let mut score = set(&self.score_plugins);
        for r in &mut score.enabled {
            r.weight = self.score_plugin_weight.get(&r.name).copied().unwrap_or(1);
        }
        Plugins {
            pre_filter: set(&self.pre_filter_plugins),
            filter: set(&self.filter_plugins),
            post_filter: set(&self.post_filter_plugins),
            pre_score: set(&self.pre_score_plugins),
            score,
            reserve: set(&self.reserve_plugins),
            multi_point: PluginSet::default(),
        }
    }

    fn observe(&self, point: ExtensionPoint, status: Option<&Status>, start: Instant) {
        let code = status.map_or(crate::status::Code::Success, Status::code);
        self.metrics
            .observe_extension_point(point, code, &self.profile_name, start.elapsed());
    }

    fn timed<T>(
        &self,
        record: bool,
        point: ExtensionPoint,
        plugin: &str,
        call: impl FnOnce() -> Result<T, Status>,
    ) -> Result<T, Status> {
        if !record {
            return call();
        }
        let start = Instant::now();
        let result = call();
        let code = match &result {
            Ok(_) => crate::status::Code::Success,
            Err(s) => s.code(),
        };
        self.metrics
            .observe_plugin(point, plugin, code, start.elapsed());
        result
    }

    // ── PreFilter ──────────────────────────────────────────────────

    /// Run every PreFilter plugin in order. Returns the intersection of
    /// the host restrictions they produced (`None` for all hosts).
    pub fn run_pre_filter_plugins(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
    ) -> Result<PreFilterResult, Status> {
        let start = Instant::now();
        let record = state.record_plugin_metrics();
        let mut result: PreFilterResult = None;
        let mut restricting: Vec<&str> = Vec::new();
        let mut outcome = Ok(());

        for pl in &self.pre_filter_plugins {
            let name = pl.name();
            match self.timed(record, ExtensionPoint::PreFilter, name, || {
                pl.pre_filter(state, workload, snapshot)
            }) {
                Err(s) => {
                    let s = s.with_plugin(name);
                    outcome = Err(if s.is_unschedulable() {
                        s
                    } else {
                        Status::error(format!(
                            "running PreFilter plugin {name:?}: {}",
                            s.message()
                        ))
                        .with_plugin(name)
                    });
                    break;
                }
                Ok(None) => {}
                Ok(restriction) => {
                    restricting.push(name);
                    result = merge_pre_filter_results(result, restriction);
                    if result.as_ref().is_some_and(BTreeSet::is_empty) {
                        let msg = if restricting.len() > 1 {
                            format!(
                                "node(s) didn't satisfy plugin(s) [{}] simultaneously",
                                restricting.join(" ")
                            )
                        } else {
                            format!("node(s) didn't satisfy plugin {name}")
                        };
                        outcome = Err(Status::unschedulable(msg).with_plugin(name));
                        break;
                    }
                }
            }
        }

        self.observe(ExtensionPoint::PreFilter, outcome.as_ref().err(), start);
        outcome.map(|_| result)
    }

    // ── Filter ─────────────────────────────────────────────────────

    /// Run every Filter plugin against one host, stopping at the first
    /// rejection.
    pub fn run_filter_plugins(
        &self,
        state: &CycleState,
        workload: &Workload,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        let record = state.record_plugin_metrics();
        for pl in &self.filter_plugins {
            let name = pl.name();
            if let Err(s) = self.timed(record, ExtensionPoint::Filter, name, || {
                pl.filter(state, workload, node)
            }) {
                return Err(s
                    .or_error(format!("running {name:?} filter plugin"))
                    .with_plugin(name));
            }
        }
        Ok(())
    }

    // ── PostFilter ─────────────────────────────────────────────────

    /// Run PostFilter plugins until one succeeds or errors. Unschedulable
    /// outcomes are merged into the returned status.
    pub fn run_post_filter_plugins(
        &self,
        state: &CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        filtered: &NodeToStatusMap,
    ) -> Result<PostFilterResult, Status> {
        let start = Instant::now();
        let record = state.record_plugin_metrics();
        let mut statuses = PluginToStatus::new();
        let mut outcome = None;

        for pl in &self.post_filter_plugins {
            let name = pl.name();
            match self.timed(record, ExtensionPoint::PostFilter, name, || {
                pl.post_filter(self, state, workload, snapshot, filtered)
            }) {
                Ok(result) => {
                    outcome = Some(Ok(result));
                    break;
                }
                Err(s) if !s.is_unschedulable() => {
                    outcome = Some(Err(s
                        .or_error(format!("running PostFilter plugin {name:?}"))
                        .with_plugin(name)));
                    break;
                }
                Err(s) => {
                    statuses.insert(name.to_string(), s.with_plugin(name));
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            Err(merge_statuses(&statuses).unwrap_or_else(|| {
                Status::unschedulable("no PostFilter plugin made the workload schedulable")
            }))
        });
        self.observe(ExtensionPoint::PostFilter, outcome.as_ref().err(), start);
        outcome
    }

    // ── PreScore / Score ───────────────────────────────────────────

    /// Run every PreScore plugin in order. The first failure aborts scoring
    /// and is returned as an Error status.
    pub fn run_pre_score_plugins(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        snapshot: &Snapshot,
        nodes: &[&NodeInfo],
    ) -> Result<(), Status> {
        let start = Instant::now();
        let record = state.record_plugin_metrics();
        let mut outcome = Ok(());
        for pl in &self.pre_score_plugins {
            let name = pl.name();
            if let Err(s) = self.timed(record, ExtensionPoint::PreScore, name, || {
                pl.pre_score(state, workload, snapshot, nodes)
            }) {
                outcome = Err(Status::error(format!(
                    "running PreScore plugin {name:?}: {}",
                    s.message()
                ))
                .with_plugin(name));
                break;
            }
        }
        self.observe(ExtensionPoint::PreScore, outcome.as_ref().err(), start);
        outcome
    }

    /// Score every host with every Score plugin, normalize, then apply
    /// weights. Returns weighted per-plugin scores in host order.
    pub fn run_score_plugins(
        &self,
        state: &CycleState,
        workload: &Workload,
        nodes: &[&NodeInfo],
    ) -> Result<PluginToNodeScores, Status> {
        let start = Instant::now();
        let outcome = self.score(state, workload, nodes);
        self.observe(ExtensionPoint::Score, outcome.as_ref().err(), start);
        outcome
    }

    fn score(
        &self,
        state: &CycleState,
        workload: &Workload,
        nodes: &[&NodeInfo],
    ) -> Result<PluginToNodeScores, Status> {
        let record = state.record_plugin_metrics();
        let cancel = CancelToken::new();
        let errors: ErrorChannel<String> = ErrorChannel::new();

        let per_node = self.parallelizer.map(&cancel, nodes.len(), |i| {
            let mut scores = Vec::with_capacity(self.score_plugins.len());
            for pl in &self.score_plugins {
                let name = pl.name();
                match self.timed(record, ExtensionPoint::Score, name, || {
                    pl.score(state, workload, nodes[i])
                }) {
                    Ok(score) => scores.push(score),
                    Err(s) => {
                        errors.send_with_cancel(
                            format!("plugin {name:?} failed with: {}", s.message()),
                            &cancel,
                        );
                        return None;
                    }
                }
            }
            Some(scores)
        });
        if let Some(err) = errors.receive() {
            return Err(Status::error(format!("running Score plugins: {err}")));
        }

        let mut lists: Vec<Mutex<Vec<NodeScore>>> = self
            .score_plugins
            .iter()
            .map(|_| Mutex::new(Vec::with_capacity(nodes.len())))
            .collect();
        for (i, scores) in per_node.into_iter().enumerate() {
            let Some(Some(scores)) = scores else {
                return Err(Status::error(format!(
                    "running Score plugins: no score for host {:?}",
                    nodes[i].name()
                )));
            };
            for (j, score) in scores.into_iter().enumerate() {
                lists[j].get_mut().push(NodeScore {
                    name: nodes[i].name().to_string(),
                    score,
                });
            }
        }

        let cancel = CancelToken::new();
        self.parallelizer
            .until(&cancel, self.score_plugins.len(), |j| {
                let pl = &self.score_plugins[j];
                let Some(ext) = pl.score_extensions() else {
                    return;
                };
                let mut scores = lists[j].lock();
                if let Err(s) = ext.normalize_score(state, workload, &mut scores) {
                    errors.send_with_cancel(
                        format!("plugin {:?} failed with: {}", pl.name(), s.message()),
                        &cancel,
                    );
                }
            });
        if let Some(err) = errors.receive() {
            return Err(Status::error(format!(
                "running Normalize on Score plugins: {err}"
            )));
        }

        let mut out = PluginToNodeScores::new();
        for (pl, list) in self.score_plugins.iter().zip(lists) {
            let weight = self.score_plugin_weight.get(pl.name()).copied().unwrap_or(1);
            let mut scores = list.into_inner();
            for s in &mut scores {
                if !(MIN_NODE_SCORE..=MAX_NODE_SCORE).contains(&s.score) {
                    error!(
                        plugin = pl.name(),
                        node = %s.name,
                        score = s.score,
                        "plugin returned an out-of-range score after normalizing, clamping"
                    );
                    s.score = s.score.clamp(MIN_NODE_SCORE, MAX_NODE_SCORE);
                }
                s.score *= weight;
            }
            out.insert(pl.name().to_string(), scores);
        }
        Ok(out)
    }

    // ── Reserve ────────────────────────────────────────────────────

    /// Run every Reserve plugin in order against `node_name`. The first
    /// failure stops the run; the caller undoes it with
    /// [`Framework::run_reserve_plugins_unreserve`].
    pub fn run_reserve_plugins_reserve(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        node_name: &str,
    ) -> Result<(), Status> {
        let start = Instant::now();
        let record = state.record_plugin_metrics();
        let mut outcome = Ok(());
        for pl in &self.reserve_plugins {
            let name = pl.name();
            if let Err(s) = self.timed(record, ExtensionPoint::Reserve, name, || {
                pl.reserve(state, workload, node_name)
            }) {
                outcome = Err(Status::error(format!(
                    "running Reserve plugin {name:?}: {}",
                    s.message()
                ))
                .with_plugin(name));
                break;
            }
        }
        self.observe(ExtensionPoint::Reserve, outcome.as_ref().err(), start);
        outcome
    }

    /// Undo reservations in reverse plugin order.
    pub fn run_reserve_plugins_unreserve(
        &self,
        state: &mut CycleState,
        workload: &Workload,
        node_name: &str,
    ) {
        let start = Instant::now();
        for pl in self.reserve_plugins.iter().rev() {
            pl.unreserve(state, workload, node_name);
        }
        self.observe(ExtensionPoint::Unreserve, None, start);
    }
}

impl Handle for Framework {
    fn run_filter_plugins(
        &self,
        state: &CycleState,
        workload: &Workload,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        Framework::run_filter_plugins(self, state, workload, node)
    }

    fn run_pre_filter_extension_add_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_add: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        for pl in &self.pre_filter_plugins {
            let Some(ext) = pl.extensions() else {
                continue;
            };
            ext.add_pod(state, to_schedule, to_add, node).map_err(|s| {
                Status::error(format!(
                    "running AddPod on PreFilter plugin {:?}: {}",
                    pl.name(),
                    s.message()
                ))
                .with_plugin(pl.name())
            })?;
        }
        Ok(())
    }

    fn run_pre_filter_extension_remove_pod(
        &self,
        state: &mut CycleState,
        to_schedule: &Workload,
        to_remove: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), Status> {
        for pl in &self.pre_filter_plugins {
            let Some(ext) = pl.extensions() else {
                continue;
            };
            ext.remove_pod(state, to_schedule, to_remove, node)
                .map_err(|s| {
                    Status::error(format!(
                        "running RemovePod on PreFilter plugin {:?}: {}",
                        pl.name(),
                        s.message()
                    ))
                    .with_plugin(pl.name())
                })?;
        }
        Ok(())
    }

    fn parallelizer(&self) -> &Parallelizer {
        &self.parallelizer
    }
}

// ── Build helpers ──────────────────────────────────────────────────

fn plugins_needed(plugins: &Plugins) -> BTreeSet<String> {
    [
        &plugins.pre_filter,
        &plugins.filter,
        &plugins.post_filter,
        &plugins.pre_score,
        &plugins.score,
        &plugins.reserve,
        &plugins.multi_point,
    ]
    .into_iter()
    .flat_map(|set| set.enabled.iter().map(|p| p.name.clone()))
    .collect()
}

/// Ordered plugin list for one extension point.
fn attach<T: ?Sized>(
    point: ExtensionPoint,
    explicit: &PluginSet,
    multi: &PluginSet,
    instances: &BTreeMap<String, PluginInstance>,
    pick: impl Fn(&PluginInstance) -> Option<Arc<T>>,
) -> FrameworkResult<Vec<Arc<T>>> {
    let names = ordered_names(point, explicit, multi, instances)?;
    Ok(names
        .iter()
        .filter_map(|n| instances.get(n).and_then(&pick))
        .collect())
}

fn ordered_names(
    point: ExtensionPoint,
    explicit: &PluginSet,
    multi: &PluginSet,
    instances: &BTreeMap<String, PluginInstance>,
) -> FrameworkResult<Vec<String>> {
    let mut enabled: Vec<String> = Vec::new();
    for p in &explicit.enabled {
        let instance = instances
            .get(&p.name)
            .ok_or_else(|| FrameworkError::PluginNotFound {
                point,
                plugin: p.name.clone(),
            })?;
        if !instance.implements(point) {
            return Err(FrameworkError::NotImplemented {
                point,
                plugin: p.name.clone(),
            });
        }
        if enabled.contains(&p.name) {
            return Err(FrameworkError::AlreadyRegistered {
                point,
                plugin: p.name.clone(),
            });
        }
        enabled.push(p.name.clone());
    }

    if multi.enabled.is_empty() {
        return Ok(enabled);
    }
    if explicit.disables_all() {
        debug!(extension = %point, "skipped multi-point expansion because all plugins are disabled");
        return Ok(enabled);
    }

    let mut multi_enabled: Vec<String> = Vec::new();
    let mut overrides: BTreeSet<&str> = BTreeSet::new();
    for p in &multi.enabled {
        let instance = instances
            .get(&p.name)
            .ok_or_else(|| FrameworkError::PluginNotFound {
                point,
                plugin: p.name.clone(),
            })?;
        if !instance.implements(point) {
            continue;
        }
        if explicit.is_disabled(&p.name) {
            debug!(plugin = %p.name, extension = %point, "skipped disabled plugin");
            continue;
        }
        if enabled.contains(&p.name) {
            info!(plugin = %p.name, extension = %point, "multi-point plugin is explicitly re-configured, overriding");
            overrides.insert(p.name.as_str());
            continue;
        }
        if multi_enabled.contains(&p.name) {
            return Err(FrameworkError::AlreadyRegistered {
                point,
                plugin: p.name.clone(),
            });
        }
        multi_enabled.push(p.name.clone());
    }

    let (overridden, rest): (Vec<String>, Vec<String>) = enabled
        .into_iter()
        .partition(|n| overrides.contains(n.as_str()));
    Ok(overridden
        .into_iter()
        .chain(multi_enabled)
        .chain(rest)
        .collect())
}

/// Weight of every attached Score plugin; the first reference wins.
fn score_weights<'a>(
    score_plugins: &[Arc<dyn ScorePlugin>],
    refs: impl Iterator<Item = &'a PluginRef>,
) -> FrameworkResult<HashMap<String, i64>> {
    let mut weights = HashMap::new();
    let attached: BTreeSet<&str> = score_plugins.iter().map(|p| p.name()).collect();

    let mut total: i64 = 0;
    for r in refs {
        if !attached.contains(r.name.as_str()) || weights.contains_key(&r.name) {
            continue;
        }
        if r.weight < 0 {
            return Err(FrameworkError::InvalidArgs {
                plugin: r.name.clone(),
                reason: format!("score weight must not be negative, got {}", r.weight),
            });
        }
        let weight = if r.weight == 0 { 1 } else { r.weight };
        let max = weight
            .checked_mul(MAX_NODE_SCORE)
            .ok_or(FrameworkError::ScoreOverflow)?;
        if max > MAX_TOTAL_SCORE - total {
            return Err(FrameworkError::ScoreOverflow);
        }
        total += max;
        weights.insert(r.name.clone(), weight);
    }

    for pl in score_plugins {
        if !weights.contains_key(pl.name()) {
            return Err(FrameworkError::MissingWeight(pl.name().to_string()));
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Plugin, PreFilterExtensions, ScoreExtensions};
    use crate::metrics::InMemoryMetrics;
    use crate::status::Code;
    use fleetgrid_state::Host;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Configurable plugin implementing every capability.
    #[derive(Clone, Default)]
    struct Fake {
        name: String,
        pre_filter: Option<Result<PreFilterResult, Status>>,
        filter: Option<Status>,
        post_filter: Option<Result<PostFilterResult, Status>>,
        pre_score: Option<Status>,
        score: i64,
        score_err_on: Option<String>,
        normalize_to: Option<i64>,
        reserve_err: bool,
        log: Log,
    }

    impl Fake {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }
    }

    impl Plugin for Fake {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl PreFilterPlugin for Fake {
        fn pre_filter(
            &self,
            _: &mut CycleState,
            _: &Workload,
            _: &Snapshot,
        ) -> Result<PreFilterResult, Status> {
            self.pre_filter.clone().unwrap_or(Ok(None))
        }

        fn extensions(&self) -> Option<&dyn PreFilterExtensions> {
            Some(self)
        }
    }

    impl PreFilterExtensions for Fake {
        fn add_pod(
            &self,
            _: &mut CycleState,
            _: &Workload,
            to_add: &PodInfo,
            _: &NodeInfo,
        ) -> Result<(), Status> {
            self.log.lock().push(format!("add:{}", to_add.workload.uid));
            Ok(())
        }

        fn remove_pod(
            &self,
            _: &mut CycleState,
            _: &Workload,
            _: &PodInfo,
            _: &NodeInfo,
        ) -> Result<(), Status> {
            Err(Status::unschedulable("cannot remove"))
        }
    }

    impl FilterPlugin for Fake {
        fn filter(&self, _: &CycleState, _: &Workload, _: &NodeInfo) -> Result<(), Status> {
            match &self.filter {
                Some(s) => Err(s.clone()),
                None => Ok(()),
            }
        }
    }

    impl PostFilterPlugin for Fake {
        fn post_filter(
            &self,
            _: &dyn Handle,
            _: &CycleState,
            _: &Workload,
            _: &Snapshot,
            _: &NodeToStatusMap,
        ) -> Result<PostFilterResult, Status> {
            self.post_filter
                .clone()
                .unwrap_or_else(|| Err(Status::unschedulable("nothing to do")))
        }
    }

    impl PreScorePlugin for Fake {
        fn pre_score(
            &self,
            _: &mut CycleState,
            _: &Workload,
            _: &Snapshot,
            _: &[&NodeInfo],
        ) -> Result<(), Status> {
            match &self.pre_score {
                Some(s) => Err(s.clone()),
                None => Ok(()),
            }
        }
    }

    impl ScorePlugin for Fake {
        fn score(&self, _: &CycleState, _: &Workload, node: &NodeInfo) -> Result<i64, Status> {
            if self.score_err_on.as_deref() == Some(node.name()) {
                return Err(Status::error("injected"));
            }
            Ok(self.score)
        }

        fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
            self.normalize_to.map(|_| self as &dyn ScoreExtensions)
        }
    }

    impl ScoreExtensions for Fake {
        fn normalize_score(
            &self,
            _: &CycleState,
            _: &Workload,
            scores: &mut [NodeScore],
        ) -> Result<(), Status> {
            for s in scores.iter_mut() {
                s.score = self.normalize_to.unwrap_or(s.score);
            }
            Ok(())
        }
    }

    impl ReservePlugin for Fake {
        fn reserve(&self, _: &mut CycleState, _: &Workload, node: &str) -> Result<(), Status> {
            self.log.lock().push(format!("reserve:{}:{node}", self.name));
            if self.reserve_err {
                return Err(Status::error("no room"));
            }
            Ok(())
        }

        fn unreserve(&self, _: &mut CycleState, _: &Workload, node: &str) {
            self.log.lock().push(format!("unreserve:{}:{node}", self.name));
        }
    }

    fn all_capabilities(fake: Fake) -> PluginInstance {
        let p = Arc::new(fake);
        PluginInstance::new(p.name.clone())
            .with_pre_filter(p.clone())
            .with_filter(p.clone())
            .with_post_filter(p.clone())
            .with_pre_score(p.clone())
            .with_score(p.clone())
            .with_reserve(p)
    }

    fn filter_only(fake: Fake) -> PluginInstance {
        let p = Arc::new(fake);
        PluginInstance::new(p.name.clone()).with_filter(p)
    }

    fn registry(instances: Vec<PluginInstance>) -> Registry {
        let mut r = Registry::new();
        for inst in instances {
            let name = inst.name().to_string();
            r.register(name, move |_| Ok(inst.clone())).unwrap();
        }
        r
    }

    fn refs(names: &[&str]) -> Vec<PluginRef> {
        names.iter().map(|n| PluginRef::new(*n)).collect()
    }

    fn build(registry: &Registry, plugins: Plugins) -> FrameworkResult<Framework> {
        let options = FrameworkOptions::default().with_parallelizer(Parallelizer::new(2).unwrap());
        Framework::new(registry, &Profile::new("test", plugins), options)
    }

    fn names<T: ?Sized + Plugin>(list: &[Arc<T>]) -> Vec<&str> {
        list.iter().map(|p| p.name()).collect()
    }

    fn make_nodes(names: &[&str]) -> Vec<NodeInfo> {
        names
            .iter()
            .map(|n| {
                NodeInfo::with_workloads(
                    Host {
                        name: n.to_string(),
                        ..Default::default()
                    },
                    vec![],
                )
            })
            .collect()
    }

    // ── Build ──────────────────────────────────────────────────────

    #[test]
    fn missing_plugins_block_is_an_error() {
        let profile = Profile {
            scheduler_name: "p".to_string(),
            plugins: None,
            plugin_config: vec![],
        };
        let err = Framework::new(&Registry::new(), &profile, FrameworkOptions::default())
            .unwrap_err();
        assert_eq!(err, FrameworkError::MissingPlugins("p".to_string()));
    }

    #[test]
    fn unknown_plugin_is_an_error() {
        let err = build(&Registry::new(), Plugins {
            filter: PluginSet::enabled(&["Missing"]),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Filter plugin \"Missing\" does not exist");
    }

    #[test]
    fn plugin_must_implement_the_extension_point() {
        let r = registry(vec![filter_only(Fake::new("F"))]);
        let err = build(&r, Plugins {
            score: PluginSet::enabled(&["F"]),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "plugin \"F\" does not extend Score plugin");
    }

    #[test]
    fn duplicate_explicit_registration_fails() {
        let r = registry(vec![filter_only(Fake::new("F"))]);
        let err = build(&r, Plugins {
            filter: PluginSet::enabled(&["F", "F"]),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, FrameworkError::AlreadyRegistered {
            point: ExtensionPoint::Filter,
            plugin: "F".to_string(),
        });
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn duplicate_multi_point_registration_fails() {
        let r = registry(vec![filter_only(Fake::new("F"))]);
        let err = build(&r, Plugins {
            multi_point: PluginSet::enabled(&["F", "F"]),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn multi_point_expansion_order() {
        let r = registry(vec![
            all_capabilities(Fake::new("A")),
            all_capabilities(Fake::new("B")),
            all_capabilities(Fake::new("C")),
            filter_only(Fake::new("F")),
        ]);
        let fw = build(&r, Plugins {
            score: PluginSet::enabled(&["C", "A"]),
            multi_point: PluginSet::enabled(&["A", "B", "F"]),
            ..Default::default()
        })
        .unwrap();

        // Overrides first, then multi-point, then the remaining explicit ones.
        assert_eq!(names(&fw.score_plugins), vec!["A", "B", "C"]);
        assert_eq!(names(&fw.filter_plugins), vec!["A", "B", "F"]);
        assert_eq!(names(&fw.reserve_plugins), vec!["A", "B"]);
    }

    #[test]
    fn disabled_plugins_skip_multi_point_expansion() {
        let r = registry(vec![
            all_capabilities(Fake::new("A")),
            all_capabilities(Fake::new("B")),
        ]);
        let fw = build(&r, Plugins {
            filter: PluginSet {
                enabled: vec![],
                disabled: refs(&["*"]),
            },
            score: PluginSet {
                enabled: vec![],
                disabled: refs(&["B"]),
            },
            multi_point: PluginSet::enabled(&["A", "B"]),
            ..Default::default()
        })
        .unwrap();

        assert!(!fw.has_filter_plugins());
        assert_eq!(names(&fw.score_plugins), vec!["A"]);
        assert_eq!(names(&fw.pre_filter_plugins), vec!["A", "B"]);
    }

    #[test]
    fn score_weights_default_and_first_registration_wins() {
        let r = registry(vec![
            all_capabilities(Fake::new("A")),
            all_capabilities(Fake::new("B")),
        ]);
        let fw = build(&r, Plugins {
            score: PluginSet {
                enabled: vec![PluginRef::weighted("A", 3)],
                disabled: vec![],
            },
            multi_point: PluginSet {
                enabled: vec![PluginRef::weighted("A", 5), PluginRef::new("B")],
                disabled: vec![],
            },
            ..Default::default()
        })
        .unwrap();

        assert_eq!(fw.score_plugin_weight["A"], 3);
        assert_eq!(fw.score_plugin_weight["B"], 1);
        let listed = fw.list_plugins();
        assert_eq!(listed.score.enabled, vec![
            PluginRef::weighted("A", 3),
            PluginRef::weighted("B", 1),
        ]);
    }

    #[test]
    fn score_weight_overflow_is_rejected() {
        let r = registry(vec![
            all_capabilities(Fake::new("A")),
            all_capabilities(Fake::new("B")),
        ]);
        let huge = MAX_TOTAL_SCORE / MAX_NODE_SCORE / 2 + 1;
        let err = build(&r, Plugins {
            score: PluginSet {
                enabled: vec![PluginRef::weighted("A", huge), PluginRef::weighted("B", huge)],
                disabled: vec![],
            },
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, FrameworkError::ScoreOverflow);
    }

    #[test]
    fn repeated_plugin_config_is_rejected() {
        let r = registry(vec![filter_only(Fake::new("F"))]);
        let profile = Profile::new("p", Plugins {
            filter: PluginSet::enabled(&["F"]),
            ..Default::default()
        })
        .with_plugin_config("F", toml::Value::Integer(1))
        .with_plugin_config("F", toml::Value::Integer(2));
        let err = Framework::new(&r, &profile, FrameworkOptions::default()).unwrap_err();
        assert_eq!(err, FrameworkError::RepeatedConfig("F".to_string()));
    }

    #[test]
    fn factory_errors_are_wrapped() {
        let mut r = Registry::new();
        r.register("Bad", |_| {
            Err(FrameworkError::InvalidArgs {
                plugin: "Bad".to_string(),
                reason: "nope".to_string(),
            })
        })
        .unwrap();
        let err = build(&r, Plugins {
            filter: PluginSet::enabled(&["Bad"]),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, FrameworkError::PluginInit { ref plugin, .. } if plugin == "Bad"));
    }

    // ── Run ────────────────────────────────────────────────────────

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pre_filter_results_are_intersected() {
        let r = registry(vec![
            all_capabilities(Fake {
                pre_filter: Some(Ok(Some(set(&["h1", "h2"])))),
                ..Fake::new("A")
            }),
            all_capabilities(Fake {
                pre_filter: Some(Ok(Some(set(&["h2", "h3"])))),
                ..Fake::new("B")
            }),
            all_capabilities(Fake {
                pre_filter: Some(Ok(Some(set(&["h3"])))),
                ..Fake::new("C")
            }),
        ]);
        let snapshot = Snapshot::new();
        let workload = Workload::default();

        let fw = build(&r, Plugins {
            pre_filter: PluginSet::enabled(&["A", "B"]),
            ..Default::default()
        })
        .unwrap();
        let got = fw
            .run_pre_filter_plugins(&mut CycleState::new(), &workload, &snapshot)
            .unwrap();
        assert_eq!(got, Some(set(&["h2"])));

        let fw = build(&r, Plugins {
            pre_filter: PluginSet::enabled(&["A", "B", "C"]),
            ..Default::default()
        })
        .unwrap();
        let err = fw
            .run_pre_filter_plugins(&mut CycleState::new(), &workload, &snapshot)
            .unwrap_err();
        assert_eq!(err.code(), Code::Unschedulable);
        assert_eq!(
            err.message(),
            "node(s) didn't satisfy plugin(s) [A B C] simultaneously"
        );
    }

    #[test]
    fn pre_filter_failures() {
        let r = registry(vec![
            all_capabilities(Fake {
                pre_filter: Some(Err(Status::unresolvable("no match"))),
                ..Fake::new("U")
            }),
            all_capabilities(Fake {
                pre_filter: Some(Err(Status::error("boom"))),
                ..Fake::new("E")
            }),
            all_capabilities(Fake {
                pre_filter: Some(Ok(Some(BTreeSet::new()))),
                ..Fake::new("Empty")
            }),
        ]);
        let snapshot = Snapshot::new();
        let workload = Workload::default();
        let run = |name: &str| {
            let fw = build(&r, Plugins {
                pre_filter: PluginSet::enabled(&[name]),
                ..Default::default()
            })
            .unwrap();
            fw.run_pre_filter_plugins(&mut CycleState::new(), &workload, &snapshot)
                .unwrap_err()
        };

        let unresolvable = run("U");
        assert_eq!(unresolvable.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(unresolvable.plugin(), "U");

        let error = run("E");
        assert_eq!(error.code(), Code::Error);
        assert_eq!(error.message(), "running PreFilter plugin \"E\": boom");

        let empty = run("Empty");
        assert_eq!(empty.message(), "node(s) didn't satisfy plugin Empty");
    }

    #[test]
    fn filter_stops_at_first_rejection_and_coerces_errors() {
        let r = registry(vec![
            all_capabilities(Fake::new("Pass")),
            all_capabilities(Fake {
                filter: Some(Status::unschedulable("full")),
                ..Fake::new("Full")
            }),
            all_capabilities(Fake {
                filter: Some(Status::error("broken")),
                ..Fake::new("Broken")
            }),
        ]);
        let nodes = make_nodes(&["h1"]);
        let workload = Workload::default();

        let fw = build(&r, Plugins {
            filter: PluginSet::enabled(&["Pass", "Full", "Broken"]),
            ..Default::default()
        })
        .unwrap();
        let err = fw
            .run_filter_plugins(&CycleState::new(), &workload, &nodes[0])
            .unwrap_err();
        assert_eq!(err.code(), Code::Unschedulable);
        assert_eq!(err.plugin(), "Full");

        let fw = build(&r, Plugins {
            filter: PluginSet::enabled(&["Pass", "Broken", "Full"]),
            ..Default::default()
        })
        .unwrap();
        let err = fw
            .run_filter_plugins(&CycleState::new(), &workload, &nodes[0])
            .unwrap_err();
        assert_eq!(err.code(), Code::Error);
        assert_eq!(err.plugin(), "Broken");
        assert_eq!(err.message(), "running \"Broken\" filter plugin: broken");
    }

    #[test]
    fn post_filter_merges_unschedulable_and_stops_on_success() {
        let nominated = PostFilterResult {
            nominated_node_name: "h1".to_string(),
            victims: vec![],
        };
        let r = registry(vec![
            all_capabilities(Fake {
                post_filter: Some(Err(Status::unschedulable("a says no"))),
                ..Fake::new("A")
            }),
            all_capabilities(Fake {
                post_filter: Some(Err(Status::unresolvable("b says no"))),
                ..Fake::new("B")
            }),
            all_capabilities(Fake {
                post_filter: Some(Ok(nominated.clone())),
                ..Fake::new("C")
            }),
        ]);
        let snapshot = Snapshot::new();
        let workload = Workload::default();
        let statuses = NodeToStatusMap::new();

        let fw = build(&r, Plugins {
            post_filter: PluginSet::enabled(&["A", "B"]),
            ..Default::default()
        })
        .unwrap();
        let err = fw
            .run_post_filter_plugins(&CycleState::new(), &workload, &snapshot, &statuses)
            .unwrap_err();
        assert_eq!(err.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(err.reasons(), &["a says no", "b says no"]);

        let fw = build(&r, Plugins {
            post_filter: PluginSet::enabled(&["A", "C", "B"]),
            ..Default::default()
        })
        .unwrap();
        let got = fw
            .run_post_filter_plugins(&CycleState::new(), &workload, &snapshot, &statuses)
            .unwrap();
        assert_eq!(got, nominated);
    }

    #[test]
    fn pre_score_failure_is_an_error() {
        let r = registry(vec![all_capabilities(Fake {
            pre_score: Some(Status::unschedulable("nope")),
            ..Fake::new("A")
        })]);
        let fw = build(&r, Plugins {
            pre_score: PluginSet::enabled(&["A"]),
            ..Default::default()
        })
        .unwrap();
        let err = fw
            .run_pre_score_plugins(&mut CycleState::new(), &Workload::default(), &Snapshot::new(), &[])
            .unwrap_err();
        assert_eq!(err.code(), Code::Error);
        assert_eq!(err.message(), "running PreScore plugin \"A\": nope");
    }

    #[test]
    fn scores_are_normalized_clamped_and_weighted() {
        let r = registry(vec![
            all_capabilities(Fake {
                score: 40,
                ..Fake::new("Plain")
            }),
            all_capabilities(Fake {
                score: 1,
                normalize_to: Some(150),
                ..Fake::new("Wild")
            }),
        ]);
        let fw = build(&r, Plugins {
            score: PluginSet {
                enabled: vec![PluginRef::weighted("Plain", 2), PluginRef::weighted("Wild", 3)],
                disabled: vec![],
            },
            ..Default::default()
        })
        .unwrap();
        let nodes = make_nodes(&["h1", "h2", "h3"]);
        let refs: Vec<&NodeInfo> = nodes.iter().collect();

        let scores = fw
            .run_score_plugins(&CycleState::new(), &Workload::default(), &refs)
            .unwrap();
        let plain: Vec<i64> = scores["Plain"].iter().map(|s| s.score).collect();
        let wild: Vec<i64> = scores["Wild"].iter().map(|s| s.score).collect();
        assert_eq!(plain, vec![80, 80, 80]);
        assert_eq!(wild, vec![300, 300, 300]);
        assert_eq!(scores["Plain"][1].name, "h2");
    }

    #[test]
    fn score_error_fails_the_phase() {
        let r = registry(vec![all_capabilities(Fake {
            score: 10,
            score_err_on: Some("h2".to_string()),
            ..Fake::new("A")
        })]);
        let fw = build(&r, Plugins {
            score: PluginSet::enabled(&["A"]),
            ..Default::default()
        })
        .unwrap();
        let nodes = make_nodes(&["h1", "h2", "h3"]);
        let refs: Vec<&NodeInfo> = nodes.iter().collect();

        let err = fw
            .run_score_plugins(&CycleState::new(), &Workload::default(), &refs)
            .unwrap_err();
        assert_eq!(err.code(), Code::Error);
        assert_eq!(
            err.message(),
            "running Score plugins: plugin \"A\" failed with: injected"
        );
    }

    #[test]
    fn failed_reserve_unreserves_in_reverse_order() {
        let log: Log = Arc::default();
        let r = registry(vec![
            all_capabilities(Fake {
                log: log.clone(),
                ..Fake::new("A")
            }),
            all_capabilities(Fake {
                log: log.clone(),
                ..Fake::new("B")
            }),
            all_capabilities(Fake {
                log: log.clone(),
                reserve_err: true,
                ..Fake::new("C")
            }),
        ]);
        let fw = build(&r, Plugins {
            reserve: PluginSet::enabled(&["A", "B", "C"]),
            ..Default::default()
        })
        .unwrap();
        let workload = Workload::default();
        let mut state = CycleState::new();

        let err = fw
            .run_reserve_plugins_reserve(&mut state, &workload, "h1")
            .unwrap_err();
        assert_eq!(err.message(), "running Reserve plugin \"C\": no room");
        fw.run_reserve_plugins_unreserve(&mut state, &workload, "h1");

        assert_eq!(*log.lock(), vec![
            "reserve:A:h1",
            "reserve:B:h1",
            "reserve:C:h1",
            "unreserve:C:h1",
            "unreserve:B:h1",
            "unreserve:A:h1",
        ]);
    }

    #[test]
    fn pre_filter_extensions_are_wrapped() {
        let log: Log = Arc::default();
        let r = registry(vec![all_capabilities(Fake {
            log: log.clone(),
            ..Fake::new("A")
        })]);
        let fw = build(&r, Plugins {
            pre_filter: PluginSet::enabled(&["A"]),
            ..Default::default()
        })
        .unwrap();
        let nodes = make_nodes(&["h1"]);
        let pod = PodInfo::new(Workload {
            uid: "v".to_string(),
            ..Default::default()
        });
        let mut state = CycleState::new();

        fw.run_pre_filter_extension_add_pod(&mut state, &Workload::default(), &pod, &nodes[0])
            .unwrap();
        assert_eq!(*log.lock(), vec!["add:v"]);

        let err = fw
            .run_pre_filter_extension_remove_pod(&mut state, &Workload::default(), &pod, &nodes[0])
            .unwrap_err();
        assert_eq!(err.code(), Code::Error);
        assert_eq!(
            err.message(),
            "running RemovePod on PreFilter plugin \"A\": cannot remove"
        );
    }

    #[test]
    fn metrics_sink_observes_extension_points_and_sampled_plugins() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let r = registry(vec![all_capabilities(Fake::new("A"))]);
        let options = FrameworkOptions::default()
            .with_parallelizer(Parallelizer::new(1).unwrap())
            .with_metrics(metrics.clone());
        let fw = Framework::new(&r, &Profile::new("p", Plugins {
            pre_filter: PluginSet::enabled(&["A"]),
            ..Default::default()
        }), options)
        .unwrap();

        let mut state = CycleState::new();
        state.set_record_plugin_metrics(true);
        fw.run_pre_filter_plugins(&mut state, &Workload::default(), &Snapshot::new())
            .unwrap();

        assert_eq!(metrics.extension_point(ExtensionPoint::PreFilter, Code::Success).count, 1);
        assert_eq!(metrics.plugin(ExtensionPoint::PreFilter, "A").count, 1);
    }
}
