//! Injectable metrics sink.
//!
//! The runtime, cache and scheduler report timings and gauges through a
//! [`MetricsSink`]. [`NoopMetrics`] is the default; [`InMemoryMetrics`]
//! keeps atomic counters that can be inspected or exported by the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::interface::ExtensionPoint;
use crate::status::Code;

/// Outcome of a whole scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptResult {
    Scheduled,
    Unschedulable,
    Error,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Scheduled => "scheduled",
            AttemptResult::Unschedulable => "unschedulable",
            AttemptResult::Error => "error",
        }
    }
}

/// Receives scheduler timings and gauges. Every method defaults to a
/// no-op.
pub trait MetricsSink: Send + Sync {
    fn observe_extension_point(
        &self,
        _point: ExtensionPoint,
        _code: Code,
        _profile: &str,
        _elapsed: Duration,
    ) {
    }

    fn observe_plugin(&self, _point: ExtensionPoint, _plugin: &str, _code: Code, _elapsed: Duration) {}

    /// Gauge of cache contents: `assumed_pods`, `pods` or `nodes`.
    fn set_cache_size(&self, _kind: &str, _value: i64) {}

    fn observe_attempt(&self, _result: AttemptResult, _profile: &str, _elapsed: Duration) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Shared no-op sink.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Count and cumulative duration of one labelled series.
#[derive(Debug, Default)]
struct Series {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl Series {
    fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesStats {
    pub count: u64,
    pub total_micros: u64,
}

/// In-process aggregation of everything reported to the sink.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    extension_points: RwLock<HashMap<(ExtensionPoint, Code), Arc<Series>>>,
    plugins: RwLock<HashMap<(ExtensionPoint, String), Arc<Series>>>,
    attempts: RwLock<HashMap<AttemptResult, Arc<Series>>>,
    cache_sizes: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timings recorded for `point` with outcome `code`.
    pub fn extension_point(&self, point: ExtensionPoint, code: Code) -> SeriesStats {
        stats(self.extension_points.read().get(&(point, code)))
    }

    /// Timings recorded for one plugin at `point`.
    pub fn plugin(&self, point: ExtensionPoint, plugin: &str) -> SeriesStats {
        stats(self.plugins.read().get(&(point, plugin.to_string())))
    }

    /// Attempts recorded with `result`.
    pub fn attempts(&self, result: AttemptResult) -> SeriesStats {
        stats(self.attempts.read().get(&result))
    }

    /// Last reported size of the cache gauge `kind`.
    pub fn cache_size(&self, kind: &str) -> Option<i64> {
        self.cache_sizes
            .read()
            .get(kind)
            .map(|v| v.load(Ordering::Relaxed))
    }
}

fn stats(series: Option<&Arc<Series>>) -> SeriesStats {
    series
        .map(|s| SeriesStats {
            count: s.count.load(Ordering::Relaxed),
            total_micros: s.total_micros.load(Ordering::Relaxed),
        })
        .unwrap_or_default()
}

fn series<K: std::hash::Hash + Eq>(map: &RwLock<HashMap<K, Arc<Series>>>, key: K) -> Arc<Series> {
    if let Some(s) = map.read().get(&key) {
        return s.clone();
    }
    map.write().entry(key).or_default().clone()
}

impl MetricsSink for InMemoryMetrics {
    fn observe_extension_point(
        &self,
        point: ExtensionPoint,
        code: Code,
        _profile: &str,
        elapsed: Duration,
    ) {
        series(&self.extension_points, (point, code)).observe(elapsed);
    }

    fn observe_plugin(&self, point: ExtensionPoint, plugin: &str, _code: Code, elapsed: Duration) {
        series(&self.plugins, (point, plugin.to_string())).observe(elapsed);
    }

    fn set_cache_size(&self, kind: &str, value: i64) {
        let gauge = {
            let sizes = self.cache_sizes.read();
            sizes.get(kind).cloned()
        };
        let gauge = match gauge {
            Some(g) => g,
            None => self
                .cache_sizes
                .write()
                .entry(kind.to_string())
                .or_default()
                .clone(),
        };
        gauge.store(value, Ordering::Relaxed);
    }

    fn observe_attempt(&self, result: AttemptResult, _profile: &str, elapsed: Duration) {
        series(&self.attempts, result).observe(elapsed);
    }
}
