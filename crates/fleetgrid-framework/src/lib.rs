//! FleetGrid scheduling framework.
//!
//! A profile is a named list of plugins attached to extension points
//! (PreFilter, Filter, PostFilter, PreScore, Score, Reserve/Unreserve).
//! This crate owns:
//! - the plugin capability traits and the [`Registry`] of factories
//! - [`Framework`], which builds a profile and runs its plugins
//! - [`Parallelizer`], the bounded worker pool used by Filter and Score
//! - [`Snapshot`], the immutable per-attempt view of the cluster
//! - scheduler configuration and the injectable metrics sink

pub mod config;
pub mod cycle_state;
pub mod error;
pub mod interface;
pub mod metrics;
pub mod parallelize;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod status;

pub use config::{PluginConfig, PluginRef, PluginSet, Plugins, Profile, SchedulerConfig};
pub use cycle_state::CycleState;
pub use error::{FrameworkError, FrameworkResult};
pub use interface::{
    ExtensionPoint, FilterPlugin, Handle, MAX_NODE_SCORE, MIN_NODE_SCORE, Plugin, PluginInstance,
    PostFilterPlugin, PreFilterExtensions, PreFilterPlugin, PreScorePlugin, ReservePlugin,
    ScoreExtensions, ScorePlugin, default_normalize_score,
};
pub use metrics::{AttemptResult, InMemoryMetrics, MetricsSink, NoopMetrics};
pub use parallelize::{CancelToken, ErrorChannel, Parallelizer};
pub use registry::{PluginFactory, Registry, decode_args};
pub use runtime::{Framework, FrameworkOptions};
pub use snapshot::Snapshot;
pub use status::{
    Code, NodeScore, NodeToStatusMap, PluginToNodeScores, PluginToStatus, PostFilterResult,
    PreFilterResult, Status,
};
