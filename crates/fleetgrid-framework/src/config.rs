//! Scheduler configuration: profiles, plugin sets and plugin args.
//!
//! Loaded from TOML:
//!
//! ```toml
//! parallelism = 16
//!
//! [[profiles]]
//! scheduler_name = "default-scheduler"
//!
//! [[profiles.plugins.multi_point.enabled]]
//! name = "NodeResourcesFit"
//! weight = 1
//!
//! [[profiles.plugin_config]]
//! name = "NodeResourcesFit"
//! args = { scoring_strategy = { type = "MostAllocated" } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::parallelize::DEFAULT_PARALLELISM;

/// Profile used by workloads that name no scheduler.
pub const DEFAULT_SCHEDULER_NAME: &str = "default-scheduler";

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads used by the Filter and Score phases.
    pub parallelism: usize,
    /// Share of hosts to evaluate per attempt. 0 selects an adaptive value.
    pub percentage_of_nodes_to_score: u32,
    /// How long a bound assumed workload is kept before it expires.
    pub assumed_ttl_secs: u64,
    /// Period of the cache's expiry sweep.
    pub cleanup_period_secs: u64,
    pub profiles: Vec<Profile>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            percentage_of_nodes_to_score: 0,
            assumed_ttl_secs: 30,
            cleanup_period_secs: 1,
            profiles: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Lifetime of an assumed workload once its binding finished.
    pub fn assumed_ttl(&self) -> Duration {
        Duration::from_secs(self.assumed_ttl_secs)
    }

    /// Interval of the cache's expiry sweep, at least one second.
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_period_secs.max(1))
    }
}

/// One named scheduling pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    /// Required; a profile without it fails to build.
    pub plugins: Option<Plugins>,
    #[serde(default)]
    pub plugin_config: Vec<PluginConfig>,
}

fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_string()
}

impl Profile {
    /// A profile with `plugins` and no plugin args.
    pub fn new(scheduler_name: impl Into<String>, plugins: Plugins) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            plugins: Some(plugins),
            plugin_config: Vec::new(),
        }
    }

    /// Attach the args payload of plugin `name`.
    pub fn with_plugin_config(mut self, name: impl Into<String>, args: toml::Value) -> Self {
        self.plugin_config.push(PluginConfig {
            name: name.into(),
            args,
        });
        self
    }
}

/// Plugin sets per extension point. Unreserve follows Reserve.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Plugins {
    pub pre_filter: PluginSet,
    pub filter: PluginSet,
    pub post_filter: PluginSet,
    pub pre_score: PluginSet,
    pub score: PluginSet,
    pub reserve: PluginSet,
    /// Plugins expanded into every extension point they implement.
    pub multi_point: PluginSet,
}

/// Plugins enabled and disabled at one extension point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginSet {
    pub enabled: Vec<PluginRef>,
    /// `"*"` disables every multi-point plugin at this extension point.
    pub disabled: Vec<PluginRef>,
}

impl PluginSet {
    /// Enable `names` in order with default weights.
    pub fn enabled(names: &[&str]) -> Self {
        Self {
            enabled: names.iter().map(|n| PluginRef::new(*n)).collect(),
            disabled: Vec::new(),
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|p| p.name == name)
    }

    /// Whether `"*"` is among the disabled plugins.
    pub fn disables_all(&self) -> bool {
        self.is_disabled("*")
    }
}

/// A plugin named in a [`PluginSet`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginRef {
    pub name: String,
    /// Score weight; 0 means the default of 1.
    #[serde(default)]
    pub weight: i64,
}

impl PluginRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 0,
        }
    }

    /// A reference carrying an explicit Score weight.
    pub fn weighted(name: impl Into<String>, weight: i64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Opaque per-plugin payload, decoded by the plugin's factory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub args: toml::Value,
}
