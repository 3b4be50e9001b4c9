//! The in-tree plugin registry and the default profile.

use fleetgrid_framework::config::DEFAULT_SCHEDULER_NAME;
use fleetgrid_framework::{FrameworkResult, PluginRef, PluginSet, Plugins, Profile, Registry, SchedulerConfig};

use crate::names::*;
use crate::{
    defaultpreemption, imagelocality, interpodaffinity, nodeaffinity, nodename, noderesources,
    nodeunschedulable, podtopologyspread, tainttoleration,
};

/// Factories for every in-tree plugin, keyed by plugin name.
pub fn in_tree_registry() -> FrameworkResult<Registry> {
    let mut registry = Registry::new();
    registry.register(NODE_RESOURCES_FIT, noderesources::new_fit)?;
    registry.register(NODE_RESOURCES_BALANCED_ALLOCATION, noderesources::new_balanced_allocation)?;
    registry.register(NODE_AFFINITY, nodeaffinity::new)?;
    registry.register(INTER_POD_AFFINITY, interpodaffinity::new)?;
    registry.register(POD_TOPOLOGY_SPREAD, podtopologyspread::new)?;
    registry.register(TAINT_TOLERATION, tainttoleration::new)?;
    registry.register(NODE_UNSCHEDULABLE, nodeunschedulable::new)?;
    registry.register(NODE_NAME, nodename::new)?;
    registry.register(IMAGE_LOCALITY, imagelocality::new)?;
    registry.register(DEFAULT_PREEMPTION, defaultpreemption::new)?;
    Ok(registry)
}

/// The default plugin set, enabled through multi-point. Order is the
/// order plugins run at each extension point.
pub fn default_plugins() -> Plugins {
    Plugins {
        multi_point: PluginSet {
            enabled: vec![
                PluginRef::new(NODE_UNSCHEDULABLE),
                PluginRef::new(NODE_NAME),
                PluginRef::weighted(TAINT_TOLERATION, 3),
                PluginRef::weighted(NODE_AFFINITY, 2),
                PluginRef::weighted(NODE_RESOURCES_FIT, 1),
                PluginRef::weighted(POD_TOPOLOGY_SPREAD, 2),
                PluginRef::weighted(INTER_POD_AFFINITY, 2),
                PluginRef::new(DEFAULT_PREEMPTION),
                PluginRef::weighted(NODE_RESOURCES_BALANCED_ALLOCATION, 1),
                PluginRef::weighted(IMAGE_LOCALITY, 1),
            ],
            disabled: Vec::new(),
        },
        ..Default::default()
    }
}

/// The `default-scheduler` profile with [`default_plugins`].
pub fn default_profile() -> Profile {
    Profile::new(DEFAULT_SCHEDULER_NAME, default_plugins())
}

/// Default configuration with the default profile filled in.
pub fn default_config() -> SchedulerConfig {
    SchedulerConfig {
        profiles: vec![default_profile()],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_framework::{Framework, FrameworkOptions};

    #[test]
    fn registry_holds_every_plugin() {
        let registry = in_tree_registry().unwrap();
        for name in [
            NODE_RESOURCES_FIT,
            NODE_RESOURCES_BALANCED_ALLOCATION,
            NODE_AFFINITY,
            INTER_POD_AFFINITY,
            POD_TOPOLOGY_SPREAD,
            TAINT_TOLERATION,
            NODE_UNSCHEDULABLE,
            NODE_NAME,
            IMAGE_LOCALITY,
            DEFAULT_PREEMPTION,
        ] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn default_profile_builds() {
        let fw = Framework::new(
            &in_tree_registry().unwrap(),
            &default_profile(),
            FrameworkOptions::default(),
        )
        .unwrap();
        assert!(fw.has_filter_plugins());
        assert!(fw.has_post_filter_plugins());
        assert!(fw.has_score_plugins());

        let listed = fw.list_plugins();
        let names = |set: &PluginSet| set.enabled.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        assert_eq!(
            names(&listed.filter),
            vec![
                NODE_UNSCHEDULABLE,
                NODE_NAME,
                TAINT_TOLERATION,
                NODE_AFFINITY,
                NODE_RESOURCES_FIT,
                POD_TOPOLOGY_SPREAD,
                INTER_POD_AFFINITY,
            ]
        );
        assert_eq!(names(&listed.post_filter), vec![DEFAULT_PREEMPTION]);
        assert_eq!(
            names(&listed.score),
            vec![
                NODE_AFFINITY,
                NODE_RESOURCES_FIT,
                POD_TOPOLOGY_SPREAD,
                INTER_POD_AFFINITY,
                NODE_RESOURCES_BALANCED_ALLOCATION,
                IMAGE_LOCALITY,
            ]
        );
    }

    #[test]
    fn default_config_round_trips() {
        let config = default_config();
        let text = config.to_toml_string().unwrap();
        let parsed = SchedulerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.profiles, config.profiles);
    }
}
