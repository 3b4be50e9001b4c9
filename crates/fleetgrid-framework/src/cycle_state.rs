//! Per-attempt scratch storage shared between the phases of a plugin.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Value stored in a [`CycleState`]. Implemented for every cloneable,
/// thread-safe type.
pub trait StateData: Any + Send + Sync {
    fn clone_data(&self) -> Box<dyn StateData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + Send + Sync> StateData for T {
    fn clone_data(&self) -> Box<dyn StateData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Key → plugin-defined value for one scheduling attempt.
///
/// Sequential phases get `&mut CycleState`; the parallel Filter and Score
/// phases only ever see `&CycleState`.
#[derive(Default)]
pub struct CycleState {
    storage: HashMap<String, Box<dyn StateData>>,
    record_plugin_metrics: bool,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn write<T: StateData>(&mut self, key: impl Into<String>, value: T) {
        self.storage.insert(key.into(), Box::new(value));
    }

    /// Value under `key`, if present and of type `T`.
    pub fn read<T: 'static>(&self, key: &str) -> Option<&T> {
        self.storage
            .get(key)
            .and_then(|v| v.as_ref().as_any().downcast_ref::<T>())
    }

    /// Mutable value under `key`, if present and of type `T`.
    pub fn read_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.storage
            .get_mut(key)
            .and_then(|v| v.as_mut().as_any_mut().downcast_mut::<T>())
    }

    pub fn delete(&mut self, key: &str) {
        self.storage.remove(key);
    }

    /// Whether per-plugin timings should be reported for this attempt.
    pub fn record_plugin_metrics(&self) -> bool {
        self.record_plugin_metrics
    }

    /// Enable per-plugin timing for this attempt.
    pub fn set_record_plugin_metrics(&mut self, flag: bool) {
        self.record_plugin_metrics = flag;
    }
}

impl Clone for CycleState {
    fn clone(&self) -> Self {
        Self {
            storage: self
                .storage
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().clone_data()))
                .collect(),
            record_plugin_metrics: self.record_plugin_metrics,
        }
    }
}

impl fmt::Debug for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.storage.keys().collect();
        keys.sort();
        f.debug_struct("CycleState")
            .field("keys", &keys)
            .field("record_plugin_metrics", &self.record_plugin_metrics)
            .finish()
    }
}
