//! Name → factory map used to instantiate the plugins of a profile.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{FrameworkError, FrameworkResult};
use crate::interface::PluginInstance;

/// Builds a plugin from its optional configuration payload.
pub type PluginFactory =
    Arc<dyn Fn(Option<&toml::Value>) -> FrameworkResult<PluginInstance> + Send + Sync>;

/// Plugin factories by name.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, PluginFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Registering a name twice is an error.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> FrameworkResult<()>
    where
        F: Fn(Option<&toml::Value>) -> FrameworkResult<PluginInstance> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(FrameworkError::DuplicateFactory(name));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Remove a factory. Unknown names are an error.
    pub fn unregister(&mut self, name: &str) -> FrameworkResult<()> {
        self.factories
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FrameworkError::UnknownFactory(name.to_string()))
    }

    /// Add every factory of `other`; fails on the first name clash.
    pub fn merge(&mut self, other: Registry) -> FrameworkResult<()> {
        for (name, factory) in other.factories {
            if self.factories.contains_key(&name) {
                return Err(FrameworkError::DuplicateFactory(name));
            }
            self.factories.insert(name, factory);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Decode a plugin's args, falling back to `T::default()` when absent.
pub fn decode_args<T>(plugin: &str, args: Option<&toml::Value>) -> FrameworkResult<T>
where
    T: DeserializeOwned + Default,
{
    match args {
        None => Ok(T::default()),
        Some(value) => value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| FrameworkError::InvalidArgs {
                plugin: plugin.to_string(),
                reason: e.to_string(),
            }),
    }
}
