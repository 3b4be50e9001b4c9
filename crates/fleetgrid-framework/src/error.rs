//! Error types for building and running a scheduling framework.

use thiserror::Error;

use crate::interface::ExtensionPoint;

/// Result type alias for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors raised while assembling plugins into a profile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameworkError {
    #[error("profile {0:?} has no plugins block")]
    MissingPlugins(String),

    #[error("a plugin named {0} already exists")]
    DuplicateFactory(String),

    #[error("no plugin named {0} exists")]
    UnknownFactory(String),

    #[error("repeated config for plugin {0}")]
    RepeatedConfig(String),

    #[error("initializing plugin {plugin:?}: {reason}")]
    PluginInit { plugin: String, reason: String },

    #[error("invalid args for plugin {plugin:?}: {reason}")]
    InvalidArgs { plugin: String, reason: String },

    #[error("{point} plugin {plugin:?} does not exist")]
    PluginNotFound { point: ExtensionPoint, plugin: String },

    #[error("plugin {plugin:?} does not extend {point} plugin")]
    NotImplemented { point: ExtensionPoint, plugin: String },

    #[error("plugin {plugin:?} already registered as {point:?}")]
    AlreadyRegistered { point: ExtensionPoint, plugin: String },

    #[error("score plugin {0:?} is not configured with weight")]
    MissingWeight(String),

    #[error("total score of Score plugins could overflow")]
    ScoreOverflow,

    #[error("building worker pool: {0}")]
    WorkerPool(String),
}
