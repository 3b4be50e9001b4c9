//! FleetGrid in-tree plugins.
//!
//! Each plugin module exposes a `new(args)` factory that decodes the
//! plugin's typed args from the profile's opaque TOML payload and returns
//! a [`PluginInstance`](fleetgrid_framework::PluginInstance) listing the
//! extension points it implements. [`registry::in_tree_registry`] wires
//! them all up; [`registry::default_profile`] enables them with their
//! default weights.
//!
//! - **`noderesources`**: resource fit filter and least/most/ratio
//!   scoring, plus balanced allocation
//! - **`nodeaffinity`**: host label and field affinity
//! - **`interpodaffinity`**: affinity towards co-located workloads
//! - **`podtopologyspread`**: even spreading across topology domains
//! - **`tainttoleration`**, **`nodeunschedulable`**, **`nodename`**:
//!   filter-only predicates
//! - **`imagelocality`**: prefers hosts that already have the images
//! - **`defaultpreemption`**: evicts lower-priority workloads when
//!   nothing fits

pub mod defaultpreemption;
mod helper;
pub mod imagelocality;
pub mod interpodaffinity;
pub mod names;
pub mod nodeaffinity;
pub mod nodename;
pub mod noderesources;
pub mod nodeunschedulable;
pub mod podtopologyspread;
pub mod registry;
pub mod tainttoleration;

pub use helper::{BrokenLinear, FunctionShapePoint};
pub use registry::{default_config, default_plugins, default_profile, in_tree_registry};
