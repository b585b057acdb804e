//! Provisioning engine of the Scaleway fleeting plugin.
//!
//! An [`InstanceGroup`] scales a named group of servers through a pipeline of
//! handlers ([`BaseHandler`], [`ServerHandler`]). Each batch issues the
//! provider calls of every instance before waiting on any of them, and rolls
//! back the instances that fail. [`FleetingGroup`] adapts the group to an
//! autoscaler host.

pub mod config;
pub mod errors;
pub mod group;
pub mod handler;
pub mod handler_base;
pub mod handler_server;
pub mod instance;
pub mod instance_group;
pub mod naming;
pub mod plugin;

pub use config::{ConfigError, PluginConfig};
pub use errors::{ErrorKind, GroupError, MultiError};
pub use group::{Group, GroupConfig};
pub use handler::{
    CleanupHandler, CreateHandler, Handler, PreDecreaseHandler, PreIncreaseHandler, SanityHandler,
};
pub use handler_base::BaseHandler;
pub use handler_server::ServerHandler;
pub use instance::{Iid, Instance, PendingOperation};
pub use instance_group::{BatchResult, InstanceGroup};
pub use naming::{NameGenerator, RandomNameGenerator, SequentialNameGenerator};
pub use plugin::{FleetingGroup, PluginError};
