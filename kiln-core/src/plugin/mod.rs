//! Units (presets and plugins), their capability surface and the hook
//! dispatch engine.

pub mod api;
pub mod commands;
pub mod discovery;
pub mod hooks;
pub mod loader;
pub mod types;

pub use api::{
    method, DescribeOptions, HostMember, Member, MethodArg, MethodFn, MethodSpec, OwnMember, PluginApi,
};
pub use commands::{Command, CommandEntry, CommandTable};
pub use discovery::{PluginDiscovery, ResolveSources, PLUGINS_ENV, PRESETS_ENV};
pub use hooks::{ApplyPluginsOptions, ApplyPluginsType, Handler, HookDescriptor, HookSpec};
pub use loader::{ModuleLoader, StaticModules};
pub use types::{entry, ApplyOutcome, EnableBy, PluginDescriptor, PluginEntry, PluginKind, UnitConfig, UnitRef};
