pub mod builtin;
pub mod config;
pub mod error;
pub mod package;
pub mod paths;
pub mod plugin;
pub mod runtime;
pub mod service;

pub use error::{kiln_error, KilnError};
pub use package::PackageManifest;
pub use paths::ServicePaths;
pub use plugin::{
    entry, ApplyOutcome, ApplyPluginsOptions, ApplyPluginsType, Command, DescribeOptions, EnableBy, Handler,
    HookSpec, MethodArg, MethodSpec, PluginApi, PluginDescriptor, PluginKind, StaticModules, UnitConfig, UnitRef,
};
pub use runtime::{RuntimeHook, RuntimeHooks, RuntimePlugin};
pub use service::{Service, ServiceOptions, ServiceStage};
