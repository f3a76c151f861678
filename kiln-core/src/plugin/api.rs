//! The capability surface handed to every unit's entry function.
//!
//! Member lookup is live: [`PluginApi::resolve`] consults the shared method
//! registry first, then the host-state accessors, then the surface's own
//! members. A method registered by one unit is visible to every unit applied
//! after it, even within the same expansion pass.

use anyhow::Result;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::KilnError;
use crate::package::PackageManifest;
use crate::paths::ServicePaths;
use crate::service::state::ServiceInner;
use crate::service::ServiceStage;

use super::commands::Command;
use super::hooks::{ApplyPluginsOptions, Handler, HookDescriptor, HookSpec};
use super::types::{EnableBy, PluginDescriptor, PluginKind, UnitConfig, UnitRef};

/// A registered method. Receives the surface it was called through.
pub type MethodFn = Arc<dyn Fn(&PluginApi, MethodArg) -> Result<Value> + Send + Sync>;

/// Wraps a closure as a method.
pub fn method<F>(f: F) -> MethodFn
where
    F: Fn(&PluginApi, MethodArg) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The single argument of a method call.
#[derive(Debug, Clone)]
pub enum MethodArg {
    /// A bare hook function.
    Handler(Handler),
    /// A hook record; an empty key defaults to the method name.
    Hook(HookSpec),
    /// Plain data.
    Value(Value),
}

impl From<Handler> for MethodArg {
    fn from(handler: Handler) -> Self {
        MethodArg::Handler(handler)
    }
}

impl From<HookSpec> for MethodArg {
    fn from(spec: HookSpec) -> Self {
        MethodArg::Hook(spec)
    }
}

impl From<Value> for MethodArg {
    fn from(value: Value) -> Self {
        MethodArg::Value(value)
    }
}

/// Arguments of `registerMethod`.
#[derive(Clone)]
pub struct MethodSpec {
    pub name: String,
    pub handler: Option<MethodFn>,
    /// Whether registering a taken name is an error (otherwise a no-op).
    pub exits_error: bool,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            exits_error: true,
        }
    }

    pub fn handler(mut self, handler: MethodFn) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn exits_error(mut self, exits_error: bool) -> Self {
        self.exits_error = exits_error;
        self
    }
}

/// Arguments of `describe()`. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct DescribeOptions {
    pub id: Option<String>,
    pub key: Option<String>,
    pub config: Option<UnitConfig>,
    /// Reset to [`EnableBy::Register`] when absent.
    pub enable_by: Option<EnableBy>,
}

impl DescribeOptions {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn config(mut self, config: UnitConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn enable_by(mut self, enable_by: EnableBy) -> Self {
        self.enable_by = Some(enable_by);
        self
    }
}

/// Host-state accessors reachable through any surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMember {
    ApplyPlugins,
    Stage,
    Paths,
    Cwd,
    Pkg,
    UserConfig,
    Config,
    Env,
    Args,
    Commands,
    HasPlugins,
    HasPresets,
}

impl HostMember {
    pub const ALL: &'static [HostMember] = &[
        HostMember::ApplyPlugins,
        HostMember::Stage,
        HostMember::Paths,
        HostMember::Cwd,
        HostMember::Pkg,
        HostMember::UserConfig,
        HostMember::Config,
        HostMember::Env,
        HostMember::Args,
        HostMember::Commands,
        HostMember::HasPlugins,
        HostMember::HasPresets,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HostMember::ApplyPlugins => "applyPlugins",
            HostMember::Stage => "stage",
            HostMember::Paths => "paths",
            HostMember::Cwd => "cwd",
            HostMember::Pkg => "pkg",
            HostMember::UserConfig => "userConfig",
            HostMember::Config => "config",
            HostMember::Env => "env",
            HostMember::Args => "args",
            HostMember::Commands => "commands",
            HostMember::HasPlugins => "hasPlugins",
            HostMember::HasPresets => "hasPresets",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// Members declared by the surface itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnMember {
    Id,
    Key,
    Describe,
    Register,
    RegisterCommand,
    RegisterPresets,
    RegisterPlugins,
    RegisterMethod,
    SkipPlugins,
}

impl OwnMember {
    pub const ALL: &'static [OwnMember] = &[
        OwnMember::Id,
        OwnMember::Key,
        OwnMember::Describe,
        OwnMember::Register,
        OwnMember::RegisterCommand,
        OwnMember::RegisterPresets,
        OwnMember::RegisterPlugins,
        OwnMember::RegisterMethod,
        OwnMember::SkipPlugins,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OwnMember::Id => "id",
            OwnMember::Key => "key",
            OwnMember::Describe => "describe",
            OwnMember::Register => "register",
            OwnMember::RegisterCommand => "registerCommand",
            OwnMember::RegisterPresets => "registerPresets",
            OwnMember::RegisterPlugins => "registerPlugins",
            OwnMember::RegisterMethod => "registerMethod",
            OwnMember::SkipPlugins => "skipPlugins",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// Result of a member lookup.
#[derive(Clone)]
pub enum Member {
    Method(MethodFn),
    Host(HostMember),
    Own(OwnMember),
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Method(_) => f.write_str("Method(..)"),
            Member::Host(m) => write!(f, "Host({})", m.name()),
            Member::Own(m) => write!(f, "Own({})", m.name()),
        }
    }
}

struct Identity {
    id: String,
    key: String,
}

struct ApiInner {
    identity: RwLock<Identity>,
    service: Arc<ServiceInner>,
}

/// One unit's view of the service. Clones share identity.
#[derive(Clone)]
pub struct PluginApi {
    inner: Arc<ApiInner>,
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("id", &self.id())
            .field("key", &self.key())
            .finish()
    }
}

impl PluginApi {
    pub(crate) fn new(id: impl Into<String>, key: impl Into<String>, service: Arc<ServiceInner>) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                identity: RwLock::new(Identity {
                    id: id.into(),
                    key: key.into(),
                }),
                service,
            }),
        }
    }

    fn service(&self) -> &ServiceInner {
        &self.inner.service
    }

    pub fn id(&self) -> String {
        self.inner
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone()
    }

    pub fn key(&self) -> String {
        self.inner
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .key
            .clone()
    }

    /// Renames the unit and updates its descriptor.
    pub fn describe(&self, opts: DescribeOptions) -> Result<()> {
        let mut identity = self
            .inner
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut state = self.service().write();

        if let Some(id) = opts.id.filter(|id| *id != identity.id) {
            if let Some(owner) = state.unit(&id) {
                return Err(KilnError::Conflict(format!(
                    "api.describe() failed, {} {} is already registered by {}.",
                    owner.kind,
                    id,
                    owner.path.display()
                ))
                .into());
            }
            debug!("Renaming unit {} to {}", identity.id, id);
            state.rename_unit(&identity.id, &id);
            identity.id = id;
        }

        if let Some(key) = opts.key.filter(|key| *key != identity.key) {
            identity.key = key.clone();
            if let Some(unit) = state.unit_mut(&identity.id) {
                unit.key = key;
            }
        }

        if let Some(unit) = state.unit_mut(&identity.id) {
            if let Some(config) = opts.config {
                unit.config = Some(config);
            }
            unit.enable_by = opts.enable_by.unwrap_or_default();
        }
        Ok(())
    }

    /// Adds a hook owned by this unit.
    pub fn register(&self, hook: HookSpec) -> Result<()> {
        if hook.key.is_empty() {
            return Err(KilnError::Shape(format!(
                "api.register() failed, hook.key must supplied and should be string, but got {:?}.",
                hook.key
            ))
            .into());
        }
        let Some(handler) = hook.handler else {
            return Err(KilnError::Shape(
                "api.register() failed, hook.fn must supplied and should be function, but got undefined."
                    .into(),
            )
            .into());
        };

        let owner_id = self.id();
        let mut state = self.service().write();
        if state.stage >= ServiceStage::InitHooks {
            warn!(
                "Hook {} registered by {} after hooks were flattened; it will not be dispatched",
                hook.key, owner_id
            );
        }
        state.push_hook(HookDescriptor {
            key: hook.key,
            handler,
            owner_id,
            stage: hook.stage,
            before: hook.before,
        });
        Ok(())
    }

    pub fn register_command(&self, command: Command) -> Result<()> {
        debug!("{} registers command {}", self.id(), command.name);
        self.service().write().commands.register(command)
    }

    /// Queues presets to run right after the current one.
    pub fn register_presets(&self, presets: Vec<UnitRef>) -> Result<()> {
        if self.service().stage() != ServiceStage::InitPresets {
            return Err(KilnError::StageViolation(
                "api.registerPresets() failed, it should only used in presets.".into(),
            )
            .into());
        }
        let descriptors = self.to_descriptors(PluginKind::Preset, &presets)?;
        let mut state = self.service().write();
        for descriptor in descriptors.into_iter().rev() {
            state.extra_presets.push_front(descriptor);
        }
        Ok(())
    }

    /// Queues plugins: at the tail while presets expand, at the head during
    /// plugin initialization.
    pub fn register_plugins(&self, plugins: Vec<UnitRef>) -> Result<()> {
        let stage = self.service().stage();
        if !matches!(stage, ServiceStage::InitPresets | ServiceStage::InitPlugins) {
            return Err(KilnError::StageViolation(
                "api.registerPlugins() failed, it should only be used in registering stage.".into(),
            )
            .into());
        }
        let descriptors = self.to_descriptors(PluginKind::Plugin, &plugins)?;
        let mut state = self.service().write();
        if stage == ServiceStage::InitPresets {
            state.extra_plugins.extend(descriptors);
        } else {
            for descriptor in descriptors.into_iter().rev() {
                state.extra_plugins.push_front(descriptor);
            }
        }
        Ok(())
    }

    fn to_descriptors(&self, kind: PluginKind, refs: &[UnitRef]) -> Result<Vec<PluginDescriptor>> {
        refs.iter()
            .map(|r| self.service().discovery.to_descriptor(kind, r))
            .collect()
    }

    /// Adds an extension point. Without a handler, calling the method
    /// registers its argument as a hook keyed by the method name.
    pub fn register_method(&self, spec: MethodSpec) -> Result<()> {
        let mut state = self.service().write();
        if state.methods.contains_key(&spec.name) {
            if spec.exits_error {
                return Err(KilnError::Conflict(format!(
                    "api.registerMethod() failed, method {} is already exist.",
                    spec.name
                ))
                .into());
            }
            return Ok(());
        }
        let handler = spec
            .handler
            .unwrap_or_else(|| default_method(spec.name.clone()));
        state.methods.insert(spec.name, handler);
        Ok(())
    }

    pub fn skip_plugins(&self, ids: &[&str]) {
        self.service().skip_plugins(ids);
    }

    /// Looks `name` up: registered methods, then host accessors, then own
    /// members.
    pub fn resolve(&self, name: &str) -> Option<Member> {
        if let Some(method) = self.service().read().methods.get(name).cloned() {
            return Some(Member::Method(method));
        }
        if let Some(host) = HostMember::from_name(name) {
            return Some(Member::Host(host));
        }
        OwnMember::from_name(name).map(Member::Own)
    }

    /// Invokes the method `name` with this surface as the caller.
    pub fn call(&self, name: &str, arg: impl Into<MethodArg>) -> Result<Value> {
        match self.resolve(name) {
            Some(Member::Method(method)) => method(self, arg.into()),
            _ => Err(KilnError::Shape(format!("api.{name} is not a function.")).into()),
        }
    }

    /// Snapshot of a data member, `None` for callables and unknown names.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.resolve(name)? {
            Member::Method(_) => None,
            Member::Host(host) => match host {
                HostMember::Stage => Some(Value::String(self.stage().as_str().to_string())),
                HostMember::Paths => Some(self.paths().to_value()),
                HostMember::Cwd => Some(Value::String(self.cwd().to_string_lossy().into_owned())),
                HostMember::Pkg => serde_json::to_value(self.pkg()).ok(),
                HostMember::UserConfig => Some(Value::Object(self.user_config())),
                HostMember::Config => Some(self.config()),
                HostMember::Env => Some(Value::String(self.env())),
                HostMember::Args => Some(self.args()),
                HostMember::Commands => Some(Value::from(self.commands())),
                HostMember::ApplyPlugins | HostMember::HasPlugins | HostMember::HasPresets => None,
            },
            Member::Own(OwnMember::Id) => Some(Value::String(self.id())),
            Member::Own(OwnMember::Key) => Some(Value::String(self.key())),
            Member::Own(_) => None,
        }
    }

    pub fn stage(&self) -> ServiceStage {
        self.service().stage()
    }

    pub fn paths(&self) -> ServicePaths {
        self.service().paths()
    }

    pub fn cwd(&self) -> PathBuf {
        self.service().cwd.clone()
    }

    pub fn pkg(&self) -> PackageManifest {
        self.service().pkg.clone()
    }

    pub fn user_config(&self) -> Map<String, Value> {
        self.service().user_config()
    }

    /// Resolved configuration, `null` before `getConfig`.
    pub fn config(&self) -> Value {
        self.service()
            .config()
            .map(Value::Object)
            .unwrap_or(Value::Null)
    }

    pub fn env(&self) -> String {
        self.service().env.clone()
    }

    pub fn args(&self) -> Value {
        self.service().args()
    }

    /// Names of registered commands, sorted.
    pub fn commands(&self) -> Vec<String> {
        self.service().read().commands.names()
    }

    pub async fn apply_plugins(&self, opts: ApplyPluginsOptions) -> Result<Value> {
        self.service().apply_plugins(opts).await
    }

    pub fn has_plugins(&self, ids: &[&str]) -> bool {
        self.service().has_units(PluginKind::Plugin, ids)
    }

    pub fn has_presets(&self, ids: &[&str]) -> bool {
        self.service().has_units(PluginKind::Preset, ids)
    }
}

fn default_method(name: String) -> MethodFn {
    Arc::new(move |api: &PluginApi, arg: MethodArg| -> Result<Value> {
        let hook = match arg {
            MethodArg::Handler(handler) => HookSpec::new(name.clone(), handler),
            MethodArg::Hook(mut spec) => {
                if spec.key.is_empty() {
                    spec.key = name.clone();
                }
                spec
            }
            MethodArg::Value(value) => {
                return Err(KilnError::Shape(format!(
                    "api.register() failed, hook.fn must supplied and should be function, but got {value}."
                ))
                .into())
            }
        };
        api.register(hook)?;
        Ok(Value::Null)
    })
}
