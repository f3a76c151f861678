//! The lifecycle orchestrator.
//!
//! `init` walks the stages in order: presets expand depth-first, plugins
//! initialize, hooks are flattened, `onPluginReady` fires, configuration and
//! paths are resolved. `run` then fires `onStart` and dispatches a command.

mod stage;
pub(crate) mod state;

pub use stage::ServiceStage;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::config;
use crate::error::KilnError;
use crate::package::PackageManifest;
use crate::paths::{get_paths, ServicePaths, DEFAULT_ENV};
use crate::plugin::api::{MethodSpec, PluginApi};
use crate::plugin::commands::Command;
use crate::plugin::discovery::{PluginDiscovery, ResolveSources, PLUGINS_ENV, PRESETS_ENV};
use crate::plugin::hooks::ApplyPluginsOptions;
use crate::plugin::loader::{ModuleLoader, StaticModules};
use crate::plugin::types::{ApplyOutcome, PluginDescriptor, PluginKind, UnitRef};

use state::{ServiceInner, ServiceState};

/// Methods every surface can call from the start.
const BUILTIN_METHODS: &[&str] = &[
    "onPluginReady",
    "modifyPaths",
    "onStart",
    "modifyDefaultConfig",
    "modifyConfig",
];

/// How to build a [`Service`].
#[derive(Clone)]
pub struct ServiceOptions {
    pub cwd: PathBuf,
    /// Defaults to `<cwd>/package.json`.
    pub pkg: Option<PackageManifest>,
    pub presets: Vec<UnitRef>,
    pub plugins: Vec<UnitRef>,
    pub user_config: Map<String, Value>,
    pub env: String,
    /// Comma list, normally `KILN_PRESETS`.
    pub preset_env: Option<String>,
    /// Comma list, normally `KILN_PLUGINS`.
    pub plugin_env: Option<String>,
    pub loader: Arc<dyn ModuleLoader>,
}

impl ServiceOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            pkg: None,
            presets: Vec::new(),
            plugins: Vec::new(),
            user_config: Map::new(),
            env: DEFAULT_ENV.to_string(),
            preset_env: None,
            plugin_env: None,
            loader: Arc::new(StaticModules::new()),
        }
    }

    /// Reads the preset/plugin comma lists from the process environment.
    pub fn with_process_env(mut self) -> Self {
        self.preset_env = std::env::var(PRESETS_ENV).ok();
        self.plugin_env = std::env::var(PLUGINS_ENV).ok();
        self
    }

    pub fn presets(mut self, presets: Vec<UnitRef>) -> Self {
        self.presets = presets;
        self
    }

    pub fn plugins(mut self, plugins: Vec<UnitRef>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn user_config(mut self, user_config: Map<String, Value>) -> Self {
        self.user_config = user_config;
        self
    }

    pub fn env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn pkg(mut self, pkg: PackageManifest) -> Self {
        self.pkg = Some(pkg);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }
}

/// The orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
    presets: Vec<UnitRef>,
    plugins: Vec<UnitRef>,
    preset_env: Option<String>,
    plugin_env: Option<String>,
}

impl Service {
    pub fn new(opts: ServiceOptions) -> Result<Self> {
        if !opts.cwd.is_dir() {
            return Err(KilnError::UnresolvedReference(format!(
                "cwd {} does not exist",
                opts.cwd.display()
            ))
            .into());
        }
        let cwd = crate::plugin::discovery::normalize(&opts.cwd);
        let pkg = opts
            .pkg
            .unwrap_or_else(|| PackageManifest::load_or_default(&cwd));
        let paths = get_paths(&cwd, &opts.user_config, &opts.env);
        let discovery = PluginDiscovery::new(&cwd, opts.loader);

        let inner = Arc::new(ServiceInner {
            cwd,
            pkg,
            env: opts.env,
            discovery,
            paths: Arc::new(RwLock::new(paths)),
            user_config: RwLock::new(opts.user_config),
            state: RwLock::new(ServiceState::default()),
        });

        Ok(Self {
            inner,
            presets: opts.presets,
            plugins: opts.plugins,
            preset_env: opts.preset_env,
            plugin_env: opts.plugin_env,
        })
    }

    pub fn stage(&self) -> ServiceStage {
        self.inner.stage()
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn pkg(&self) -> &PackageManifest {
        &self.inner.pkg
    }

    pub fn env(&self) -> &str {
        &self.inner.env
    }

    pub fn user_config(&self) -> Map<String, Value> {
        self.inner.user_config()
    }

    /// Replaces one top-level user configuration value. Later enable checks
    /// observe the change.
    pub fn set_user_config_value(&self, key: &str, value: Value) {
        self.inner.set_user_config_value(key, value);
    }

    /// Resolved configuration, available once `getConfig` has run.
    pub fn config(&self) -> Option<Map<String, Value>> {
        self.inner.config()
    }

    pub fn paths(&self) -> ServicePaths {
        self.inner.paths()
    }

    /// The live paths object. Updated in place at `getPaths`.
    pub fn paths_handle(&self) -> Arc<RwLock<ServicePaths>> {
        self.inner.paths.clone()
    }

    pub fn args(&self) -> Value {
        self.inner.args()
    }

    /// Registered unit ids, in registration order.
    pub fn plugin_ids(&self) -> Vec<String> {
        self.inner.read().plugins.iter().map(|p| p.id.clone()).collect()
    }

    pub fn plugin(&self, id: &str) -> Option<PluginDescriptor> {
        self.inner.read().unit(id).cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.inner.read().commands.names()
    }

    pub fn is_plugin_enable(&self, id: &str) -> bool {
        self.inner.is_plugin_enable(id)
    }

    pub fn has_plugins(&self, ids: &[&str]) -> bool {
        self.inner.has_units(PluginKind::Plugin, ids)
    }

    pub fn has_presets(&self, ids: &[&str]) -> bool {
        self.inner.has_units(PluginKind::Preset, ids)
    }

    pub fn skip_plugins(&self, ids: &[&str]) {
        self.inner.skip_plugins(ids);
    }

    pub fn register_command(&self, command: Command) -> Result<()> {
        self.inner.write().commands.register(command)
    }

    pub async fn apply_plugins(&self, opts: ApplyPluginsOptions) -> Result<Value> {
        self.inner.apply_plugins(opts).await
    }

    /// A surface for `unit` with the built-in methods available.
    pub fn plugin_api(&self, unit: &PluginDescriptor) -> Result<PluginApi> {
        let api = PluginApi::new(unit.id.clone(), unit.key.clone(), self.inner.clone());
        for name in BUILTIN_METHODS {
            api.register_method(MethodSpec::new(*name).exits_error(false))?;
        }
        Ok(api)
    }

    /// Runs every stage up to and including `getPaths`.
    pub async fn init(&self) -> Result<()> {
        if self.stage() != ServiceStage::Uninitialized {
            return Err(KilnError::StageViolation(format!(
                "service init failed, it is already at stage {}.",
                self.stage()
            ))
            .into());
        }
        self.inner.set_stage(ServiceStage::Init);

        let user_config = self.inner.user_config();
        let (presets, plugins) = self.resolve_initial_units(&user_config)?;
        debug!(
            "Initial presets: {:?}",
            presets.iter().map(|p| p.id.as_str()).collect::<Vec<_>>()
        );
        debug!(
            "Initial plugins: {:?}",
            plugins.iter().map(|p| p.id.as_str()).collect::<Vec<_>>()
        );

        self.inner.set_stage(ServiceStage::InitPresets);
        let mut queue = VecDeque::from(presets);
        while let Some(preset) = queue.pop_front() {
            self.init_preset(preset).await?;
        }

        self.inner.set_stage(ServiceStage::InitPlugins);
        self.inner.write().extra_plugins.extend(plugins);
        while let Some(plugin) = self.next_plugin() {
            self.init_plugin(plugin).await?;
        }

        self.inner.set_stage(ServiceStage::InitHooks);
        self.inner.write().flatten_hooks();

        self.inner.set_stage(ServiceStage::PluginReady);
        self.apply_plugins(ApplyPluginsOptions::event("onPluginReady"))
            .await?;

        self.inner.set_stage(ServiceStage::GetConfig);
        let units = self.inner.units();
        let defaults = Value::Object(config::get_default_config(&units));
        let default_config = self
            .apply_plugins(ApplyPluginsOptions::modify("modifyDefaultConfig").initial_value(defaults))
            .await?;
        let resolved = config::get_config(
            self.stage(),
            &self.inner.units(),
            &self.inner.user_config(),
            &default_config,
        )?;
        let modified = self
            .apply_plugins(ApplyPluginsOptions::modify("modifyConfig").initial_value(Value::Object(resolved)))
            .await?;
        let Value::Object(resolved) = modified else {
            return Err(KilnError::Shape(format!(
                "modifyConfig must return an object, got {modified}."
            ))
            .into());
        };
        let output_path = resolved
            .get("outputPath")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.inner.write().config = Some(resolved);

        self.inner.set_stage(ServiceStage::GetPaths);
        if let Some(output_path) = output_path {
            let abs = crate::plugin::discovery::normalize(&self.inner.cwd.join(output_path));
            self.inner
                .paths
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .abs_output_path = Some(abs);
        }
        let current = self.inner.paths().to_value();
        let modified = self
            .apply_plugins(ApplyPluginsOptions::modify("modifyPaths").initial_value(current))
            .await?;
        self.inner
            .paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge_from(modified)?;

        info!("Service initialized with {} units", self.plugin_ids().len());
        Ok(())
    }

    /// Initializes the service and runs command `name`.
    pub async fn run(&self, name: &str, args: Value) -> Result<Value> {
        let args = normalize_args(name, args)?;
        self.inner.write().args = args.clone();

        self.init().await?;
        self.inner.set_stage(ServiceStage::Run);

        info!("Running command {}", name);
        self.apply_plugins(
            ApplyPluginsOptions::event("onStart").args(json!({ "name": name, "args": args.clone() })),
        )
        .await?;
        self.run_command(name, args).await
    }

    /// Dispatches a registered command. Aliases are followed one hop.
    pub async fn run_command(&self, name: &str, args: Value) -> Result<Value> {
        if self.stage() < ServiceStage::Init {
            return Err(KilnError::StageViolation("service is not initialized.".into()).into());
        }
        let args = normalize_args(name, args)?;
        let command = self.inner.read().commands.resolve(name)?.clone();
        debug!("Dispatching command {}", command.name);
        command.call(args).await
    }

    fn resolve_initial_units(
        &self,
        user_config: &Map<String, Value>,
    ) -> Result<(Vec<PluginDescriptor>, Vec<PluginDescriptor>)> {
        let discovery = &self.inner.discovery;
        let reference_list = |name: &str| -> Result<Vec<Value>> {
            match user_config.get(name) {
                Some(Value::Array(items)) => Ok(items.clone()),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(KilnError::Shape(format!(
                    "config.{name} must be Array of string, got {other}."
                ))
                .into()),
            }
        };
        let user_presets = reference_list("presets")?;
        let user_plugins = reference_list("plugins")?;

        let presets = discovery.resolve_units(
            PluginKind::Preset,
            ResolveSources {
                explicit: &self.presets,
                env: self.preset_env.as_deref(),
                pkg: &self.inner.pkg,
                user_config: &user_presets,
            },
        )?;
        let plugins = discovery.resolve_units(
            PluginKind::Plugin,
            ResolveSources {
                explicit: &self.plugins,
                env: self.plugin_env.as_deref(),
                pkg: &self.inner.pkg,
                user_config: &user_plugins,
            },
        )?;
        Ok((presets, plugins))
    }

    fn next_plugin(&self) -> Option<PluginDescriptor> {
        self.inner.write().extra_plugins.pop_front()
    }

    fn take_extra_presets(&self, returned: Vec<PluginDescriptor>) -> VecDeque<PluginDescriptor> {
        let mut state = self.inner.write();
        let mut pending: VecDeque<PluginDescriptor> = returned.into();
        pending.extend(std::mem::take(&mut state.extra_presets));
        pending
    }

    async fn apply_api(&self, unit: &PluginDescriptor, api: PluginApi) -> Result<ApplyOutcome> {
        debug!("Applying {} {}", unit.kind, unit.id);
        let entry = unit.load()?;
        entry.apply(api).await
    }

    /// Registers and applies one preset, then drains the presets it declared
    /// before returning.
    fn init_preset(&self, mut preset: PluginDescriptor) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            preset.kind = PluginKind::Preset;
            let api = self.plugin_api(&preset)?;
            self.inner.register_unit(preset.clone())?;
            let outcome = self.apply_api(&preset, api.clone()).await?;
            let id = api.id();

            let returned = match outcome.presets {
                Some(presets) => self.expansion_units(&id, PluginKind::Preset, presets)?,
                None => Vec::new(),
            };
            let mut pending = self.take_extra_presets(returned);
            while let Some(next) = pending.pop_front() {
                self.init_preset(next).await?;
            }

            if let Some(plugins) = outcome.plugins {
                let plugins = self.expansion_units(&id, PluginKind::Plugin, plugins)?;
                self.inner.write().extra_plugins.extend(plugins);
            }
            Ok(())
        })
    }

    async fn init_plugin(&self, mut plugin: PluginDescriptor) -> Result<()> {
        plugin.kind = PluginKind::Plugin;
        let api = self.plugin_api(&plugin)?;
        self.inner.register_unit(plugin.clone())?;
        let outcome = self.apply_api(&plugin, api.clone()).await?;
        if outcome.presets.is_some() || outcome.plugins.is_some() {
            warn!(
                "Plugin {} returned presets/plugins; only presets may expand",
                api.id()
            );
        }
        Ok(())
    }

    fn expansion_units(&self, id: &str, kind: PluginKind, value: Value) -> Result<Vec<PluginDescriptor>> {
        let Value::Array(items) = value else {
            return Err(KilnError::Shape(format!(
                "{kind}s returned from preset {id} must be Array."
            ))
            .into());
        };
        items
            .iter()
            .map(|item| match item {
                Value::String(path) => self
                    .inner
                    .discovery
                    .to_descriptor(kind, &UnitRef::Path(path.clone())),
                other => Err(KilnError::UnresolvedReference(format!(
                    "{kind}s returned from preset {id} must be paths, got {other}."
                ))
                .into()),
            })
            .collect()
    }
}

/// Ensures `args` is an object with a positional `_` list, dropping a
/// leading entry equal to the command name.
fn normalize_args(name: &str, args: Value) -> Result<Value> {
    let mut args = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(KilnError::Shape(format!(
                "run command failed, args must be plain object, got {other}."
            ))
            .into())
        }
    };
    let positional = args
        .entry("_".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !positional.is_array() {
        *positional = Value::Array(Vec::new());
    }
    if let Value::Array(items) = positional {
        if items.first().and_then(Value::as_str) == Some(name) {
            items.remove(0);
        }
    }
    Ok(Value::Object(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_args_shifts_command_name() {
        let args = normalize_args("build", json!({ "_": ["build", "extra"], "watch": true })).unwrap();
        assert_eq!(args, json!({ "_": ["extra"], "watch": true }));

        let args = normalize_args("build", Value::Null).unwrap();
        assert_eq!(args, json!({ "_": [] }));

        assert!(normalize_args("build", json!("x")).is_err());
    }
}
