//! Registries shared by the service and every capability surface.

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::KilnError;
use crate::package::PackageManifest;
use crate::paths::ServicePaths;
use crate::plugin::api::MethodFn;
use crate::plugin::commands::CommandTable;
use crate::plugin::discovery::PluginDiscovery;
use crate::plugin::hooks::{order_hooks, run_pipeline, ApplyPluginsOptions, HookDescriptor};
use crate::plugin::types::{EnableBy, PluginDescriptor, PluginKind};

use super::stage::ServiceStage;

/// Mutable registries. Only the service advances `stage`.
#[derive(Default)]
pub(crate) struct ServiceState {
    pub stage: ServiceStage,
    /// Registered units, in registration order.
    pub plugins: Vec<PluginDescriptor>,
    /// Hooks per owner id, in owner registration order.
    pub hooks_by_owner: Vec<(String, Vec<HookDescriptor>)>,
    pub hooks_by_key: HashMap<String, Vec<HookDescriptor>>,
    /// Per-key pipeline order, computed at first dispatch after `initHooks`.
    pub ordered_hooks: HashMap<String, Arc<Vec<HookDescriptor>>>,
    pub methods: HashMap<String, MethodFn>,
    pub skip: HashSet<String>,
    pub commands: CommandTable,
    pub extra_presets: VecDeque<PluginDescriptor>,
    pub extra_plugins: VecDeque<PluginDescriptor>,
    pub config: Option<Map<String, Value>>,
    pub args: Value,
}

impl ServiceState {
    pub fn unit(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut PluginDescriptor> {
        self.plugins.iter_mut().find(|p| p.id == id)
    }

    /// Moves a unit and its hooks to a new id.
    pub fn rename_unit(&mut self, from: &str, to: &str) {
        if let Some(unit) = self.unit_mut(from) {
            unit.id = to.to_string();
        }
        if let Some((owner, hooks)) = self.hooks_by_owner.iter_mut().find(|(owner, _)| owner == from) {
            *owner = to.to_string();
            for hook in hooks.iter_mut() {
                hook.owner_id = to.to_string();
            }
        }
    }

    pub fn push_hook(&mut self, hook: HookDescriptor) {
        match self
            .hooks_by_owner
            .iter_mut()
            .find(|(owner, _)| *owner == hook.owner_id)
        {
            Some((_, hooks)) => hooks.push(hook),
            None => self.hooks_by_owner.push((hook.owner_id.clone(), vec![hook])),
        }
    }

    /// Groups hooks by key, owners in registration order.
    pub fn flatten_hooks(&mut self) {
        self.hooks_by_key.clear();
        self.ordered_hooks.clear();
        for (owner, hooks) in &self.hooks_by_owner {
            for hook in hooks {
                let mut hook = hook.clone();
                hook.owner_id = owner.clone();
                self.hooks_by_key.entry(hook.key.clone()).or_default().push(hook);
            }
        }
    }
}

/// State owned by a service and borrowed by its capability surfaces.
pub(crate) struct ServiceInner {
    pub cwd: PathBuf,
    pub pkg: PackageManifest,
    pub env: String,
    pub discovery: PluginDiscovery,
    /// Shared with collaborators; updated in place at `getPaths`.
    pub paths: Arc<RwLock<ServicePaths>>,
    pub user_config: RwLock<Map<String, Value>>,
    pub state: RwLock<ServiceState>,
}

impl ServiceInner {
    pub fn read(&self) -> RwLockReadGuard<'_, ServiceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stage(&self) -> ServiceStage {
        self.read().stage
    }

    pub fn set_stage(&self, stage: ServiceStage) {
        self.write().stage = stage;
        info!("Service stage: {}", stage);
    }

    pub fn user_config(&self) -> Map<String, Value> {
        self.user_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_user_config_value(&self, key: &str, value: Value) {
        self.user_config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    pub fn paths(&self) -> ServicePaths {
        self.paths.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn config(&self) -> Option<Map<String, Value>> {
        self.read().config.clone()
    }

    pub fn args(&self) -> Value {
        self.read().args.clone()
    }

    /// Adds a unit to the registry. Ids are unique.
    pub fn register_unit(&self, unit: PluginDescriptor) -> Result<()> {
        let mut state = self.write();
        if let Some(existing) = state.unit(&unit.id) {
            let kind = unit.kind;
            return Err(KilnError::Conflict(format!(
                "{kind} {} is already registered by {}, {kind} from {} register failed.",
                unit.id,
                existing.path.display(),
                unit.path.display()
            ))
            .into());
        }
        debug!("Registered {} {}", unit.kind, unit.id);
        state.plugins.push(unit);
        Ok(())
    }

    pub fn units(&self) -> Vec<PluginDescriptor> {
        self.read().plugins.clone()
    }

    /// Whether the hooks of `id` take part in dispatch right now.
    pub fn is_plugin_enable(&self, id: &str) -> bool {
        let (key, enable_by) = {
            let state = self.read();
            if state.skip.contains(id) {
                return false;
            }
            match state.unit(id) {
                Some(unit) => (unit.key.clone(), unit.enable_by.clone()),
                None => {
                    debug!("Enable check for unregistered unit {}", id);
                    return false;
                }
            }
        };

        {
            let user_config = self.user_config.read().unwrap_or_else(PoisonError::into_inner);
            if user_config.get(&key) == Some(&Value::Bool(false)) {
                return false;
            }
            if matches!(enable_by, EnableBy::Config) && !user_config.contains_key(&key) {
                return false;
            }
        }

        match enable_by {
            EnableBy::Predicate(predicate) => predicate(),
            _ => true,
        }
    }

    /// True iff every id is a registered, currently enabled unit of `kind`.
    pub fn has_units(&self, kind: PluginKind, ids: &[&str]) -> bool {
        ids.iter().all(|id| {
            let registered = self.read().unit(id).is_some_and(|unit| unit.kind == kind);
            registered && self.is_plugin_enable(id)
        })
    }

    pub fn skip_plugins(&self, ids: &[&str]) {
        let mut state = self.write();
        for id in ids {
            state.skip.insert(id.to_string());
        }
    }

    fn ordered_hooks(&self, key: &str) -> Arc<Vec<HookDescriptor>> {
        let mut state = self.write();
        if let Some(ordered) = state.ordered_hooks.get(key) {
            return ordered.clone();
        }
        let hooks = state.hooks_by_key.get(key).cloned().unwrap_or_default();
        let ordered = Arc::new(order_hooks(hooks));
        if state.stage >= ServiceStage::InitHooks {
            state.ordered_hooks.insert(key.to_string(), ordered.clone());
        }
        ordered
    }

    /// The pipeline for `key`, gated at the moment of the call.
    pub fn enabled_hooks(&self, key: &str) -> Vec<HookDescriptor> {
        self.ordered_hooks(key)
            .iter()
            .filter(|hook| self.is_plugin_enable(&hook.owner_id))
            .cloned()
            .collect()
    }

    pub async fn apply_plugins(&self, opts: ApplyPluginsOptions) -> Result<Value> {
        let hooks = self.enabled_hooks(&opts.key);
        if hooks.is_empty() && self.stage() < ServiceStage::InitHooks {
            warn!(
                "applyPlugins({}) called at stage {}, before hooks are flattened",
                opts.key,
                self.stage()
            );
        }
        debug!("applyPlugins {} ({}) with {} hooks", opts.key, opts.kind, hooks.len());
        run_pipeline(opts.kind, &opts.key, hooks, opts.initial_value, opts.args).await
    }
}
