//! Runtime hook engine: hook storage and dispatch without the staged
//! lifecycle, for code running inside a generated application.
//!
//! Hooks run in registration order. There is no enable gating and no
//! descriptor resolution; keys must come from a fixed set.

mod hook;

pub use hook::{Applied, AsyncRuntimeFn, Composed, RuntimeApplyType, RuntimeFn, RuntimeHook};

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::KilnError;

/// What a runtime plugin contributes: hooks by key.
#[derive(Debug, Clone, Default)]
pub struct RuntimePlugin {
    pub path: String,
    pub apply: BTreeMap<String, RuntimeHook>,
}

impl RuntimePlugin {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            apply: BTreeMap::new(),
        }
    }

    pub fn hook(mut self, key: impl Into<String>, hook: RuntimeHook) -> Self {
        self.apply.insert(key.into(), hook);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeHooks {
    valid_keys: Vec<String>,
    hooks: HashMap<String, Vec<RuntimeHook>>,
}

impl RuntimeHooks {
    pub fn new<I, S>(valid_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid_keys: valid_keys.into_iter().map(Into::into).collect(),
            hooks: HashMap::new(),
        }
    }

    /// Appends the plugin's hooks. Every key must be a valid key; nothing is
    /// registered if one is not.
    pub fn register(&mut self, plugin: RuntimePlugin) -> Result<()> {
        if plugin.path.is_empty() {
            return Err(KilnError::Shape("register failed, plugin.path must supplied".into()).into());
        }
        if let Some(key) = plugin.apply.keys().find(|key| !self.valid_keys.contains(key)) {
            return Err(KilnError::Shape(format!(
                "register failed, invalid key {key} from plugin {}.",
                plugin.path
            ))
            .into());
        }
        debug!("Runtime plugin {} registers {:?}", plugin.path, plugin.apply.keys());
        for (key, hook) in plugin.apply {
            self.hooks.entry(key).or_default().push(hook);
        }
        Ok(())
    }

    /// Hooks for `key`. A dotted key walks into each hook; hooks where the
    /// walk fails, or ends on falsy data, are left out.
    pub fn get_hooks(&self, key_with_dot: &str) -> Vec<RuntimeHook> {
        let mut segments = key_with_dot.split('.');
        let key = segments.next().unwrap_or_default();
        let members: Vec<&str> = segments.collect();
        let hooks = self.hooks.get(key).cloned().unwrap_or_default();
        if members.is_empty() {
            return hooks;
        }
        hooks
            .into_iter()
            .filter_map(|hook| {
                members
                    .iter()
                    .try_fold(hook, |current, member| current.member(member))
            })
            .filter(RuntimeHook::is_truthy)
            .collect()
    }

    /// Synchronous waterfall. Records are shallow-merged into the memo.
    pub fn apply_modify(&self, key: &str, initial_value: Value, args: Option<Value>) -> Result<Value> {
        let args = check_args(args)?;
        let mut memo = initial_value;
        for hook in self.get_hooks(key) {
            memo = match hook {
                RuntimeHook::Sync(f) => f(memo, &args)?,
                RuntimeHook::Data(Value::Object(fields)) => shallow_merge(memo, fields),
                _ => {
                    return Err(KilnError::Shape(format!(
                        "applyPlugins failed, all hooks for key {key} must be function or plain object."
                    ))
                    .into())
                }
            };
        }
        Ok(memo)
    }

    /// Waterfall that also accepts deferred hooks, awaiting each before the
    /// next one starts.
    pub async fn apply_modify_async(
        &self,
        key: &str,
        initial_value: Value,
        args: Option<Value>,
    ) -> Result<Value> {
        let args = check_args(args)?;
        let mut memo = initial_value;
        for hook in self.get_hooks(key) {
            memo = match hook {
                RuntimeHook::Sync(f) => f(memo, &args)?,
                RuntimeHook::Async(f) => f(memo, args.clone()).await?,
                RuntimeHook::Data(Value::Object(fields)) => shallow_merge(memo, fields),
                _ => {
                    return Err(KilnError::Shape(format!(
                        "applyPlugins failed, all hooks for key {key} must be function, plain object or Promise."
                    ))
                    .into())
                }
            };
        }
        Ok(memo)
    }

    pub fn apply_event(&self, key: &str, args: Option<Value>) -> Result<()> {
        let args = check_args(args)?;
        for f in self.sync_hooks(key)? {
            f(Value::Null, &args)?;
        }
        Ok(())
    }

    /// Concatenates hook results onto `initial_value` (an array).
    pub fn apply_add(&self, key: &str, initial_value: Option<Value>, args: Option<Value>) -> Result<Value> {
        let args = check_args(args)?;
        let mut items = match initial_value {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(KilnError::Shape(format!(
                    "applyPlugins failed, initialValue must be Array if type is add, got {other} for {key}."
                ))
                .into())
            }
        };
        for f in self.sync_hooks(key)? {
            match f(Value::Null, &args)? {
                Value::Array(more) => items.extend(more),
                item => items.push(item),
            }
        }
        Ok(Value::Array(items))
    }

    /// Builds a callable that folds `initial_value` through every hook.
    pub fn compose(&self, key: &str, initial_value: Value, args: Option<Value>) -> Result<Composed> {
        let args = check_args(args)?;
        Ok(Composed::new(self.sync_hooks(key)?, initial_value, args))
    }

    /// Dispatches by mode. Modify takes the synchronous path.
    pub fn apply_plugins(
        &self,
        key: &str,
        kind: RuntimeApplyType,
        initial_value: Option<Value>,
        args: Option<Value>,
    ) -> Result<Applied> {
        match kind {
            RuntimeApplyType::Modify => self
                .apply_modify(key, initial_value.unwrap_or(Value::Null), args)
                .map(Applied::Value),
            RuntimeApplyType::Event => self.apply_event(key, args).map(|_| Applied::Value(Value::Null)),
            RuntimeApplyType::Add => self.apply_add(key, initial_value, args).map(Applied::Value),
            RuntimeApplyType::Compose => self
                .compose(key, initial_value.unwrap_or(Value::Null), args)
                .map(Applied::Composed),
        }
    }

    fn sync_hooks(&self, key: &str) -> Result<Vec<RuntimeFn>> {
        self.get_hooks(key)
            .into_iter()
            .map(|hook| match hook {
                RuntimeHook::Sync(f) => Ok(f),
                _ => Err(KilnError::Shape(format!(
                    "applyPlugins failed, all hooks for key {key} must be function."
                ))
                .into()),
            })
            .collect()
    }
}

fn check_args(args: Option<Value>) -> Result<Value> {
    match args {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(args @ Value::Object(_)) => Ok(args),
        Some(_) => Err(KilnError::Shape("applyPlugins failed, args must be plain object.".into()).into()),
    }
}

fn shallow_merge(memo: Value, fields: Map<String, Value>) -> Value {
    let mut merged = match memo {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(fields);
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> RuntimeHooks {
        RuntimeHooks::new(["modifyTitle", "rootContainer", "onRender", "patchRoutes"])
    }

    #[test]
    fn test_invalid_key_registers_nothing() {
        let mut hooks = engine();
        let plugin = RuntimePlugin::new("./app.ts")
            .hook("onRender", RuntimeHook::sync(|memo, _| Ok(memo)))
            .hook("render", RuntimeHook::sync(|memo, _| Ok(memo)));

        let err = hooks.register(plugin).unwrap_err();
        assert_eq!(err.to_string(), "register failed, invalid key render from plugin ./app.ts.");
        assert!(hooks.get_hooks("onRender").is_empty());
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let mut hooks = engine();
        assert!(hooks.register(RuntimePlugin::new("")).is_err());
    }

    #[test]
    fn test_modify_merges_records() {
        let mut hooks = engine();
        hooks
            .register(RuntimePlugin::new("a").hook("modifyTitle", RuntimeHook::data(json!({ "b": 2 }))))
            .unwrap();
        hooks
            .register(RuntimePlugin::new("b").hook(
                "modifyTitle",
                RuntimeHook::sync(|mut memo, _| {
                    memo["c"] = json!(3);
                    Ok(memo)
                }),
            ))
            .unwrap();

        let out = hooks.apply_modify("modifyTitle", json!({ "a": 1 }), None).unwrap();
        assert_eq!(out, json!({ "a": 1, "b": 2, "c": 3 }));
    }

    #[test]
    fn test_args_must_be_object() {
        let hooks = engine();
        let err = hooks.apply_event("onRender", Some(json!([1]))).unwrap_err();
        assert_eq!(err.downcast_ref::<KilnError>().map(KilnError::kind), Some("ShapeError"));
    }

    #[test]
    fn test_dotted_lookup_drops_missing_members() {
        let mut hooks = engine();
        hooks
            .register(RuntimePlugin::new("a").hook(
                "patchRoutes",
                RuntimeHook::members([("before", RuntimeHook::sync(|_, _| Ok(json!("a"))))]),
            ))
            .unwrap();
        hooks
            .register(RuntimePlugin::new("b").hook("patchRoutes", RuntimeHook::data(json!({ "before": 0 }))))
            .unwrap();
        hooks
            .register(RuntimePlugin::new("c").hook("patchRoutes", RuntimeHook::sync(|m, _| Ok(m))))
            .unwrap();

        assert_eq!(hooks.get_hooks("patchRoutes").len(), 3);
        assert_eq!(hooks.get_hooks("patchRoutes.before").len(), 1);
        assert_eq!(hooks.get_hooks("patchRoutes.after").len(), 0);
    }

    #[test]
    fn test_compose_without_hooks_returns_initial_value() {
        let hooks = engine();
        let composed = hooks.compose("rootContainer", json!("app"), None).unwrap();
        assert!(composed.is_empty());
        assert_eq!(composed.call().unwrap(), json!("app"));
    }

    #[test]
    fn test_event_rejects_records() {
        let mut hooks = engine();
        hooks
            .register(RuntimePlugin::new("a").hook("onRender", RuntimeHook::data(json!({ "x": 1 }))))
            .unwrap();
        assert!(hooks.apply_event("onRender", None).is_err());
    }
}
