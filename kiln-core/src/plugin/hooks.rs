//! Hook model and the three dispatch semantics.
//!
//! A hook is a `(key, fn, ordering)` tuple contributed by a unit. Hooks sharing
//! a key form one pipeline, ordered by `stage` and `before` constraints, and are
//! executed strictly in sequence:
//!
//! - **add**: every hook receives `args` and returns items appended to the memo.
//! - **modify**: every hook receives `(memo, args)` and returns the next memo.
//! - **event**: every hook receives `args`; return values are discarded.

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::KilnError;

pub type HookFuture = BoxFuture<'static, Result<Value>>;

type HookCallable = dyn Fn(Value, Value) -> HookFuture + Send + Sync;

/// The callable part of a hook. Invoked as `(memo, args)`; add and event
/// dispatch pass `Value::Null` as memo.
#[derive(Clone)]
pub struct Handler(Arc<HookCallable>);

impl Handler {
    /// Wraps a `(memo, args)` function, the shape used by modify hooks.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |memo, args| -> HookFuture { Box::pin(f(memo, args)) }))
    }

    pub fn modify<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(f)
    }

    /// Wraps an `args -> items` function for add dispatch.
    pub fn add<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(move |_memo, args| f(args))
    }

    /// Wraps a side-effecting `args` function for event dispatch.
    pub fn event<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(move |_memo, args| {
            let fut = f(args);
            async move {
                fut.await?;
                Ok(Value::Null)
            }
        })
    }

    pub fn call(&self, memo: Value, args: Value) -> HookFuture {
        (self.0)(memo, args)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler(..)")
    }
}

/// What a unit passes to `api.register()`.
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    pub key: String,
    pub handler: Option<Handler>,
    pub stage: i32,
    /// Owner id whose hooks this hook must precede.
    pub before: Option<String>,
}

impl HookSpec {
    pub fn new(key: impl Into<String>, handler: Handler) -> Self {
        Self {
            key: key.into(),
            handler: Some(handler),
            stage: 0,
            before: None,
        }
    }

    pub fn stage(mut self, stage: i32) -> Self {
        self.stage = stage;
        self
    }

    pub fn before(mut self, owner_id: impl Into<String>) -> Self {
        self.before = Some(owner_id.into());
        self
    }
}

/// A registered hook, tagged with the id of the unit that owns it.
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    pub key: String,
    pub handler: Handler,
    pub owner_id: String,
    pub stage: i32,
    pub before: Option<String>,
}

/// Dispatch mode for `applyPlugins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyPluginsType {
    Add,
    Modify,
    Event,
}

impl ApplyPluginsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyPluginsType::Add => "add",
            ApplyPluginsType::Modify => "modify",
            ApplyPluginsType::Event => "event",
        }
    }
}

impl FromStr for ApplyPluginsType {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(ApplyPluginsType::Add),
            "modify" => Ok(ApplyPluginsType::Modify),
            "event" => Ok(ApplyPluginsType::Event),
            other => Err(KilnError::DispatchType(format!(
                "applyPlugins failed, type is not defined or is not matched, got {other}."
            ))),
        }
    }
}

impl fmt::Display for ApplyPluginsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one `applyPlugins` call.
#[derive(Debug, Clone)]
pub struct ApplyPluginsOptions {
    pub key: String,
    pub kind: ApplyPluginsType,
    pub initial_value: Option<Value>,
    pub args: Value,
}

impl ApplyPluginsOptions {
    pub fn new(key: impl Into<String>, kind: ApplyPluginsType) -> Self {
        Self {
            key: key.into(),
            kind,
            initial_value: None,
            args: Value::Null,
        }
    }

    pub fn add(key: impl Into<String>) -> Self {
        Self::new(key, ApplyPluginsType::Add)
    }

    pub fn modify(key: impl Into<String>) -> Self {
        Self::new(key, ApplyPluginsType::Modify)
    }

    pub fn event(key: impl Into<String>) -> Self {
        Self::new(key, ApplyPluginsType::Event)
    }

    pub fn initial_value(mut self, value: Value) -> Self {
        self.initial_value = Some(value);
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// Orders the hooks of one key.
///
/// Hooks are sorted by ascending `stage`, keeping registration order among
/// equals. `before` constraints are then enforced with a topological pass that
/// always emits the earliest ready hook of the stage order. Hooks caught in a
/// `before` cycle fall back to stage order.
pub fn order_hooks(hooks: Vec<HookDescriptor>) -> Vec<HookDescriptor> {
    let mut sorted = hooks;
    sorted.sort_by_key(|hook| hook.stage);

    let n = sorted.len();
    let mut indegree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, hook) in sorted.iter().enumerate() {
        let Some(target) = hook.before.as_deref() else {
            continue;
        };
        if target == hook.owner_id {
            continue;
        }
        for (j, other) in sorted.iter().enumerate() {
            if other.owner_id == target {
                successors[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = match ready.pop_first() {
            Some(i) => i,
            None => match (0..n).find(|&i| !placed[i]) {
                Some(i) => {
                    debug!("Hook before-constraints form a cycle at {}", sorted[i].owner_id);
                    i
                }
                None => break,
            },
        };
        placed[next] = true;
        order.push(next);
        for &succ in &successors[next] {
            indegree[succ] = indegree[succ].saturating_sub(1);
            if indegree[succ] == 0 && !placed[succ] {
                ready.insert(succ);
            }
        }
    }

    let mut slots: Vec<Option<HookDescriptor>> = sorted.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Executes an ordered, already gated pipeline.
///
/// Hooks run one at a time; each result is awaited before the next hook
/// starts. The first error aborts the pipeline.
pub async fn run_pipeline(
    kind: ApplyPluginsType,
    key: &str,
    hooks: Vec<HookDescriptor>,
    initial_value: Option<Value>,
    args: Value,
) -> Result<Value> {
    match kind {
        ApplyPluginsType::Add => {
            let mut memo = match initial_value {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(KilnError::Shape(format!(
                        "applyPlugins failed, initialValue must be Array if type is add, got {other} for {key}."
                    ))
                    .into())
                }
            };
            for hook in hooks {
                match hook.handler.call(Value::Null, args.clone()).await? {
                    Value::Array(items) => memo.extend(items),
                    item => memo.push(item),
                }
            }
            Ok(Value::Array(memo))
        }
        ApplyPluginsType::Modify => {
            let mut memo = initial_value.unwrap_or(Value::Null);
            for hook in hooks {
                memo = hook.handler.call(memo, args.clone()).await?;
            }
            Ok(memo)
        }
        ApplyPluginsType::Event => {
            for hook in hooks {
                hook.handler.call(Value::Null, args.clone()).await?;
            }
            Ok(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(owner: &str, stage: i32, before: Option<&str>) -> HookDescriptor {
        HookDescriptor {
            key: "k".to_string(),
            handler: Handler::add(|_| async { Ok(Value::Null) }),
            owner_id: owner.to_string(),
            stage,
            before: before.map(str::to_string),
        }
    }

    fn owners(hooks: &[HookDescriptor]) -> Vec<&str> {
        hooks.iter().map(|h| h.owner_id.as_str()).collect()
    }

    #[test]
    fn test_stage_order_is_stable() {
        let ordered = order_hooks(vec![
            hook("a", 0, None),
            hook("b", -1, None),
            hook("c", 0, None),
            hook("d", 1, None),
            hook("e", -1, None),
        ]);
        assert_eq!(owners(&ordered), vec!["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn test_before_moves_hook_ahead_of_owner() {
        let ordered = order_hooks(vec![
            hook("a", 0, None),
            hook("b", 0, None),
            hook("c", 0, Some("a")),
        ]);
        assert_eq!(owners(&ordered), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_before_wins_over_stage() {
        let ordered = order_hooks(vec![hook("x", 5, Some("y")), hook("y", -5, None)]);
        assert_eq!(owners(&ordered), vec!["x", "y"]);
    }

    #[test]
    fn test_before_unknown_owner_is_ignored() {
        let ordered = order_hooks(vec![hook("a", 0, None), hook("b", 0, Some("nope"))]);
        assert_eq!(owners(&ordered), vec!["a", "b"]);
    }

    #[test]
    fn test_before_cycle_falls_back_to_stage_order() {
        let ordered = order_hooks(vec![hook("a", 0, Some("b")), hook("b", 0, Some("a"))]);
        assert_eq!(owners(&ordered), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_dispatch_type() {
        assert_eq!("modify".parse::<ApplyPluginsType>(), Ok(ApplyPluginsType::Modify));
        let err = "compose".parse::<ApplyPluginsType>().unwrap_err();
        assert_eq!(err.kind(), "DispatchTypeError");
    }

    #[tokio::test]
    async fn test_add_rejects_non_array_initial_value() {
        let err = run_pipeline(ApplyPluginsType::Add, "k", vec![], Some(json!(1)), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<KilnError>().map(KilnError::kind), Some("ShapeError"));
    }

    #[tokio::test]
    async fn test_add_appends_scalar_items() {
        let mut h = hook("a", 0, None);
        h.handler = Handler::add(|_| async { Ok(json!("x")) });
        let out = run_pipeline(ApplyPluginsType::Add, "k", vec![h], Some(json!(["w"])), Value::Null)
            .await
            .unwrap();
        assert_eq!(out, json!(["w", "x"]));
    }
}
