use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::KilnError;

/// A synchronous runtime hook, invoked as `(memo, args)`. Add and event
/// dispatch pass `Value::Null` as memo.
pub type RuntimeFn = Arc<dyn Fn(Value, &Value) -> Result<Value> + Send + Sync>;

/// A deferred runtime hook; only the async modify path accepts it.
pub type AsyncRuntimeFn = Arc<dyn Fn(Value, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One value registered under a runtime key.
#[derive(Clone)]
pub enum RuntimeHook {
    Sync(RuntimeFn),
    Async(AsyncRuntimeFn),
    /// A plain record; modify shallow-merges it into the memo.
    Data(Value),
    /// Named sub-hooks reachable with dotted keys (`key.member`).
    Members(BTreeMap<String, RuntimeHook>),
}

impl RuntimeHook {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        RuntimeHook::Sync(Arc::new(f))
    }

    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        RuntimeHook::Async(Arc::new(move |memo, args| -> BoxFuture<'static, Result<Value>> {
            Box::pin(f(memo, args))
        }))
    }

    pub fn data(value: Value) -> Self {
        RuntimeHook::Data(value)
    }

    pub fn members<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = (K, RuntimeHook)>,
        K: Into<String>,
    {
        RuntimeHook::Members(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Follows one member name. `None` where a property lookup would come
    /// back empty.
    pub(crate) fn member(&self, name: &str) -> Option<RuntimeHook> {
        match self {
            RuntimeHook::Members(members) => members.get(name).cloned(),
            RuntimeHook::Data(Value::Object(fields)) => fields.get(name).cloned().map(RuntimeHook::Data),
            _ => None,
        }
    }

    /// Falsy data (`null`, `false`, `0`, `""`) is skipped by dotted lookups.
    pub(crate) fn is_truthy(&self) -> bool {
        match self {
            RuntimeHook::Data(value) => match value {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                Value::String(s) => !s.is_empty(),
                _ => true,
            },
            _ => true,
        }
    }
}

impl fmt::Debug for RuntimeHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeHook::Sync(_) => f.write_str("Sync(..)"),
            RuntimeHook::Async(_) => f.write_str("Async(..)"),
            RuntimeHook::Data(value) => write!(f, "Data({value})"),
            RuntimeHook::Members(members) => f.debug_map().entries(members.iter()).finish(),
        }
    }
}

/// Dispatch mode of the runtime engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeApplyType {
    Add,
    Modify,
    Event,
    Compose,
}

impl FromStr for RuntimeApplyType {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(RuntimeApplyType::Add),
            "modify" => Ok(RuntimeApplyType::Modify),
            "event" => Ok(RuntimeApplyType::Event),
            "compose" => Ok(RuntimeApplyType::Compose),
            other => Err(KilnError::DispatchType(format!(
                "applyPlugins failed, type is not defined or is not matched, got {other}."
            ))),
        }
    }
}

/// A composed pipeline; invoking it threads the initial value through
/// every hook.
#[derive(Clone)]
pub struct Composed {
    hooks: Vec<RuntimeFn>,
    initial_value: Value,
    args: Value,
}

impl Composed {
    pub(crate) fn new(hooks: Vec<RuntimeFn>, initial_value: Value, args: Value) -> Self {
        Self {
            hooks,
            initial_value,
            args,
        }
    }

    /// The last-registered hook runs first, on the initial value; the
    /// first-registered hook produces the result.
    pub fn call(&self) -> Result<Value> {
        let mut memo = self.initial_value.clone();
        for hook in self.hooks.iter().rev() {
            memo = hook(memo, &self.args)?;
        }
        Ok(memo)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for Composed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composed")
            .field("hooks", &self.hooks.len())
            .field("initial_value", &self.initial_value)
            .finish()
    }
}

/// Result of the unified runtime `apply_plugins`.
#[derive(Debug, Clone)]
pub enum Applied {
    Value(Value),
    Composed(Composed),
}

impl Applied {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Applied::Value(value) => Some(value),
            Applied::Composed(_) => None,
        }
    }

    pub fn into_composed(self) -> Option<Composed> {
        match self {
            Applied::Composed(composed) => Some(composed),
            Applied::Value(_) => None,
        }
    }
}
