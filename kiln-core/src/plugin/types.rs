//! Core types for units (presets and plugins).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use super::api::PluginApi;

/// Whether a unit is a preset or a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// May declare further presets/plugins; expanded depth-first.
    Preset,
    /// Contributes hooks, commands and methods only.
    Plugin,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Preset => "preset",
            PluginKind::Plugin => "plugin",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rule that decides whether a unit's hooks take part in dispatch.
#[derive(Clone, Default)]
pub enum EnableBy {
    /// Always on unless explicitly disabled.
    #[default]
    Register,
    /// On only when the unit's key is present in user configuration.
    Config,
    /// On iff the predicate returns true. Evaluated at every dispatch.
    Predicate(Arc<dyn Fn() -> bool + Send + Sync>),
}

impl EnableBy {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        EnableBy::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for EnableBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnableBy::Register => f.write_str("Register"),
            EnableBy::Config => f.write_str("Config"),
            EnableBy::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Configuration slot declared by a unit through `describe()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Default value folded into the default configuration under the unit's key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// JSON Schema the user value must satisfy. Units with a schema claim
    /// their key in user configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl UnitConfig {
    pub fn with_schema(schema: Value) -> Self {
        Self {
            default: None,
            schema: Some(schema),
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// What a unit's entry function returns.
///
/// Only presets may expand further: `presets` and `plugins` must be arrays of
/// references. Any other fields are default-configuration fields, reserved
/// for future use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Value>,
    #[serde(flatten)]
    pub defaults: Map<String, Value>,
}

impl ApplyOutcome {
    pub fn with_presets<I, S>(mut self, presets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.presets = Some(Value::Array(
            presets.into_iter().map(|p| Value::String(p.into())).collect(),
        ));
        self
    }

    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = Some(Value::Array(
            plugins.into_iter().map(|p| Value::String(p.into())).collect(),
        ));
        self
    }
}

/// A unit's entry function. It receives the unit's capability surface.
#[async_trait]
pub trait PluginEntry: Send + Sync {
    async fn apply(&self, api: PluginApi) -> Result<ApplyOutcome>;
}

#[async_trait]
impl<F, Fut> PluginEntry for F
where
    F: Fn(PluginApi) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApplyOutcome>> + Send + 'static,
{
    async fn apply(&self, api: PluginApi) -> Result<ApplyOutcome> {
        (self)(api).await
    }
}

/// Wraps a closure as an entry.
pub fn entry<F, Fut>(f: F) -> Arc<dyn PluginEntry>
where
    F: Fn(PluginApi) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApplyOutcome>> + Send + 'static,
{
    Arc::new(f)
}

type EntryLoader = dyn Fn() -> Result<Arc<dyn PluginEntry>> + Send + Sync;

/// A registered (or registrable) unit.
#[derive(Clone)]
pub struct PluginDescriptor {
    /// Globally unique id.
    pub id: String,
    /// Short camel-cased name of the unit's user-configuration slot.
    pub key: String,
    pub path: PathBuf,
    pub kind: PluginKind,
    pub enable_by: EnableBy,
    pub config: Option<UnitConfig>,
    loader: Arc<EntryLoader>,
}

impl PluginDescriptor {
    /// Creates a descriptor whose entry is produced lazily by `loader`.
    pub fn new<L>(
        id: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<PathBuf>,
        kind: PluginKind,
        loader: L,
    ) -> Self
    where
        L: Fn() -> Result<Arc<dyn PluginEntry>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            key: key.into(),
            path: path.into(),
            kind,
            enable_by: EnableBy::Register,
            config: None,
            loader: Arc::new(loader),
        }
    }

    /// Creates an in-process descriptor around an existing entry. The id
    /// doubles as the path.
    pub fn from_entry(
        id: impl Into<String>,
        key: impl Into<String>,
        kind: PluginKind,
        entry: Arc<dyn PluginEntry>,
    ) -> Self {
        let id = id.into();
        let path = PathBuf::from(&id);
        Self::new(id, key, path, kind, move || Ok(entry.clone()))
    }

    pub fn preset(id: impl Into<String>, key: impl Into<String>, entry: Arc<dyn PluginEntry>) -> Self {
        Self::from_entry(id, key, PluginKind::Preset, entry)
    }

    pub fn plugin(id: impl Into<String>, key: impl Into<String>, entry: Arc<dyn PluginEntry>) -> Self {
        Self::from_entry(id, key, PluginKind::Plugin, entry)
    }

    /// Produces the unit's entry function. Never called before the unit is
    /// initialized.
    pub fn load(&self) -> Result<Arc<dyn PluginEntry>> {
        (self.loader)()
    }

    pub fn is_preset(&self) -> bool {
        self.kind == PluginKind::Preset
    }

    pub fn has_schema(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.schema.is_some())
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("enable_by", &self.enable_by)
            .field("config", &self.config)
            .finish()
    }
}

/// A reference to a unit: either a path to resolve or a prebuilt descriptor.
#[derive(Debug, Clone)]
pub enum UnitRef {
    Path(String),
    Descriptor(PluginDescriptor),
}

impl From<&str> for UnitRef {
    fn from(path: &str) -> Self {
        UnitRef::Path(path.to_string())
    }
}

impl From<String> for UnitRef {
    fn from(path: String) -> Self {
        UnitRef::Path(path)
    }
}

impl From<PluginDescriptor> for UnitRef {
    fn from(descriptor: PluginDescriptor) -> Self {
        UnitRef::Descriptor(descriptor)
    }
}
