//! The built-in preset shipped with the kernel.

mod commands;
mod methods;

pub use commands::VERSION;
pub use methods::STANDARD_METHODS;

use serde_json::{json, Value};

use crate::plugin::api::{DescribeOptions, PluginApi};
use crate::plugin::types::{entry, ApplyOutcome, PluginDescriptor, UnitConfig, UnitRef};

pub const BUILTIN_PRESET_ID: &str = "@@/preset-built-in";

/// `@@/preset-built-in`. Hosts put it first in the preset list.
pub fn preset() -> PluginDescriptor {
    PluginDescriptor::preset(
        BUILTIN_PRESET_ID,
        "builtIn",
        entry(|api: PluginApi| async move {
            api.register_plugins(plugins().into_iter().map(UnitRef::from).collect())?;
            Ok(ApplyOutcome::default())
        }),
    )
}

/// Every plugin the built-in preset registers, in order.
pub fn plugins() -> Vec<PluginDescriptor> {
    let mut plugins = vec![methods::register_methods()];
    plugins.extend([
        config_key("presets", json!({ "type": "array", "items": { "type": "string" } })),
        config_key("plugins", json!({ "type": "array", "items": { "type": "string" } })),
        config_key("outputPath", json!({ "type": "string", "not": { "enum": ["src", "public", "pages", "mock", "config"] } })),
        config_key("singular", json!({ "type": "boolean" })),
    ]);
    plugins.extend([commands::help(), commands::version(), commands::generate()]);
    plugins
}

/// A unit whose only job is claiming a configuration key.
fn config_key(key: &'static str, schema: Value) -> PluginDescriptor {
    let id = format!("@@/features/{key}");
    PluginDescriptor::plugin(
        id,
        key,
        entry(move |api: PluginApi| {
            let schema = schema.clone();
            async move {
                api.describe(DescribeOptions::default().key(key).config(UnitConfig::with_schema(schema)))?;
                Ok(ApplyOutcome::default())
            }
        }),
    )
}
