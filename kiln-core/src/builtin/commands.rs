use serde_json::{json, Value};

use crate::plugin::api::PluginApi;
use crate::plugin::commands::Command;
use crate::plugin::hooks::ApplyPluginsOptions;
use crate::plugin::types::{entry, ApplyOutcome, PluginDescriptor};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `help`: lists registered command names.
pub fn help() -> PluginDescriptor {
    PluginDescriptor::plugin(
        "@@/commands/help",
        "help",
        entry(|api: PluginApi| async move {
            let commands = api.clone();
            api.register_command(
                Command::new("help", move |_args| {
                    let names = commands.commands();
                    async move { Ok(Value::from(names)) }
                })
                .description("show command list"),
            )?;
            Ok(ApplyOutcome::default())
        }),
    )
}

/// `version` (alias `v`).
pub fn version() -> PluginDescriptor {
    PluginDescriptor::plugin(
        "@@/commands/version",
        "version",
        entry(|api: PluginApi| async move {
            api.register_command(
                Command::new("version", |_args| async { Ok(json!(VERSION)) })
                    .alias("v")
                    .description("show kiln version"),
            )?;
            Ok(ApplyOutcome::default())
        }),
    )
}

/// `generate`: fires `onGenerateFiles` and returns the paths generated files
/// depend on.
pub fn generate() -> PluginDescriptor {
    PluginDescriptor::plugin(
        "@@/commands/generate",
        "generate",
        entry(|api: PluginApi| async move {
            let handle = api.clone();
            api.register_command(
                Command::new("generate", move |_args| {
                    let api = handle.clone();
                    async move {
                        api.apply_plugins(
                            ApplyPluginsOptions::event("onGenerateFiles").args(json!({ "files": [] })),
                        )
                        .await?;
                        api.apply_plugins(
                            ApplyPluginsOptions::add("addTmpGenerateWatcherPaths")
                                .initial_value(default_watcher_paths(&api)),
                        )
                        .await
                    }
                })
                .description("generate tmp files"),
            )?;
            Ok(ApplyOutcome::default())
        }),
    )
}

fn default_watcher_paths(api: &PluginApi) -> Value {
    let paths = api.paths();
    let singular = api.config().get("singular").and_then(Value::as_bool).unwrap_or(false);
    let mut watched = Vec::new();
    if let Some(pages) = paths.abs_pages_path {
        watched.push(pages);
    }
    if let Some(src) = paths.abs_src_path {
        watched.push(src.join(if singular { "layout" } else { "layouts" }));
        for app in ["app.tsx", "app.ts", "app.jsx", "app.js"] {
            watched.push(src.join(app));
        }
    }
    Value::from(
        watched
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
    )
}
