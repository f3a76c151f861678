use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::KilnError;
use crate::plugin::api::{method, MethodArg, MethodSpec, PluginApi};
use crate::plugin::types::{entry, ApplyOutcome, PluginDescriptor};
use crate::service::ServiceStage;

/// Extension points every project gets. Each one registers its argument as
/// a hook under its own name.
pub const STANDARD_METHODS: &[&str] = &[
    "onGenerateFiles",
    "onBuildComplete",
    "onExit",
    "onPatchRoute",
    "onPatchRouteBefore",
    "onPatchRoutes",
    "onPatchRoutesBefore",
    "onDevCompileDone",
    "addBeforeMiddlewares",
    "addDepInfo",
    "addDevScripts",
    "addMiddlewares",
    "addRuntimePlugin",
    "addRuntimePluginKey",
    "addKilnExports",
    "addProjectFirstLibraries",
    "addPolyfillImports",
    "addEntryImportsAhead",
    "addEntryImports",
    "addEntryCodeAhead",
    "addEntryCode",
    "addHTMLMetas",
    "addHTMLLinks",
    "addHTMLStyles",
    "addHTMLHeadScripts",
    "addHTMLScripts",
    "addTmpGenerateWatcherPaths",
    "chainBundleConfig",
    "modifyHTML",
    "modifyBundler",
    "modifyBundleConfigOpts",
    "modifyBundleConfig",
    "modifyBundleConfigs",
    "modifyBundleImplementor",
    "modifyHTMLChunks",
    "modifyDevHTMLContent",
    "modifyExportRouteMap",
    "modifyProdHTMLContent",
    "modifyPublicPathStr",
    "modifyRendererPath",
    "modifyRoutes",
];

const TS_NOCHECK: &str = "// @ts-nocheck";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTmpFile {
    path: String,
    content: String,
    #[serde(default = "default_skip_ts_check")]
    skip_ts_check: bool,
}

fn default_skip_ts_check() -> bool {
    true
}

fn is_ts_file(path: &str) -> bool {
    (path.ends_with(".ts") || path.ends_with(".tsx")) && !path.ends_with(".d.ts")
}

/// Writes `{path, content, skipTSCheck?}` under the temp directory. Returns
/// whether the file was (re)written.
fn write_tmp_file(api: &PluginApi, arg: MethodArg) -> Result<Value> {
    if api.stage() < ServiceStage::PluginReady {
        return Err(KilnError::StageViolation(
            "api.writeTmpFile() should not execute in register stage.".into(),
        )
        .into());
    }
    let MethodArg::Value(value) = arg else {
        return Err(KilnError::Shape(
            "api.writeTmpFile() failed, expects { path, content }.".into(),
        )
        .into());
    };
    let opts: WriteTmpFile =
        serde_json::from_value(value).context("api.writeTmpFile() failed, invalid arguments")?;

    let tmp = api
        .paths()
        .abs_tmp_path
        .ok_or_else(|| anyhow!("api.writeTmpFile() failed, absTmpPath is not set"))?;
    let abs_path = tmp.join(&opts.path);
    if let Some(parent) = abs_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let content = if is_ts_file(&opts.path) && opts.skip_ts_check {
        format!("{TS_NOCHECK}\n{}", opts.content)
    } else {
        opts.content
    };
    if is_unchanged(&abs_path, &content) {
        debug!("Skipping unchanged tmp file {}", abs_path.display());
        return Ok(Value::Bool(false));
    }
    fs::write(&abs_path, content)
        .with_context(|| format!("Failed to write tmp file {}", abs_path.display()))?;
    Ok(Value::Bool(true))
}

fn is_unchanged(path: &Path, content: &str) -> bool {
    fs::read_to_string(path).is_ok_and(|existing| existing == content)
}

/// `@@/registerMethods`: standard extension points plus `writeTmpFile`.
pub fn register_methods() -> PluginDescriptor {
    PluginDescriptor::plugin(
        "@@/registerMethods",
        "registerMethods",
        entry(|api: PluginApi| async move {
            for name in STANDARD_METHODS {
                api.register_method(MethodSpec::new(*name))?;
            }
            api.register_method(MethodSpec::new("writeTmpFile").handler(method(write_tmp_file)))?;
            Ok(ApplyOutcome::default())
        }),
    )
}
