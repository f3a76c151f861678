use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stages of the service, strictly increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStage {
    #[default]
    Uninitialized,
    Init,
    InitPresets,
    InitPlugins,
    InitHooks,
    PluginReady,
    GetConfig,
    GetPaths,
    Run,
}

impl ServiceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStage::Uninitialized => "uninitialized",
            ServiceStage::Init => "init",
            ServiceStage::InitPresets => "initPresets",
            ServiceStage::InitPlugins => "initPlugins",
            ServiceStage::InitHooks => "initHooks",
            ServiceStage::PluginReady => "pluginReady",
            ServiceStage::GetConfig => "getConfig",
            ServiceStage::GetPaths => "getPaths",
            ServiceStage::Run => "run",
        }
    }
}

impl fmt::Display for ServiceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
