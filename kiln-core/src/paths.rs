//! Filesystem layout of a project.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::KilnError;

pub const DEFAULT_ENV: &str = "development";

const TMP_DIR: &str = ".kiln";
const DEFAULT_OUTPUT_PATH: &str = "./dist";

/// Named absolute paths of the project. Units may add entries of their own
/// through `modifyPaths`; those land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_node_modules_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_src_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_pages_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_tmp_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServicePaths {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Overwrites every field present in `value`, leaving the rest untouched.
    pub fn merge_from(&mut self, value: Value) -> Result<()> {
        let Value::Object(update) = value else {
            return Err(KilnError::Shape(format!(
                "modifyPaths must return an object, got {value}."
            ))
            .into());
        };
        let mut merged = match self.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(update);
        *self = serde_json::from_value(Value::Object(merged))
            .context("Failed to merge modified paths")?;
        Ok(())
    }
}

/// Computes the layout for `cwd` from the (user) configuration and the
/// environment name.
pub fn get_paths(cwd: &Path, config: &Map<String, Value>, env: &str) -> ServicePaths {
    let src = cwd.join("src");
    let abs_src_path = if src.is_dir() { src } else { cwd.to_path_buf() };

    let singular = config.get("singular").and_then(Value::as_bool).unwrap_or(false);
    let abs_pages_path = abs_src_path.join(if singular { "page" } else { "pages" });

    let output = config
        .get("outputPath")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_OUTPUT_PATH);

    let tmp_dir = if env == DEFAULT_ENV || env.is_empty() {
        TMP_DIR.to_string()
    } else {
        format!("{TMP_DIR}-{env}")
    };

    ServicePaths {
        cwd: Some(cwd.to_path_buf()),
        abs_node_modules_path: Some(cwd.join("node_modules")),
        abs_output_path: Some(crate::plugin::discovery::normalize(&cwd.join(output))),
        abs_pages_path: Some(abs_pages_path),
        abs_tmp_path: Some(abs_src_path.join(tmp_dir)),
        abs_src_path: Some(abs_src_path),
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_layout() {
        let temp = TempDir::new().unwrap();
        let paths = get_paths(temp.path(), &Map::new(), DEFAULT_ENV);

        assert_eq!(paths.abs_src_path.as_deref(), Some(temp.path()));
        assert_eq!(paths.abs_pages_path, Some(temp.path().join("pages")));
        assert_eq!(paths.abs_output_path, Some(temp.path().join("dist")));
        assert_eq!(paths.abs_tmp_path, Some(temp.path().join(".kiln")));
    }

    #[test]
    fn test_src_dir_singular_and_env() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        let config = json!({ "singular": true, "outputPath": "build" });
        let Value::Object(config) = config else { unreachable!() };

        let paths = get_paths(temp.path(), &config, "production");
        let src = temp.path().join("src");
        assert_eq!(paths.abs_pages_path, Some(src.join("page")));
        assert_eq!(paths.abs_tmp_path, Some(src.join(".kiln-production")));
        assert_eq!(paths.abs_output_path, Some(temp.path().join("build")));
    }

    #[test]
    fn test_merge_keeps_unmodified_fields() {
        let temp = TempDir::new().unwrap();
        let mut paths = get_paths(temp.path(), &Map::new(), DEFAULT_ENV);
        paths
            .merge_from(json!({ "absOutputPath": "/out", "absLayoutsPath": "/layouts" }))
            .unwrap();

        assert_eq!(paths.abs_output_path, Some(PathBuf::from("/out")));
        assert_eq!(paths.extra.get("absLayoutsPath"), Some(&json!("/layouts")));
        assert_eq!(paths.cwd.as_deref(), Some(temp.path()));
        assert!(paths.merge_from(json!(1)).is_err());
    }
}
