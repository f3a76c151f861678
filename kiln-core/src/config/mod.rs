//! Configuration resolution: default-config fold and schema validation of
//! user configuration.

pub mod utils;

use anyhow::Result;
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::KilnError;
use crate::plugin::PluginDescriptor;
use crate::service::ServiceStage;

pub use utils::{get_user_config_with_key, merge_default, update_user_config_with_key};

/// Folds every unit's declared default under the unit's key.
pub fn get_default_config(units: &[PluginDescriptor]) -> Map<String, Value> {
    let mut defaults = Map::new();
    for unit in units {
        if let Some(default) = unit.config.as_ref().and_then(|c| c.default.clone()) {
            defaults.insert(unit.key.clone(), default);
        }
    }
    defaults
}

/// Validates user configuration against the schemas units declared.
///
/// Each schema-bearing unit claims its key. A present, non-`false` value is
/// validated; a unit that also declares a default gets the user value merged
/// over it. Top-level keys nobody claimed (and not `false`) are rejected.
pub fn get_config(
    stage: ServiceStage,
    units: &[PluginDescriptor],
    user_config: &Map<String, Value>,
    default_config: &Value,
) -> Result<Map<String, Value>> {
    if stage < ServiceStage::PluginReady {
        return Err(KilnError::StageViolation(
            "Config.getConfig() failed, it should not be executed before plugin is ready.".into(),
        )
        .into());
    }

    let mut config = user_config.clone();
    let mut unclaimed: Vec<String> = user_config
        .iter()
        .filter(|(_, value)| **value != Value::Bool(false))
        .map(|(key, _)| key.clone())
        .collect();

    for unit in units {
        let Some(schema) = unit.config.as_ref().and_then(|c| c.schema.as_ref()) else {
            continue;
        };
        let key = unit.key.as_str();
        let value = get_user_config_with_key(key, user_config);
        if value == Some(&Value::Bool(false)) {
            continue;
        }
        if let Some(value) = value {
            validate(key, schema, value)?;
        }

        let top = key.split('.').next().unwrap_or(key);
        unclaimed.retain(|k| k != top);

        if let Some(default) = default_config.get(key) {
            let merged = merge_default(default, value);
            update_user_config_with_key(key, merged, &mut config);
        }
    }

    if !unclaimed.is_empty() {
        unclaimed.sort();
        let noun = if unclaimed.len() > 1 { "keys" } else { "key" };
        return Err(KilnError::ConfigValidation(format!(
            "Invalid config {noun}: {}",
            unclaimed.join(", ")
        ))
        .into());
    }

    debug!("Resolved config keys: {:?}", config.keys().collect::<Vec<_>>());
    Ok(config)
}

fn validate(key: &str, schema: &Value, value: &Value) -> Result<()> {
    let compiled = JSONSchema::compile(schema).map_err(|e| {
        KilnError::ConfigValidation(format!("Validate config \"{key}\" failed, invalid schema: {e}"))
    })?;
    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect();
        return Err(KilnError::ConfigValidation(format!(
            "Validate config \"{key}\" failed, {}",
            messages.join("; ")
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::types::{entry, ApplyOutcome, UnitConfig};
    use serde_json::json;

    fn unit(key: &str, config: UnitConfig) -> PluginDescriptor {
        let mut d = PluginDescriptor::plugin(
            format!("./{key}"),
            key,
            entry(|_api| async { Ok(ApplyOutcome::default()) }),
        );
        d.config = Some(config);
        d
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_default_fold() {
        let units = vec![
            unit("title", UnitConfig::default().default_value(json!("kiln"))),
            unit("history", UnitConfig::default()),
        ];
        assert_eq!(Value::Object(get_default_config(&units)), json!({ "title": "kiln" }));
    }

    #[test]
    fn test_unknown_keys_are_listed() {
        let units = vec![unit("title", UnitConfig::with_schema(json!({ "type": "string" })))];
        let user = object(json!({ "title": "x", "foo": 1, "bar": {}, "off": false }));

        let err = get_config(ServiceStage::PluginReady, &units, &user, &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid config keys: bar, foo");
    }

    #[test]
    fn test_schema_failure_names_key() {
        let units = vec![unit("title", UnitConfig::with_schema(json!({ "type": "string" })))];
        let user = object(json!({ "title": 3 }));

        let err = get_config(ServiceStage::GetConfig, &units, &user, &json!({})).unwrap_err();
        assert_eq!(
            err.downcast_ref::<KilnError>().map(KilnError::kind),
            Some("ConfigValidationError")
        );
        assert!(err.to_string().starts_with("Validate config \"title\" failed"));
    }

    #[test]
    fn test_false_skips_validation_and_claims_nothing() {
        let units = vec![unit("title", UnitConfig::with_schema(json!({ "type": "string" })))];
        let user = object(json!({ "title": false }));
        let config = get_config(ServiceStage::PluginReady, &units, &user, &json!({})).unwrap();
        assert_eq!(config.get("title"), Some(&json!(false)));
    }

    #[test]
    fn test_default_is_merged_under_user_value() {
        let units = vec![unit(
            "theme",
            UnitConfig::with_schema(json!({ "type": "object" })).default_value(json!({ "primary": "red" })),
        )];
        let user = object(json!({ "theme": { "accent": "blue" } }));
        let defaults = Value::Object(get_default_config(&units));

        let config = get_config(ServiceStage::PluginReady, &units, &user, &defaults).unwrap();
        assert_eq!(config.get("theme"), Some(&json!({ "primary": "red", "accent": "blue" })));
    }

    #[test]
    fn test_requires_plugin_ready() {
        let err = get_config(ServiceStage::InitHooks, &[], &Map::new(), &json!({})).unwrap_err();
        assert_eq!(
            err.downcast_ref::<KilnError>().map(KilnError::kind),
            Some("StageViolationError")
        );
    }
}
