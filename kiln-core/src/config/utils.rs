use serde_json::{Map, Value};

/// Reads a dotted key (`a.b.c`) out of the user configuration.
pub fn get_user_config_with_key<'a>(key: &str, user_config: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let first = segments.next()?;
    let mut current = user_config.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a dotted key, creating intermediate objects as needed. A non-object
/// on the way is replaced.
pub fn update_user_config_with_key(key: &str, value: Value, user_config: &mut Map<String, Value>) {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = user_config;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Merges a user value over a unit's default: objects deep-merge, anything
/// else is taken from the user value when present.
pub fn merge_default(default: &Value, config: Option<&Value>) -> Value {
    match (default, config) {
        (Value::Object(_), Some(config @ Value::Object(_))) => deep_merge(default, config),
        (_, Some(config)) => config.clone(),
        (default, None) => default.clone(),
    }
}

/// Deep merge with arrays concatenated.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Array(base), Value::Array(overlay)) => {
            Value::Array(base.iter().chain(overlay.iter()).cloned().collect())
        }
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_dotted_get_and_set() {
        let mut config = object(json!({ "webpack": { "cssLoader": { "modules": true } } }));
        assert_eq!(
            get_user_config_with_key("webpack.cssLoader.modules", &config),
            Some(&json!(true))
        );
        assert_eq!(get_user_config_with_key("webpack.missing", &config), None);

        update_user_config_with_key("webpack.cssLoader.url", json!(false), &mut config);
        update_user_config_with_key("title", json!("demo"), &mut config);
        assert_eq!(
            Value::Object(config),
            json!({
                "webpack": { "cssLoader": { "modules": true, "url": false } },
                "title": "demo"
            })
        );
    }

    #[test]
    fn test_merge_default() {
        let default = json!({ "a": 1, "list": [1], "nested": { "x": 1 } });
        let user = json!({ "list": [2], "nested": { "y": 2 } });
        assert_eq!(
            merge_default(&default, Some(&user)),
            json!({ "a": 1, "list": [1, 2], "nested": { "x": 1, "y": 2 } })
        );
        assert_eq!(merge_default(&json!("d"), None), json!("d"));
        assert_eq!(merge_default(&json!({ "a": 1 }), Some(&json!(3))), json!(3));
    }
}
