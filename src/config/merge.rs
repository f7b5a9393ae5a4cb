//! Deep merge of configuration tiers.
//!
//! Higher tiers override lower tiers field by field. Arrays are replaced
//! entirely, not concatenated.

use serde_json::Value;

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// - Objects are merged recursively: keys in overlay override keys in base
/// - Arrays and scalars are replaced entirely
/// - If overlay is null, the base value is preserved (null means "not specified")
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merge multiple values in order, with later values taking precedence.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_nested_sections() {
        let base = json!({
            "llm": {"model": "gpt-4o-mini", "temperature": 0.2},
            "agents": {"poll_interval_ms": 2000}
        });
        let overlay = json!({"llm": {"model": "local"}});
        let result = deep_merge(base, overlay);
        assert_eq!(result["llm"]["model"], "local");
        assert_eq!(result["llm"]["temperature"], 0.2);
        assert_eq!(result["agents"]["poll_interval_ms"], 2000);
    }

    #[test]
    fn test_arrays_are_replaced() {
        let base = json!({"agents": {"enabled": ["architect", "generator"]}});
        let overlay = json!({"agents": {"enabled": ["validator"]}});
        let result = deep_merge(base, overlay);
        assert_eq!(result["agents"]["enabled"], json!(["validator"]));
    }

    #[test]
    fn test_null_keeps_base() {
        let base = json!({"http": {"port": 31995}});
        let overlay = json!({"http": {"port": null}});
        let result = deep_merge(base, overlay);
        assert_eq!(result["http"]["port"], 31995);
    }

    #[test]
    fn test_merge_all_in_order() {
        let result = deep_merge_all(vec![
            json!({"budget": {"max_calls": 50, "max_time_ms": 600000}}),
            json!({"budget": {"max_calls": 10}}),
            json!({"budget": {"max_calls": 3}}),
        ]);
        assert_eq!(result["budget"]["max_calls"], 3);
        assert_eq!(result["budget"]["max_time_ms"], 600000);
    }
}
