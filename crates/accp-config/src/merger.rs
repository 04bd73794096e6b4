//! Route parameter inheritance
//!
//! A node's parameters are a partial document layered over its parent's
//! effective parameters:
//! 1. Scalars - the child value replaces the parent value
//! 2. Maps - unioned, recursing per key (child wins on conflicts)
//! 3. Lists - concatenated, skipping values already present

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Partial route parameters as written in a route node
///
/// Kept as raw JSON so that absent keys stay absent and inherit, instead of
/// being filled with defaults before the merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteParametersPatch(Map<String, Value>);

impl RouteParametersPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Set a top-level parameter
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Layer this patch over `base` in place.
    pub fn merge_into(&self, base: &mut Value) {
        deep_merge(base, Value::Object(self.0.clone()));
    }
}

/// Deep merge two JSON values, `right` wins on scalar conflicts
pub fn deep_merge(left: &mut Value, right: Value) {
    match (left, right) {
        (Value::Object(left_map), Value::Object(right_map)) => {
            for (key, right_value) in right_map {
                if let Some(left_value) = left_map.get_mut(&key) {
                    deep_merge(left_value, right_value);
                } else {
                    left_map.insert(key, right_value);
                }
            }
        }
        (Value::Array(left_items), Value::Array(right_items)) => {
            for item in right_items {
                if !left_items.contains(&item) {
                    left_items.push(item);
                }
            }
        }
        (left, right) => {
            *left = right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_override() {
        let mut base = json!({"dsn": "http://a", "introspect": false});
        deep_merge(&mut base, json!({"introspect": true}));
        assert_eq!(base, json!({"dsn": "http://a", "introspect": true}));
    }

    #[test]
    fn test_map_union_child_wins() {
        let mut base = json!({"limits": {"token": {"max_counter": 5, "ttl": "10s"}}});
        deep_merge(
            &mut base,
            json!({"limits": {"token": {"max_counter": 2}, "ip": {"max_counter": 9}}}),
        );
        assert_eq!(base["limits"]["token"]["max_counter"], 2);
        assert_eq!(base["limits"]["token"]["ttl"], "10s");
        assert_eq!(base["limits"]["ip"]["max_counter"], 9);
    }

    #[test]
    fn test_map_union_keeps_declaration_order() {
        let mut base = json!({"limits": {"b": 1}});
        deep_merge(&mut base, json!({"limits": {"a": 2, "c": 3}}));
        let keys: Vec<_> = base["limits"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_list_concat_dedup() {
        let mut base = json!({"methods": ["GET"]});
        deep_merge(&mut base, json!({"methods": ["POST", "GET", "PUT"]}));
        assert_eq!(base["methods"], json!(["GET", "POST", "PUT"]));
    }

    #[test]
    fn test_patch_merge_into() {
        let mut patch = RouteParametersPatch::new();
        assert!(patch.is_empty());
        patch.set("route_key", json!("users"));
        let mut base = json!({"route_key": "", "dsn": "http://a"});
        patch.merge_into(&mut base);
        assert_eq!(base["route_key"], "users");
        assert_eq!(base["dsn"], "http://a");
    }
}
