use serde_json::{ Map, Value };
use std::collections::BTreeMap;

/// One incremental patch, classified by shape so the merge can match
/// exhaustively instead of re-inspecting JSON types at every level.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Append-only text streaming.
    Text(String),
    /// Pointwise structural merge.
    Nested(BTreeMap<String, Delta>),
    /// Anything else (null, numbers, bools, arrays) overwrites the slot.
    Replace(Value),
}

impl From<&Value> for Delta {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Delta::Text(s.clone()),
            Value::Object(map) => {
                Delta::Nested(
                    map
                        .iter()
                        .map(|(k, v)| (k.clone(), Delta::from(v)))
                        .collect()
                )
            }
            other => Delta::Replace(other.clone()),
        }
    }
}

/// Merge a patch into a partially built value. Returns a new value; `base`
/// is never mutated, so a failed caller can keep its previous state.
///
/// With no base the result is the patch verbatim. Text onto text
/// concatenates, nested onto an object recurses per key (keys present only
/// in the base survive unchanged), and a type mismatch resolves in favor of
/// the patch.
pub fn merge(base: Option<&Value>, delta: &Delta) -> Value {
    match delta {
        Delta::Text(diff) => {
            match base {
                Some(Value::String(existing)) => {
                    let mut merged = String::with_capacity(existing.len() + diff.len());
                    merged.push_str(existing);
                    merged.push_str(diff);
                    Value::String(merged)
                }
                Some(Value::Null) | None => Value::String(diff.clone()),
                Some(_) => Value::String(diff.clone()),
            }
        }
        Delta::Nested(fields) => {
            let mut merged: Map<String, Value> = match base {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            for (key, field_delta) in fields {
                let updated = merge(merged.get(key), field_delta);
                merged.insert(key.clone(), updated);
            }
            Value::Object(merged)
        }
        Delta::Replace(value) => value.clone(),
    }
}

/// Convenience for callers holding the patch as raw JSON.
pub fn merge_value(base: Option<&Value>, diff: &Value) -> Value {
    merge(base, &Delta::from(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_merge_is_concatenation() {
        let base = json!("Hello");
        let merged = merge(Some(&base), &Delta::Text(" World".to_string()));
        assert_eq!(merged, json!("Hello World"));
        // base untouched
        assert_eq!(base, json!("Hello"));
    }

    #[test]
    fn absent_base_yields_diff_verbatim() {
        assert_eq!(merge(None, &Delta::Text("hi".to_string())), json!("hi"));
        let nested = Delta::from(&json!({ "content": "hi" }));
        assert_eq!(merge(None, &nested), json!({ "content": "hi" }));
    }

    #[test]
    fn structural_merge_is_pointwise() {
        let base = json!({
            "content": "step 1",
            "function_call": { "name": "bash", "arguments": { "command": "ls" } },
            "untouched": 42
        });
        let diff = json!({
            "content": "\nstep 2",
            "function_call": { "arguments": { "command": " -la" } }
        });
        let merged = merge_value(Some(&base), &diff);
        assert_eq!(merged["content"], json!("step 1\nstep 2"));
        assert_eq!(merged["function_call"]["name"], json!("bash"));
        assert_eq!(merged["function_call"]["arguments"]["command"], json!("ls -la"));
        assert_eq!(merged["untouched"], json!(42));
        // base untouched (not merely equal: keys deep inside too)
        assert_eq!(base["function_call"]["arguments"]["command"], json!("ls"));
    }

    #[test]
    fn nested_diff_builds_missing_levels() {
        let base = json!({ "content": "x" });
        let diff = json!({ "function_call": { "name": "py" } });
        let merged = merge_value(Some(&base), &diff);
        assert_eq!(merged["function_call"]["name"], json!("py"));
        assert_eq!(merged["content"], json!("x"));
    }

    #[test]
    fn non_text_payloads_replace() {
        let base = json!({ "display_data": ["a"] });
        let diff = json!({ "display_data": ["a", "b"] });
        let merged = merge_value(Some(&base), &diff);
        assert_eq!(merged["display_data"], json!(["a", "b"]));
    }
}
