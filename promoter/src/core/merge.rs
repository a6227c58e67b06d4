//! Recursive merge of JSON trees, used to patch live resources.

use serde_json::Value;

/// Merge `incoming` into `base`.
///
/// - Objects merge key by key, recursively; keys only present in `base` are kept.
/// - Arrays merge position by position; the result has `incoming`'s length.
/// - Anything else (scalars, `null`, type mismatches) takes `incoming` as-is.
pub fn merge_values(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(left), Value::Object(right)) => {
            let mut out = left.clone();
            for (key, value) in right {
                let merged = match left.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(left), Value::Array(right)) => Value::Array(
            right
                .iter()
                .enumerate()
                .map(|(i, value)| match left.get(i) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                })
                .collect(),
        ),
        (_, other) => other.clone(),
    }
}
