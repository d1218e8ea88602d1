use crate::models::QueryResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^QUERY_RESULT_([0-9]+)$").expect("valid placeholder regex"));

/// Replaces every `QUERY_RESULT_<n>` string with the n-th result set. Indexes
/// without a result resolve to an empty array.
pub fn resolve_placeholders(value: &Value, results: &[QueryResult]) -> Value {
    match value {
        Value::String(text) => match placeholder_index(text) {
            Some(index) => Value::Array(
                index
                    .and_then(|index| results.get(index))
                    .cloned()
                    .unwrap_or_default(),
            ),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_placeholders(item, results))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), resolve_placeholders(item, results)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// `Some(None)` is a placeholder whose index does not fit in `usize`.
fn placeholder_index(text: &str) -> Option<Option<usize>> {
    let captures = PLACEHOLDER.captures(text)?;
    Some(captures.get(1).and_then(|digits| digits.as_str().parse().ok()))
}
