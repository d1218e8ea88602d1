use crate::errors::ParseError;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Recovers one JSON object from model output that may wrap it in prose,
/// markdown fences, or stray braces.
///
/// Candidate spans are tried earliest opening brace first and, for each opening,
/// latest closing brace first, so a complete outer object wins over any inner
/// fragment of it.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, ParseError> {
    let mut attempts = 1;
    if let Some(object) = parse_object(text) {
        return Ok(object);
    }

    let openings: Vec<usize> = text.match_indices('{').map(|(index, _)| index).collect();
    let closings: Vec<usize> = text.match_indices('}').map(|(index, _)| index).collect();

    for &start in &openings {
        for &end in closings.iter().rev() {
            if end < start {
                break;
            }
            attempts += 1;
            if let Some(object) = parse_object(&text[start..=end]) {
                return Ok(object);
            }
        }
    }

    Err(ParseError {
        text: text.to_string(),
        attempts,
    })
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed).ok()? {
        Value::Object(object) => Some(object),
        _ => None,
    }
}

static CATALOG_SCHEMAS: Lazy<BTreeMap<&'static str, jsonschema::JSONSchema>> = Lazy::new(|| {
    let string = json!({ "type": "string" });
    let array = json!({ "type": "array" });
    let strings = json!({ "type": "array", "items": { "type": "string" } });
    let definitions = [
        (
            "executive-summary",
            json!({ "type": "object", "required": ["content"], "properties": { "content": string } }),
        ),
        (
            "kpi-card",
            json!({
                "type": "object",
                "required": ["ticker", "metric", "value", "change", "changeDirection"],
                "properties": {
                    "ticker": string, "metric": string, "value": string, "change": string,
                    "changeDirection": { "enum": ["up", "down"] },
                    "comparisonBenchmark": string
                }
            }),
        ),
        (
            "line-chart",
            json!({
                "type": "object",
                "required": ["title", "data", "xKey", "yKeys"],
                "properties": { "title": string, "data": array, "xKey": string, "yKeys": strings }
            }),
        ),
        (
            "candlestick-chart",
            json!({
                "type": "object",
                "required": ["ticker", "data"],
                "properties": { "ticker": string, "data": array }
            }),
        ),
        (
            "event-timeline",
            json!({ "type": "object", "required": ["events"], "properties": { "events": array } }),
        ),
        (
            "correlation-matrix",
            json!({
                "type": "object",
                "required": ["tickers", "data", "period"],
                "properties": { "tickers": strings, "data": array, "period": string }
            }),
        ),
    ];

    definitions
        .into_iter()
        .filter_map(|(block_type, schema)| {
            match jsonschema::JSONSchema::compile(&schema) {
                Ok(compiled) => Some((block_type, compiled)),
                Err(error) => {
                    tracing::error!(block_type, error = %error, "invalid catalog schema");
                    None
                }
            }
        })
        .collect()
});

/// Checks a block's props against the catalog. Unknown block types are the
/// renderer's concern and always pass.
pub fn validate_block_props(block_type: &str, props: &Value) -> Vec<String> {
    let Some(compiled) = CATALOG_SCHEMAS.get(block_type) else {
        return Vec::new();
    };

    compiled
        .validate(props)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        format!("{}: {}", block_type, error)
                    } else {
                        format!("{}{}: {}", block_type, path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}
