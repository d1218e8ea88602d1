use serde_json::{json, Map, Value};

/// Canonicalizes whatever the agent produced into `{blocks: [...], chaos?}`.
///
/// Block order is preserved exactly; blocks are never sorted or deduplicated.
pub fn normalize(raw: &Value) -> Value {
    let Some(spec) = raw.as_object() else {
        return json!({ "blocks": [] });
    };

    let blocks: Vec<Value> = spec
        .get("blocks")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(normalize_block).collect())
        .unwrap_or_default();

    let mut normalized = Map::new();
    normalized.insert("blocks".to_string(), Value::Array(blocks));
    if let Some(chaos @ Value::Object(_)) = spec.get("chaos") {
        normalized.insert("chaos".to_string(), chaos.clone());
    }
    Value::Object(normalized)
}

fn normalize_block(entry: &Value) -> Option<Value> {
    let block = entry.as_object()?;
    let block_type = block
        .get("type")
        .and_then(Value::as_str)
        .filter(|block_type| !block_type.is_empty())?;

    let props = match block.get("props") {
        Some(Value::Object(props)) => props.clone(),
        // Flat blocks carry their fields beside `type`.
        _ => block
            .iter()
            .filter(|(key, _)| key.as_str() != "type")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };

    Some(json!({ "type": block_type, "props": props }))
}
