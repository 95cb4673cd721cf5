//! Structured-output extraction from free-form agent text.

use serde_json::Value;

use crate::error::{AgentError, Result};

/// Return the first JSON object embedded in `text`.
///
/// Each `{` is tried as the start of a value; prose, code fences and trailing
/// text around the object are ignored.
pub fn find_json_object(text: &str) -> Option<Value> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value @ Value::Object(_))) => Some(value),
            _ => None,
        }
    })
}

/// Extract the reply's JSON object and check it against the top level of
/// `schema` (required keys and declared property types).
///
/// Failure keeps the original text in `raw_text`.
pub fn extract_structured(text: &str, schema: &Value) -> Result<Value> {
    let value = find_json_object(text).ok_or_else(|| {
        AgentError::schema_extraction_failed("no JSON object found in agent output", text)
    })?;
    if let Some(problem) = schema_mismatch(schema, &value) {
        return Err(AgentError::schema_extraction_failed(problem, text));
    }
    Ok(value)
}

fn schema_mismatch(schema: &Value, value: &Value) -> Option<String> {
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for key in required {
        if value.get(key).is_none() {
            return Some(format!("JSON object is missing required field '{key}'"));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object)?;
    properties.iter().find_map(|(key, property)| {
        let actual = value.get(key)?;
        let expected = property.get("type").and_then(Value::as_str)?;
        (!matches_type(expected, actual))
            .then(|| format!("field '{key}' is not of type {expected}"))
    })
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}
