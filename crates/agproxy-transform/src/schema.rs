//! Tool JSON-schema cleaning.
//!
//! The upstream's proto-style schema accepts a narrow subset of JSON
//! Schema; several standard keywords trigger a hard 400. This pass strips
//! them, folds validation keywords into the description as a human note,
//! normalizes `type: [T, "null"]` into `nullable`, and guarantees every
//! emitted schema object carries a `type`. Cleaning is idempotent.

use serde_json::{Map, Value as JsonValue};

const UNSUPPORTED_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "title",
    "example",
    "examples",
    "readOnly",
    "writeOnly",
    "default",
    "exclusiveMaximum",
    "exclusiveMinimum",
    "oneOf",
    "anyOf",
    "allOf",
    "const",
    "additionalItems",
    "contains",
    "patternProperties",
    "dependencies",
    "propertyNames",
    "if",
    "then",
    "else",
    "contentEncoding",
    "contentMediaType",
    "additionalProperties",
];

const VALIDATION_KEYS: &[&str] = &[
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
];

pub fn clean_schema(schema: &JsonValue) -> JsonValue {
    match schema {
        JsonValue::Object(map) => clean_object(map),
        other => other.clone(),
    }
}

fn clean_object(map: &Map<String, JsonValue>) -> JsonValue {
    let mut notes: Vec<String> = Vec::new();
    for key in VALIDATION_KEYS {
        if let Some(value) = map.get(*key) {
            notes.push(format!("{key}: {value}"));
        }
    }

    let mut cleaned = Map::new();
    for (key, value) in map {
        if UNSUPPORTED_KEYS.contains(&key.as_str())
            || VALIDATION_KEYS.contains(&key.as_str())
        {
            continue;
        }

        match key.as_str() {
            "type" => match value {
                // type: ["string", "null"] → type: "string", nullable: true
                JsonValue::Array(types) => {
                    let has_null = types
                        .iter()
                        .any(|t| t.as_str().is_some_and(|t| t.trim().eq_ignore_ascii_case("null")));
                    let first = types
                        .iter()
                        .filter_map(|t| t.as_str())
                        .map(str::trim)
                        .find(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null"));
                    cleaned.insert(
                        "type".to_string(),
                        JsonValue::String(first.unwrap_or("string").to_string()),
                    );
                    if has_null {
                        cleaned.insert("nullable".to_string(), JsonValue::Bool(true));
                    }
                }
                other => {
                    cleaned.insert("type".to_string(), other.clone());
                }
            },
            "description" if !notes.is_empty() => {
                let text = value.as_str().unwrap_or_default();
                cleaned.insert(
                    "description".to_string(),
                    JsonValue::String(format!("{text} ({})", notes.join(", "))),
                );
            }
            "properties" => {
                let props = match value {
                    JsonValue::Object(props) => props,
                    other => {
                        cleaned.insert(key.clone(), other.clone());
                        continue;
                    }
                };
                let mut cleaned_props = Map::new();
                for (name, prop) in props {
                    let mut cleaned_prop = clean_schema(prop);
                    // Nested objects must be complete schema objects.
                    if let JsonValue::Object(obj) = &mut cleaned_prop {
                        if obj.get("type").and_then(|t| t.as_str()) == Some("object")
                            && !obj.contains_key("properties")
                        {
                            obj.insert("properties".to_string(), JsonValue::Object(Map::new()));
                        }
                    } else if cleaned_prop.as_str() == Some("object") {
                        cleaned_prop = serde_json::json!({"type": "object", "properties": {}});
                    }
                    cleaned_props.insert(name.clone(), cleaned_prop);
                }
                cleaned.insert(key.clone(), JsonValue::Object(cleaned_props));
            }
            _ => {
                let value = match value {
                    JsonValue::Object(_) => clean_schema(value),
                    JsonValue::Array(items) => JsonValue::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                JsonValue::Object(_) => clean_schema(item),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                cleaned.insert(key.clone(), value);
            }
        }
    }

    if !notes.is_empty() && !cleaned.contains_key("description") {
        cleaned.insert(
            "description".to_string(),
            JsonValue::String(format!("Validation: {}", notes.join(", "))),
        );
    }

    if !cleaned.contains_key("type") && (!cleaned.is_empty() || !map.is_empty()) {
        cleaned.insert("type".to_string(), JsonValue::String("object".to_string()));
    }

    JsonValue::Object(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_unsupported_keys() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "oneOf": [{"type": "string"}],
            "properties": {
                "name": {"type": "string", "const": "x"}
            }
        });
        let cleaned = clean_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("oneOf").is_none());
        assert!(cleaned["properties"]["name"].get("const").is_none());
    }

    #[test]
    fn validation_keywords_move_to_description() {
        let schema = json!({
            "type": "string",
            "minLength": 3,
            "description": "a name"
        });
        let cleaned = clean_schema(&schema);
        assert!(cleaned.get("minLength").is_none());
        assert_eq!(cleaned["description"], "a name (minLength: 3)");

        let bare = json!({"type": "integer", "maximum": 10});
        let cleaned = clean_schema(&bare);
        assert_eq!(cleaned["description"], "Validation: maximum: 10");
    }

    #[test]
    fn nullable_type_arrays_normalize() {
        let schema = json!({"type": ["string", "null"]});
        let cleaned = clean_schema(&schema);
        assert_eq!(cleaned["type"], "string");
        assert_eq!(cleaned["nullable"], true);
    }

    #[test]
    fn object_without_properties_is_completed() {
        let schema = json!({
            "type": "object",
            "properties": {
                "nested": {"type": "object"}
            }
        });
        let cleaned = clean_schema(&schema);
        assert_eq!(cleaned["properties"]["nested"]["properties"], json!({}));
    }

    #[test]
    fn missing_type_defaults_to_object() {
        let schema = json!({"properties": {"a": {"type": "string"}}});
        let cleaned = clean_schema(&schema);
        assert_eq!(cleaned["type"], "object");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let schema = json!({
            "type": "object",
            "minItems": 1,
            "description": "list",
            "properties": {
                "tags": {"type": ["array", "null"], "items": {"type": "string", "maxLength": 5}},
                "inner": {"type": "object"}
            },
            "required": ["tags"],
            "$defs": {"x": {"type": "string"}}
        });
        let once = clean_schema(&schema);
        let twice = clean_schema(&once);
        assert_eq!(once, twice);
    }
}
