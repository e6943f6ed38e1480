use serde_json::Value;

/// Validation facets the upstream rejects. Stripped everywhere; their values
/// are summarized into the root description so the model still sees them.
const VALIDATION_FACETS: &[&str] = &[
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "minProperties",
    "maxProperties",
    "pattern",
    "format",
    "multipleOf",
];

/// Keywords removed silently, with no trace in the description.
const SILENT_KEYWORDS: &[&str] = &[
    "$schema",
    "uniqueItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

/// Strip JSON Schema keywords the upstream's schema validator rejects.
///
/// Destructive: callers needing the original must pass a deep copy. The
/// operation is a fixed point, so re-cleaning an already cleaned schema
/// changes nothing.
pub fn clean_json_schema(schema: &mut Value) {
    let mut stripped: Vec<String> = Vec::new();
    let mut no_additional = false;

    clean_node(schema, &mut stripped, &mut no_additional);

    if stripped.is_empty() && !no_additional {
        return;
    }

    let mut notes = stripped;
    if no_additional {
        notes.push("no additional properties".to_string());
    }
    let summary = format!("({})", notes.join(", "));

    if let Value::Object(root) = schema {
        let description = match root.get("description").and_then(|d| d.as_str()) {
            Some(existing) if !existing.is_empty() => format!("{existing} {summary}"),
            _ => summary,
        };
        root.insert("description".to_string(), Value::String(description));
    }
}

/// Keys whose values hold nested schemas keyed by arbitrary names, which
/// must not themselves be treated as schema nodes.
const NAMED_SUBSCHEMA_KEYS: &[&str] = &["properties", "definitions", "$defs"];

/// Keys whose value is a schema, or a list of schemas.
const SUBSCHEMA_KEYS: &[&str] = &["items", "anyOf", "oneOf", "allOf", "not"];

fn clean_node(node: &mut Value, stripped: &mut Vec<String>, no_additional: &mut bool) {
    let Value::Object(obj) = node else { return };

    for keyword in SILENT_KEYWORDS {
        obj.remove(*keyword);
    }

    if let Some(additional) = obj.remove("additionalProperties")
        && additional == Value::Bool(false)
    {
        *no_additional = true;
    }

    for facet in VALIDATION_FACETS {
        if let Some(value) = obj.remove(*facet) {
            stripped.push(format!("{facet}: {}", render_facet_value(&value)));
        }
    }

    // required may only name properties that survived
    if let Some(Value::Array(required)) = obj.get("required") {
        let keys: Vec<String> = required
            .iter()
            .filter_map(|r| r.as_str().map(String::from))
            .collect();
        let valid: Vec<Value> = match obj.get("properties").and_then(|p| p.as_object()) {
            Some(props) => keys
                .iter()
                .filter(|k| props.contains_key(*k))
                .map(|k| Value::String(k.clone()))
                .collect(),
            None => Vec::new(),
        };
        if valid.is_empty() {
            obj.remove("required");
        } else {
            obj.insert("required".to_string(), Value::Array(valid));
        }
    }

    // Recurse only through known schema-bearing keys: the values under
    // `properties` are schemas, but the map itself is keyed by arbitrary
    // property names that may collide with facet keywords.
    for key in NAMED_SUBSCHEMA_KEYS {
        if let Some(Value::Object(named)) = obj.get_mut(*key) {
            for (_, subschema) in named.iter_mut() {
                clean_node(subschema, stripped, no_additional);
            }
        }
    }

    for key in SUBSCHEMA_KEYS {
        match obj.get_mut(*key) {
            Some(Value::Array(list)) => {
                for subschema in list.iter_mut() {
                    clean_node(subschema, stripped, no_additional);
                }
            }
            Some(subschema @ Value::Object(_)) => {
                clean_node(subschema, stripped, no_additional);
            }
            _ => {}
        }
    }
}

fn render_facet_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
