//! Cache fingerprinting.
//!
//! The fingerprint covers everything that should invalidate a cached panel
//! snapshot when changed: the panel schema, the resolved values of the
//! variables its queries depend on, the force-load flag, and the
//! dashboard/folder identity. Cosmetic fields that do not affect query
//! results sit on a deny-list and are stripped before hashing, so moving a
//! panel or bumping a dashboard version keeps the cache warm.

use crate::types::VariableValue;
use serde_json::{Map, Value};

/// Schema fields ignored by the fingerprint: layout/position, version
/// counters, and display-only markdown/HTML content.
const COSMETIC_FIELDS: &[&str] = &[
    "layout",
    "version",
    "htmlContent",
    "markdownContent",
    "description",
];

/// Compute a panel cache fingerprint.
pub fn panel_fingerprint(
    schema: &Value,
    variables: &[(String, VariableValue)],
    force_load: bool,
    folder_id: &str,
    dashboard_id: &str,
) -> String {
    let mut stripped = schema.clone();
    strip_cosmetic_fields(&mut stripped);

    let variables_json: Value = variables
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                serde_json::to_value(value).unwrap_or(Value::Null),
            )
        })
        .collect::<Map<String, Value>>()
        .into();

    let payload = Value::Object(Map::from_iter([
        ("schema".to_string(), stripped),
        ("variables".to_string(), variables_json),
        ("forceLoad".to_string(), Value::Bool(force_load)),
        ("folderId".to_string(), Value::String(folder_id.to_string())),
        (
            "dashboardId".to_string(),
            Value::String(dashboard_id.to_string()),
        ),
    ]));

    let canonical = canonicalize(&payload).to_string();
    hex::encode(blake3::hash(canonical.as_bytes()).as_bytes())
}

/// Remove deny-listed fields recursively.
pub fn strip_cosmetic_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for field in COSMETIC_FIELDS {
                map.remove(*field);
            }
            for nested in map.values_mut() {
                strip_cosmetic_fields(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_cosmetic_fields(item);
            }
        }
        _ => {}
    }
}

/// Rebuild a value with object keys sorted, so hashing is independent of
/// insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            let mut sorted = Map::new();
            for (key, nested) in entries {
                sorted.insert(key.clone(), canonicalize(nested));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
