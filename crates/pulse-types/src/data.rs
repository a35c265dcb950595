//! Merge and path-lookup helpers over event data trees.
//!
//! Event data is a `serde_json::Value` whose top level is conventionally an
//! object. The merge law here is what the rules engine's `add` and `mod`
//! consequences are built on: recursive on nested maps, lists replaced
//! wholesale, scalars governed by the overwrite flag.

use serde_json::Value;

/// Merges `overlay` into `target`.
///
/// Nested objects merge recursively. Every other value kind (scalars and
/// lists alike) is taken as a unit: kept from `target` when `overwrite` is
/// false, taken from `overlay` when true. Keys present only in `overlay`
/// are always added.
pub fn merge(target: &mut Value, overlay: &Value, overwrite: bool) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) => {
                        if existing.is_object() && overlay_value.is_object() {
                            merge(existing, overlay_value, overwrite);
                        } else if overwrite {
                            *existing = overlay_value.clone();
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (target, overlay) => {
            if overwrite {
                *target = overlay.clone();
            }
        }
    }
}

/// Looks up a dot-separated path in a data tree.
///
/// Each segment indexes into an object; any non-object along the way ends
/// the lookup. Returns `None` when the path is absent.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Renders a value as the string form used by the template renderer.
///
/// Strings render without quotes; null renders empty; everything else uses
/// its compact JSON form.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
