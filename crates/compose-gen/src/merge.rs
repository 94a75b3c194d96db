//! Deep merge for YAML values used by service overrides.

use serde_yaml::Value;

/// Merge `overlay` onto `base`, recursively for mappings.
///
/// Scalars and sequences from the overlay replace the base value wholesale;
/// callers that want to append to an array must supply the full array.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}
