use serde::Serialize;

/// Serialize a serde-backed enum into its wire name (e.g. `HEATING`), for use as a label value.
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}
