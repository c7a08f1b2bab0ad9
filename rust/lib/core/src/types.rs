use chrono::SecondsFormat;

/// Generate a new random ID (UUIDv4, no dashes).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "")
}

/// Current time as an RFC 3339 string in UTC with fixed microsecond
/// precision, so that timestamps sort lexicographically.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Deep-merge a JSON patch into a base value.
///
/// For each key in `patch`:
/// - `null` removes the key from `base`.
/// - An object is merged recursively into the existing value (a non-object
///   existing value is replaced by an empty object first).
/// - Anything else overwrites the key.
///
/// This follows RFC 7386 (JSON Merge Patch) semantics. Keys present in
/// `base` but absent from `patch` are never dropped.
pub fn merge_patch(base: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch_obj) = patch.as_object() else {
        *base = patch.clone();
        return;
    };
    if !base.is_object() {
        *base = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(base_obj) = base.as_object_mut() {
        for (key, value) in patch_obj {
            if value.is_null() {
                base_obj.remove(key);
            } else if value.is_object() {
                let entry = base_obj
                    .entry(key.clone())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
                merge_patch(entry, value);
            } else {
                base_obj.insert(key.clone(), value.clone());
            }
        }
    }
}
