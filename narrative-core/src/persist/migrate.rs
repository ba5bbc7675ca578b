//! Versioned save envelopes and tolerant hydration.
//!
//! Every store is saved as `{"state": ..., "version": N}`. Loading never
//! fails: missing or corrupt entries yield the default state, and saves
//! from older versions are merged field by field over a fresh default so
//! that whatever still fits the current shape survives.

use super::debounce::DebouncedStorage;
use super::storage::StorageError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors from strict loading.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No saved state under '{0}'")]
    Missing(String),

    #[error("Invalid save format")]
    InvalidFormat,

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// A store that can be saved in a versioned envelope.
pub trait PersistedStore: Serialize + DeserializeOwned + Default {
    /// Current schema version. Saves without a version count as 0.
    const VERSION: u32;

    /// Rewrite an older raw state into the current layout before merging.
    fn upgrade_legacy(_state: &mut Value) {}

    /// Restore invariants that a saved state may no longer satisfy.
    fn after_load(&mut self) {}
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    state: &'a T,
    version: u32,
}

#[derive(Deserialize)]
struct Envelope {
    state: Option<Value>,
    #[serde(default)]
    version: u32,
}

/// Where a hydrated state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationSource {
    /// Nothing was saved.
    Missing,
    /// Decoded as-is.
    Current,
    /// Merged up from an older version.
    Migrated { from: u32 },
    /// Current version, but only part of it decoded.
    Recovered,
    /// The saved entry was unreadable.
    Corrupt,
}

/// A loaded state plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Hydrated<T> {
    pub state: T,
    pub source: HydrationSource,
}

impl<T: PersistedStore> Hydrated<T> {
    fn fresh(source: HydrationSource) -> Self {
        Self::loaded(T::default(), source)
    }

    fn loaded(mut state: T, source: HydrationSource) -> Self {
        state.after_load();
        Self { state, source }
    }
}

/// Serialize a store into its envelope.
pub fn encode<T: PersistedStore>(state: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EnvelopeRef {
        state,
        version: T::VERSION,
    })
}

/// Hydrate a store from a saved entry, degrading instead of failing.
pub fn decode<T: PersistedStore>(raw: Option<&str>) -> Hydrated<T> {
    let Some(raw) = raw else {
        return Hydrated::fresh(HydrationSource::Missing);
    };
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Saved state is not valid JSON, starting fresh");
            return Hydrated::fresh(HydrationSource::Corrupt);
        }
    };

    // Pre-envelope saves stored the bare state.
    let (mut state, version) = match parsed {
        Value::Object(mut object) if object.contains_key("state") => {
            let version = object
                .get("version")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            (object.remove("state").unwrap_or(Value::Null), version)
        }
        other => (other, 0),
    };
    if !state.is_object() {
        error!("Saved state is not an object, starting fresh");
        return Hydrated::fresh(HydrationSource::Corrupt);
    }

    if version < T::VERSION {
        T::upgrade_legacy(&mut state);
        info!(from = version, to = T::VERSION, "Migrating saved state");
        return Hydrated::loaded(
            merge_defensively(&state),
            HydrationSource::Migrated { from: version },
        );
    }

    if version > T::VERSION {
        warn!(
            found = version,
            known = T::VERSION,
            "Saved state is from a newer version"
        );
    }
    match serde_json::from_value(state.clone()) {
        Ok(decoded) => Hydrated::loaded(decoded, HydrationSource::Current),
        Err(e) => {
            warn!(error = %e, "Saved state did not decode cleanly, recovering what fits");
            Hydrated::loaded(merge_defensively(&state), HydrationSource::Recovered)
        }
    }
}

/// Decode an entry exactly, reporting any problem.
pub fn decode_strict<T: PersistedStore>(raw: &str) -> Result<T, PersistError> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    let state = envelope.state.ok_or(PersistError::InvalidFormat)?;
    if envelope.version != T::VERSION {
        return Err(PersistError::VersionMismatch {
            expected: T::VERSION,
            found: envelope.version,
        });
    }
    let mut decoded: T = serde_json::from_value(state)?;
    decoded.after_load();
    Ok(decoded)
}

/// Hydrate a store from the adapter.
pub fn load<T: PersistedStore>(storage: &DebouncedStorage, key: &str) -> Hydrated<T> {
    let hydrated = decode(storage.get(key).as_deref());
    debug!(key, source = ?hydrated.source, "Hydrated store");
    hydrated
}

/// Load a store, failing on anything but an exact current-version save.
pub fn load_strict<T: PersistedStore>(
    storage: &DebouncedStorage,
    key: &str,
) -> Result<T, PersistError> {
    let raw = storage
        .backend()
        .get(key)?
        .ok_or_else(|| PersistError::Missing(key.to_string()))?;
    decode_strict(&raw)
}

/// Overlay persisted fields onto a default state, keeping each field only if
/// the result still decodes.
fn merge_defensively<T: PersistedStore>(persisted: &Value) -> T {
    let mut merged = match serde_json::to_value(T::default()) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Default state does not serialize");
            return T::default();
        }
    };
    if let Value::Object(fields) = persisted {
        let entries: Vec<_> = fields.iter().collect();
        graft::<T>(&mut merged, "", &entries);
    }
    serde_json::from_value(merged).unwrap_or_else(|e| {
        error!(error = %e, "Merged state does not decode, starting fresh");
        T::default()
    })
}

/// Apply `entries` under `parent` as one batch. A batch that breaks decoding
/// is rolled back and split in half, so a few bad fields among many cost a
/// logarithmic number of decodes rather than one per field.
fn graft<T: DeserializeOwned>(root: &mut Value, parent: &str, entries: &[(&String, &Value)]) {
    if entries.is_empty() {
        return;
    }
    let Some(snapshot) = root.pointer(parent).cloned() else {
        return;
    };
    if let Some(slot) = root.pointer_mut(parent).and_then(Value::as_object_mut) {
        for (key, value) in entries {
            overlay(slot, key, value);
        }
    }
    if serde_json::from_value::<T>(root.clone()).is_ok() {
        return;
    }
    if let Some(slot) = root.pointer_mut(parent) {
        *slot = snapshot;
    }

    let [(key, value)] = entries else {
        let (left, right) = entries.split_at(entries.len() / 2);
        graft::<T>(root, parent, left);
        graft::<T>(root, parent, right);
        return;
    };

    // Objects present in the default are structs or maps: merge inside.
    let child = format!("{parent}/{}", key.replace('~', "~0").replace('/', "~1"));
    let default_is_object = matches!(root.pointer(&child), Some(Value::Object(_)));
    match value {
        Value::Object(nested) if default_is_object => {
            let nested: Vec<_> = nested.iter().collect();
            graft::<T>(root, &child, &nested);
        }
        _ => debug!(field = %child, "Dropping persisted field that no longer fits"),
    }
}

fn overlay(object: &mut Map<String, Value>, key: &str, value: &Value) {
    if let (Some(Value::Object(existing)), Value::Object(entries)) = (object.get_mut(key), value) {
        for (nested_key, nested_value) in entries {
            overlay(existing, nested_key, nested_value);
        }
        return;
    }
    object.insert(key.to_string(), value.clone());
}

/// Convert an array of `[key, value]` pairs into an object in place.
///
/// Anything else, including arrays whose items are not string-keyed pairs,
/// is left untouched.
pub fn pairs_to_object(value: &mut Value) {
    let Value::Array(items) = value else {
        return;
    };
    let is_pairs = items.iter().all(|item| {
        item.as_array()
            .is_some_and(|pair| pair.len() == 2 && pair[0].is_string())
    });
    if !is_pairs {
        return;
    }

    let mut object = Map::new();
    for item in items.drain(..) {
        if let Value::Array(mut pair) = item {
            let entry = pair.pop().unwrap_or(Value::Null);
            if let Some(Value::String(key)) = pair.pop() {
                object.insert(key, entry);
            }
        }
    }
    *value = Value::Object(object);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Profile {
        #[serde(default)]
        name: String,
        #[serde(default)]
        visits: u32,
        #[serde(default)]
        scores: BTreeMap<String, f64>,
        #[serde(default)]
        nested: Nested,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Nested {
        #[serde(default)]
        enabled: bool,
        #[serde(default)]
        label: String,
    }

    impl PersistedStore for Profile {
        const VERSION: u32 = 2;

        fn upgrade_legacy(state: &mut Value) {
            if let Some(scores) = state.get_mut("scores") {
                pairs_to_object(scores);
            }
        }
    }

    #[test]
    fn test_missing_and_corrupt_start_fresh() {
        let missing: Hydrated<Profile> = decode(None);
        assert_eq!(missing.source, HydrationSource::Missing);

        let corrupt: Hydrated<Profile> = decode(Some("{not json"));
        assert_eq!(corrupt.source, HydrationSource::Corrupt);
        assert_eq!(corrupt.state, Profile::default());

        let wrong_shape: Hydrated<Profile> = decode(Some(r#"{"state": 5, "version": 2}"#));
        assert_eq!(wrong_shape.source, HydrationSource::Corrupt);
    }

    #[test]
    fn test_current_version_round_trip() {
        let mut profile = Profile {
            name: "Maya".to_string(),
            visits: 3,
            ..Profile::default()
        };
        profile.scores.insert("math".to_string(), 91.0);

        let raw = encode(&profile).unwrap();
        let envelope: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["version"], 2);

        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Current);
        assert_eq!(hydrated.state, profile);
    }

    #[test]
    fn test_legacy_merge_keeps_what_fits() {
        let raw = json!({
            "state": {
                "name": "Maya",
                "visits": "lots",
                "scores": [["math", 91.0], ["art", 77.5]],
                "nested": {"enabled": true, "label": 12}
            }
        })
        .to_string();

        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Migrated { from: 0 });
        assert_eq!(hydrated.state.name, "Maya");
        assert_eq!(hydrated.state.visits, 0);
        assert_eq!(hydrated.state.scores.get("art"), Some(&77.5));
        assert!(hydrated.state.nested.enabled);
        assert_eq!(hydrated.state.nested.label, "");
    }

    #[test]
    fn test_bad_map_entries_are_dropped_individually() {
        let raw = json!({
            "state": {"scores": {"math": 91.0, "art": "B+"}},
            "version": 2
        })
        .to_string();

        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Recovered);
        assert_eq!(hydrated.state.scores.len(), 1);
        assert_eq!(hydrated.state.scores.get("math"), Some(&91.0));
    }

    #[test]
    fn test_one_bad_entry_among_many_is_isolated() {
        let mut scores: Map<String, Value> = (0..200)
            .map(|i| (format!("subject_{i:03}"), json!(i)))
            .collect();
        scores.insert("subject_117".to_string(), json!("incomplete"));
        let raw = json!({"state": {"name": "Maya", "scores": scores}}).to_string();

        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Migrated { from: 0 });
        assert_eq!(hydrated.state.name, "Maya");
        assert_eq!(hydrated.state.scores.len(), 199);
        assert!(!hydrated.state.scores.contains_key("subject_117"));
        assert_eq!(hydrated.state.scores.get("subject_199"), Some(&199.0));
    }

    #[test]
    fn test_newer_version_still_loads() {
        let raw = json!({"state": {"name": "Maya"}, "version": 9}).to_string();
        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Current);
        assert_eq!(hydrated.state.name, "Maya");
    }

    #[test]
    fn test_bare_state_is_treated_as_legacy() {
        let raw = json!({"name": "Maya"}).to_string();
        let hydrated: Hydrated<Profile> = decode(Some(&raw));
        assert_eq!(hydrated.source, HydrationSource::Migrated { from: 0 });
        assert_eq!(hydrated.state.name, "Maya");
    }

    #[test]
    fn test_strict_decode_reports_problems() {
        let old = json!({"state": {}, "version": 1}).to_string();
        assert!(matches!(
            decode_strict::<Profile>(&old),
            Err(PersistError::VersionMismatch {
                expected: 2,
                found: 1
            })
        ));

        let no_state = json!({"version": 2}).to_string();
        assert!(matches!(
            decode_strict::<Profile>(&no_state),
            Err(PersistError::InvalidFormat)
        ));

        assert!(matches!(
            decode_strict::<Profile>("nope"),
            Err(PersistError::Json(_))
        ));
    }

    #[test]
    fn test_pairs_to_object() {
        let mut pairs = json!([["a", 1], ["b", [1, 2]]]);
        pairs_to_object(&mut pairs);
        assert_eq!(pairs, json!({"a": 1, "b": [1, 2]}));

        let mut empty = json!([]);
        pairs_to_object(&mut empty);
        assert_eq!(empty, json!({}));

        let mut list = json!(["x", "y"]);
        pairs_to_object(&mut list);
        assert_eq!(list, json!(["x", "y"]));
    }
}
