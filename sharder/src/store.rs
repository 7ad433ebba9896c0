//! Process-wide key/value store owned by the master.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::bridge::protocol::{ErrorPayload, GetReply, SetReply};

/// String keys to arbitrary JSON values. No TTL, no persistence.
#[derive(Debug, Default)]
pub struct SharedStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Shared store mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Returns whether a previous value was replaced.
    pub fn set(&self, key: impl Into<String>, value: Value) -> bool {
        self.lock().insert(key.into(), value).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// GET handler: `{key}` → `{found, value}`.
    pub fn handle_get(&self, d: &Value) -> Result<GetReply, ErrorPayload> {
        let key = required_key(d)?;
        let value = self.get(key);
        Ok(GetReply {
            found: value.is_some(),
            value: value.unwrap_or(Value::Null),
        })
    }

    /// SET handler: `{key, value}` → `{replaced}`. A missing value stores null.
    pub fn handle_set(&self, d: &Value) -> Result<SetReply, ErrorPayload> {
        let key = required_key(d)?;
        let value = d.get("value").cloned().unwrap_or(Value::Null);
        Ok(SetReply {
            replaced: self.set(key, value),
        })
    }
}

fn required_key(d: &Value) -> Result<&str, ErrorPayload> {
    d.get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorPayload::validation("key is a required string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get() {
        let store = SharedStore::new();
        assert!(!store.set("config", json!({"prefix": "!"})));
        assert_eq!(store.get("config"), Some(json!({"prefix": "!"})));
        assert!(store.set("config", json!(null)));
        assert_eq!(store.get("config"), Some(json!(null)));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let store = SharedStore::new();
        let reply = store.handle_get(&json!({"key": "absent"})).unwrap();
        assert!(!reply.found);
        assert_eq!(reply.value, Value::Null);
    }

    #[test]
    fn handlers_reject_non_string_keys() {
        let store = SharedStore::new();
        for d in [json!({}), json!({"key": 5}), json!(null), json!({"key": null})] {
            let err = store.handle_get(&d).unwrap_err();
            assert_eq!(err.name, "ValidationError");
            assert!(store.handle_set(&d).is_err());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn set_reports_replacement() {
        let store = SharedStore::new();
        let first = store.handle_set(&json!({"key": "k", "value": 1})).unwrap();
        let second = store.handle_set(&json!({"key": "k", "value": 2})).unwrap();
        assert!(!first.replaced);
        assert!(second.replaced);
        assert_eq!(store.keys(), vec!["k".to_string()]);
        assert_eq!(store.handle_get(&json!({"key": "k"})).unwrap().value, json!(2));
    }
}
