//! Shared mutable context threaded through every step handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A caller-owned record visible to every step of a job.
///
/// Steps use it to pass values forward: step N inserts, step N+1 reads
/// (for example a generated asset URL). Clones share the same underlying
/// map. Execution within a scheduler is serial, so a write from one step
/// is visible to the next without further coordination; steps must not
/// mutate the context after signalling their completer.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn insert<T: Serialize>(&self, key: impl Into<String>, value: T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.lock().unwrap().insert(key.into(), value);
    }

    /// Fetch and deserialize the value under `key`, if present and of
    /// the requested shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock().unwrap();
        values
            .get(key)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Raw JSON value under `key`.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip() {
        let ctx = SharedContext::new();
        ctx.insert("asset_url", "http://127.0.0.1:8080/app.pkg");
        let url: Option<String> = ctx.get("asset_url");
        assert_eq!(url.as_deref(), Some("http://127.0.0.1:8080/app.pkg"));
    }

    #[test]
    fn clones_observe_writes() {
        let ctx = SharedContext::new();
        let alias = ctx.clone();
        ctx.insert("port", 8080u16);
        assert_eq!(alias.get::<u16>("port"), Some(8080));
    }

    #[test]
    fn missing_or_mistyped_keys_are_none() {
        let ctx = SharedContext::new();
        assert_eq!(ctx.get::<String>("absent"), None);
        ctx.insert("count", 3);
        assert_eq!(ctx.get::<Vec<String>>("count"), None);
        assert!(ctx.contains("count"));
        assert!(ctx.remove("count").is_some());
        assert!(!ctx.contains("count"));
    }
}
