//! Late query results.
//!
//! Query fetches run as spawned tasks, so a fetch that misses its timeout
//! window still finishes. Its value lands here until the prefetch channel
//! takes it. Values that resolve in time never do.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Thread-safe map from query key to a result no render waited for.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    values: Arc<DashMap<String, Value>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}
