//! Memory key-value store
//!
//! Will be destroyed on system shutdown

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::KeyValueStore;
use super::StoreError;

/// An in-memory key-value store
#[derive(Debug, Default)]
pub struct Memory {
    /// All values in storage
    values: Mutex<BTreeMap<String, String>>,
}

impl Memory {
    /// Create a new empty Memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KeyValueStore for Memory {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value.to_string());

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);

        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .values()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
