//! Keyed storage behind the usage, premium and job tables.
//!
//! Every table goes through [`KeyValueStore`] so a real key-value store or
//! database can replace [`MemoryStore`] without touching quota, tier or job
//! logic. The in-memory store loses everything on restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use crate::error::StorageResult;

/// Minimal keyed storage contract.
///
/// Implementations only need per-operation atomicity; callers that perform
/// read-modify-write sequences serialize them with their own lock.
pub trait KeyValueStore<V>: Send + Sync
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> StorageResult<Option<V>>;

    fn set(&self, key: &str, value: V) -> StorageResult<()>;

    /// Remove a key, returning the previous value. Missing keys are not an error.
    fn delete(&self, key: &str) -> StorageResult<Option<V>>;

    fn keys(&self) -> StorageResult<Vec<String>>;

    fn values(&self) -> StorageResult<Vec<V>>;

    fn len(&self) -> StorageResult<usize> {
        Ok(self.keys()?.len())
    }
}

/// Process-memory store, one per table.
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        MemoryStore {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeyValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> StorageResult<Option<V>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: V) -> StorageResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<Option<V>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key))
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }

    fn values(&self) -> StorageResult<Vec<V>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.values().cloned().collect())
    }

    fn len(&self) -> StorageResult<usize> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.len())
    }
}
