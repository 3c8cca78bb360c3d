//! In-memory key-value store for tests and throwaway sessions.

use crate::error::SyncResult;
use crate::store::KeyValueStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Values are kept next to the sequence number of their first insertion.
pub struct MemoryStore {
    entries: DashMap<String, (u64, String)>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().1.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entries
            .entry(key.to_string())
            .and_modify(|entry| entry.1 = value.to_string())
            .or_insert_with(|| (self.next_seq.fetch_add(1, Ordering::SeqCst), value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> SyncResult<Vec<String>> {
        let mut keys: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().0, entry.key().clone()))
            .collect();
        keys.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    async fn clear(&self) -> SyncResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keys_follow_first_insertion() {
        let store = MemoryStore::new();
        store.set("b", "1").await.unwrap();
        store.set("a", "2").await.unwrap();
        store.set("c", "3").await.unwrap();
        store.set("b", "4").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["b", "a", "c"]);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_remove_and_reinsert_moves_to_back() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();
        store.remove("a").await.unwrap();
        store.remove("missing").await.unwrap();
        store.set("a", "3").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["b", "a"]);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
