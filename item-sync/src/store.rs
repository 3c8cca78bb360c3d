//! Key-value persistence contract and the typed item layer on top of it.
//!
//! Keys are path-like strings:
//! - `items/{id}` for cached items
//! - `pending/items/{id}` for queued creates and updates
//! - `sync/items/{id}` for queued deletes (tombstones)
//! - `conflicts/items/{id}` for conflict pairs awaiting a resolution
//!
//! Enumeration order is first-insertion order; overwriting a key keeps its
//! position. Reconciliation relies on this order.

use crate::error::{SyncError, SyncResult};
use crate::model::{ConflictPair, Item, PendingMutation, ITEMS, TOMBSTONE_VERSION};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Asynchronous string key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Insert or overwrite. An overwritten key keeps its enumeration position.
    async fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> SyncResult<()>;

    /// All keys in first-insertion order.
    async fn keys(&self) -> SyncResult<Vec<String>>;

    async fn clear(&self) -> SyncResult<()>;
}

/// Key namespaces used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Entity,
    Pending,
    Tombstone,
    Conflict,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::Entity => "",
            Namespace::Pending => "pending/",
            Namespace::Tombstone => "sync/",
            Namespace::Conflict => "conflicts/",
        }
    }

    pub fn key(self, collection: &str, id: &str) -> String {
        format!("{}{}/{}", self.prefix(), collection, id)
    }

    /// Split a key into namespace, collection and id.
    pub fn parse(key: &str) -> Option<(Namespace, &str, &str)> {
        let (namespace, rest) = if let Some(rest) = key.strip_prefix("pending/") {
            (Namespace::Pending, rest)
        } else if let Some(rest) = key.strip_prefix("sync/") {
            (Namespace::Tombstone, rest)
        } else if let Some(rest) = key.strip_prefix("conflicts/") {
            (Namespace::Conflict, rest)
        } else {
            (Namespace::Entity, key)
        };
        let (collection, id) = rest.split_once('/')?;
        if collection.is_empty() || id.is_empty() {
            return None;
        }
        Some((namespace, collection, id))
    }
}

/// Item-level view of a [`KeyValueStore`] for the `items` collection.
#[derive(Clone)]
pub struct ItemStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ItemStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn raw(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        match self.kv.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let json = serde_json::to_string(value)?;
        self.kv.set(key, &json).await
    }

    fn require_id(item: &Item) -> SyncResult<&str> {
        item.id()
            .ok_or_else(|| SyncError::InvalidOperation("item has no id".to_string()))
    }

    pub async fn get_item(&self, id: &str) -> SyncResult<Option<Item>> {
        self.read(&Namespace::Entity.key(ITEMS, id)).await
    }

    pub async fn put_item(&self, item: &Item) -> SyncResult<()> {
        let id = Self::require_id(item)?;
        self.write(&Namespace::Entity.key(ITEMS, id), item).await?;
        tracing::debug!(item_id = id, version = item.version, "Cached item");
        Ok(())
    }

    pub async fn remove_item(&self, id: &str) -> SyncResult<()> {
        self.kv.remove(&Namespace::Entity.key(ITEMS, id)).await
    }

    /// Cached items in key order. Tombstones never live here, but a stray one
    /// is filtered out regardless.
    pub async fn items(&self) -> SyncResult<Vec<Item>> {
        let mut items = Vec::new();
        for key in self.kv.keys().await? {
            if !matches!(Namespace::parse(&key), Some((Namespace::Entity, ITEMS, _))) {
                continue;
            }
            if let Some(item) = self.read::<Item>(&key).await? {
                if !item.is_tombstone() {
                    items.push(item);
                }
            }
        }
        Ok(items)
    }

    /// Queue a create or update snapshot, replacing any earlier one for the id.
    pub async fn queue_pending(&self, item: &Item) -> SyncResult<()> {
        let id = Self::require_id(item)?;
        self.kv.remove(&Namespace::Tombstone.key(ITEMS, id)).await?;
        self.write(&Namespace::Pending.key(ITEMS, id), item).await?;
        tracing::debug!(item_id = id, version = item.version, "Queued pending mutation");
        Ok(())
    }

    /// Queue a delete. The snapshot is stored with the tombstone version.
    pub async fn queue_tombstone(&self, item: &Item) -> SyncResult<()> {
        let id = Self::require_id(item)?;
        let mut tombstone = item.clone();
        tombstone.version = TOMBSTONE_VERSION;
        self.kv.remove(&Namespace::Pending.key(ITEMS, id)).await?;
        self.write(&Namespace::Tombstone.key(ITEMS, id), &tombstone).await?;
        tracing::debug!(item_id = id, "Queued delete tombstone");
        Ok(())
    }

    pub async fn pending_item(&self, id: &str) -> SyncResult<Option<Item>> {
        if let Some(item) = self.read::<Item>(&Namespace::Pending.key(ITEMS, id)).await? {
            return Ok(Some(item));
        }
        self.read(&Namespace::Tombstone.key(ITEMS, id)).await
    }

    /// Every queued mutation in FIFO order.
    pub async fn pending_mutations(&self) -> SyncResult<Vec<PendingMutation>> {
        let mut pending = Vec::new();
        for key in self.kv.keys().await? {
            match Namespace::parse(&key) {
                Some((Namespace::Pending | Namespace::Tombstone, ITEMS, _)) => {}
                _ => continue,
            }
            if let Some(item) = self.read::<Item>(&key).await? {
                pending.push(PendingMutation { key, item });
            }
        }
        Ok(pending)
    }

    /// Whether a delete is queued for the id.
    pub async fn has_tombstone(&self, id: &str) -> SyncResult<bool> {
        Ok(self.kv.get(&Namespace::Tombstone.key(ITEMS, id)).await?.is_some())
    }

    /// Remove a replayed snapshot, unless a newer one was queued under the
    /// same key in the meantime. Returns whether the entry was removed.
    pub async fn remove_pending(&self, mutation: &PendingMutation) -> SyncResult<bool> {
        let current: Option<Item> = self.read(&mutation.key).await?;
        match current {
            Some(item) if item != mutation.item => {
                tracing::debug!(key = %mutation.key, "Keeping snapshot queued during replay");
                Ok(false)
            }
            _ => {
                self.kv.remove(&mutation.key).await?;
                Ok(true)
            }
        }
    }

    /// Drop both the pending snapshot and the tombstone for an id.
    pub async fn clear_pending(&self, id: &str) -> SyncResult<()> {
        self.kv.remove(&Namespace::Pending.key(ITEMS, id)).await?;
        self.kv.remove(&Namespace::Tombstone.key(ITEMS, id)).await
    }

    /// Keep a conflict pair until it is resolved, replacing any earlier pair
    /// for the same id. Pairs without an id cannot be keyed and stay in memory.
    pub async fn save_conflict(&self, pair: &ConflictPair) -> SyncResult<()> {
        let Some(id) = pair.id() else {
            tracing::warn!("Not persisting conflict pair without id");
            return Ok(());
        };
        self.write(&Namespace::Conflict.key(ITEMS, id), pair).await
    }

    pub async fn remove_conflict(&self, id: &str) -> SyncResult<()> {
        self.kv.remove(&Namespace::Conflict.key(ITEMS, id)).await
    }

    /// Unresolved conflict pairs in the order they were first recorded.
    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictPair>> {
        let mut pairs = Vec::new();
        for key in self.kv.keys().await? {
            if !matches!(Namespace::parse(&key), Some((Namespace::Conflict, ITEMS, _))) {
                continue;
            }
            if let Some(pair) = self.read::<ConflictPair>(&key).await? {
                pairs.push(pair);
            }
        }
        Ok(pairs)
    }

    pub async fn clear(&self) -> SyncResult<()> {
        self.kv.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::model::OperationType;

    fn store() -> ItemStore {
        ItemStore::new(Arc::new(MemoryStore::new()))
    }

    fn item(id: &str, model: &str, version: i64) -> Item {
        Item {
            id: Some(id.to_string()),
            model: model.to_string(),
            version,
            ..Item::default()
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(Namespace::Entity.key(ITEMS, "1"), "items/1");
        assert_eq!(Namespace::Pending.key(ITEMS, "1"), "pending/items/1");
        assert_eq!(Namespace::Tombstone.key(ITEMS, "1"), "sync/items/1");

        assert_eq!(
            Namespace::parse("pending/items/abc"),
            Some((Namespace::Pending, "items", "abc"))
        );
        assert_eq!(
            Namespace::parse("sync/items/abc"),
            Some((Namespace::Tombstone, "items", "abc"))
        );
        assert_eq!(
            Namespace::parse("conflicts/items/abc"),
            Some((Namespace::Conflict, "items", "abc"))
        );
        assert_eq!(Namespace::parse("items/abc"), Some((Namespace::Entity, "items", "abc")));
        assert_eq!(Namespace::parse("token"), None);
        assert_eq!(Namespace::parse("items/"), None);
    }

    #[tokio::test]
    async fn test_saving_same_item_twice_keeps_one_entry() {
        let store = store();
        let guitar = item("g1", "Telecaster", 1);

        store.put_item(&guitar).await.unwrap();
        store.put_item(&guitar).await.unwrap();

        let items = store.items().await.unwrap();
        assert_eq!(items, vec![guitar]);
    }

    #[tokio::test]
    async fn test_put_item_requires_id() {
        let store = store();
        let err = store.put_item(&Item::new("Jazzmaster")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_later_edit_overwrites_pending_snapshot_in_place() {
        let store = store();
        store.queue_pending(&item("a", "First", 0)).await.unwrap();
        store.queue_pending(&item("b", "Second", 2)).await.unwrap();
        store.queue_pending(&item("a", "First edited", 0)).await.unwrap();

        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].item.model, "First edited");
        assert_eq!(pending[1].item.id(), Some("b"));
    }

    #[tokio::test]
    async fn test_tombstone_replaces_pending_update() {
        let store = store();
        let guitar = item("a", "Mustang", 3);
        store.put_item(&guitar).await.unwrap();
        store.queue_pending(&guitar).await.unwrap();

        store.remove_item("a").await.unwrap();
        store.queue_tombstone(&guitar).await.unwrap();

        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "sync/items/a");
        assert_eq!(pending[0].operation(), OperationType::Delete);
        assert!(store.items().await.unwrap().is_empty());
        assert!(store.pending_item("a").await.unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_pending_entries_do_not_leak_into_items() {
        let store = store();
        store.queue_pending(&item("a", "Offline only", 0)).await.unwrap();
        store.raw().set("token", "\"secret\"").await.unwrap();

        assert!(store.items().await.unwrap().is_empty());

        store.clear_pending("a").await.unwrap();
        assert!(store.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_pending_keeps_newer_snapshot() {
        let store = store();
        store.queue_pending(&item("a", "Replayed", 2)).await.unwrap();
        let replayed = store.pending_mutations().await.unwrap().remove(0);

        store.queue_pending(&item("a", "Edited meanwhile", 2)).await.unwrap();
        assert!(!store.remove_pending(&replayed).await.unwrap());
        assert_eq!(store.pending_item("a").await.unwrap().unwrap().model, "Edited meanwhile");

        let current = store.pending_mutations().await.unwrap().remove(0);
        assert!(store.remove_pending(&current).await.unwrap());
        assert!(store.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_are_kept_per_id_in_first_recorded_order() {
        let store = store();
        let first = ConflictPair::new(item("a", "Mine", 1), item("a", "Theirs", 2));
        let second = ConflictPair::new(item("b", "Mine", 1), item("b", "Theirs", 4));
        store.save_conflict(&first).await.unwrap();
        store.save_conflict(&second).await.unwrap();

        let again = ConflictPair::new(item("a", "Mine", 2), item("a", "Theirs again", 3));
        store.save_conflict(&again).await.unwrap();

        assert_eq!(store.conflicts().await.unwrap(), vec![again, second]);
        assert!(store.items().await.unwrap().is_empty());
        assert!(store.pending_mutations().await.unwrap().is_empty());

        store.remove_conflict("a").await.unwrap();
        assert_eq!(store.conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_has_tombstone() {
        let store = store();
        store.queue_pending(&item("a", "Pending", 0)).await.unwrap();
        assert!(!store.has_tombstone("a").await.unwrap());

        store.queue_tombstone(&item("a", "Pending", 0)).await.unwrap();
        assert!(store.has_tombstone("a").await.unwrap());
    }
}
