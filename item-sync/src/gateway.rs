//! Create, update and delete with offline fallback.
//!
//! When the server is reachable a mutation is applied there first and the
//! confirmed item is cached. Otherwise the mutation is applied to the cache
//! and queued for the next reconcile.

use crate::api::ItemApi;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::model::{ConflictPair, Item, UNCONFIRMED_VERSION};
use crate::store::ItemStore;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The server accepted the write; the item carries its confirmed version.
    Confirmed(Item),
    /// The write is cached locally and waits in the pending queue.
    Queued(Item),
    /// The server rejected a stale version.
    Conflict(ConflictPair),
}

impl SaveOutcome {
    pub fn item(&self) -> &Item {
        match self {
            SaveOutcome::Confirmed(item) | SaveOutcome::Queued(item) => item,
            SaveOutcome::Conflict(pair) => &pair.server,
        }
    }

    pub fn has_conflicts(&self) -> bool {
        matches!(self, SaveOutcome::Conflict(_))
    }
}

/// Result of a delete. Carries the removed item when one was known.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Confirmed(Option<Item>),
    Queued(Option<Item>),
}

impl DeleteOutcome {
    pub fn item(&self) -> Option<&Item> {
        match self {
            DeleteOutcome::Confirmed(item) | DeleteOutcome::Queued(item) => item.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct MutationGateway {
    api: Arc<dyn ItemApi>,
    store: ItemStore,
}

impl MutationGateway {
    pub fn new(api: Arc<dyn ItemApi>, store: ItemStore) -> Self {
        Self { api, store }
    }

    async fn confirm(&self, item: Item) -> SyncResult<SaveOutcome> {
        self.store.put_item(&item).await?;
        if let Some(id) = item.id() {
            self.store.clear_pending(id).await?;
        }
        Ok(SaveOutcome::Confirmed(item))
    }

    pub async fn create(&self, token: &str, item: Item, connected: bool) -> SyncResult<SaveOutcome> {
        if connected {
            match self.api.create(token, &item).await {
                Ok(saved) if saved.id().is_some() => return self.confirm(saved).await,
                Ok(_) => tracing::warn!("Server returned a created item without id, queuing locally"),
                Err(e) => tracing::warn!(error = %e, "Create failed, queuing locally"),
            }
        }
        self.queue_create(item).await
    }

    async fn queue_create(&self, mut item: Item) -> SyncResult<SaveOutcome> {
        if item.id.is_none() {
            item.id = Some(Uuid::new_v4().to_string());
        }
        item.version = UNCONFIRMED_VERSION;
        self.store.put_item(&item).await?;
        self.store.queue_pending(&item).await?;
        tracing::info!(item_id = ?item.id, "Create queued for sync");
        Ok(SaveOutcome::Queued(item))
    }

    pub async fn update(&self, token: &str, item: Item, connected: bool) -> SyncResult<SaveOutcome> {
        let Some(id) = item.id().map(str::to_owned) else {
            return Err(SyncError::InvalidOperation("cannot update an item without id".to_string()));
        };

        if connected {
            match self.api.update(token, &item).await {
                Ok(saved) => return self.confirm(saved).await,
                Err(ApiError::Conflict(server)) => {
                    tracing::info!(
                        item_id = %id,
                        local_version = item.version,
                        server_version = server.version,
                        "Update rejected as stale"
                    );
                    self.store.put_item(&server).await?;
                    return Ok(SaveOutcome::Conflict(ConflictPair::new(item, *server)));
                }
                Err(e) => tracing::warn!(error = %e, item_id = %id, "Update failed, queuing locally"),
            }
        }
        self.queue_update(item).await
    }

    /// Cache and queue the edit as is; the version stays so the replay is
    /// still checked against the server's revision.
    async fn queue_update(&self, item: Item) -> SyncResult<SaveOutcome> {
        self.store.put_item(&item).await?;
        self.store.queue_pending(&item).await?;
        tracing::info!(item_id = ?item.id, version = item.version, "Update queued for sync");
        Ok(SaveOutcome::Queued(item))
    }

    pub async fn delete(&self, token: &str, id: &str, connected: bool) -> SyncResult<DeleteOutcome> {
        if connected {
            match self.api.delete(token, id).await {
                Ok(echoed) => {
                    let cached = self.store.get_item(id).await?;
                    self.store.remove_item(id).await?;
                    self.store.clear_pending(id).await?;
                    return Ok(DeleteOutcome::Confirmed(echoed.or(cached)));
                }
                Err(ApiError::NotFound) => {
                    let cached = self.store.get_item(id).await?;
                    self.store.remove_item(id).await?;
                    self.store.clear_pending(id).await?;
                    return Ok(DeleteOutcome::Confirmed(cached));
                }
                Err(e) => tracing::warn!(error = %e, item_id = id, "Delete failed, queuing tombstone"),
            }
        }
        self.queue_delete(id).await
    }

    async fn queue_delete(&self, id: &str) -> SyncResult<DeleteOutcome> {
        let known = match self.store.get_item(id).await? {
            Some(item) => Some(item),
            None => self.store.pending_item(id).await?,
        };

        self.store.remove_item(id).await?;
        let tombstone = known.clone().unwrap_or_else(|| Item::tombstone(id));
        self.store.queue_tombstone(&tombstone).await?;
        tracing::info!(item_id = id, "Delete queued for sync");
        Ok(DeleteOutcome::Queued(known))
    }
}
