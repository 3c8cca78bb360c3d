/// Reconciliation protocol
///
/// Replays the pending-mutation queue against the server once the client is
/// back online.
///
/// Protocol flow:
/// 1. Read every pending snapshot in FIFO key order
/// 2. Push it: tombstone -> delete, version 0 -> create, otherwise update
/// 3. Apply the server's answer to the local cache
/// 4. Remove the snapshot from the queue, unless a newer one replaced it
///
/// A stale update becomes a conflict pair for the resolver. A transient
/// failure stops the drain so the rest of the queue keeps its order.
use crate::api::ItemApi;
use crate::error::{ApiError, SyncResult};
use crate::model::{ConflictPair, OperationType, PendingMutation};
use crate::store::ItemStore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sync statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncStats {
    pub pushed_operations: usize,
    pub failed_operations: usize,
    /// Left in the queue after a transient failure.
    pub deferred_operations: usize,
    pub conflicts: Vec<ConflictPair>,
}

impl SyncStats {
    pub fn is_clean(&self) -> bool {
        self.failed_operations == 0 && self.deferred_operations == 0 && self.conflicts.is_empty()
    }
}

enum Replay {
    Pushed,
    Conflict(ConflictPair),
    Failed,
    Deferred,
}

/// Drains the pending queue. One run at a time.
pub struct SyncCoordinator {
    api: Arc<dyn ItemApi>,
    store: ItemStore,
    running: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(api: Arc<dyn ItemApi>, store: ItemStore) -> Self {
        Self {
            api,
            store,
            running: Mutex::new(()),
        }
    }

    /// Push every pending mutation and collect the conflicts the server reports.
    pub async fn reconcile(&self, token: &str) -> SyncResult<SyncStats> {
        let _guard = self.running.lock().await;
        let mut stats = SyncStats::default();

        let pending = self.store.pending_mutations().await?;
        if pending.is_empty() {
            return Ok(stats);
        }
        tracing::info!(pending = pending.len(), "Reconciling pending mutations");

        let total = pending.len();
        for (position, mutation) in pending.into_iter().enumerate() {
            match self.replay(token, &mutation).await? {
                Replay::Pushed => stats.pushed_operations += 1,
                Replay::Conflict(pair) => stats.conflicts.push(pair),
                Replay::Failed => stats.failed_operations += 1,
                Replay::Deferred => {
                    stats.deferred_operations = total - position;
                    break;
                }
            }
            self.store.remove_pending(&mutation).await?;
        }

        tracing::info!(
            pushed = stats.pushed_operations,
            failed = stats.failed_operations,
            deferred = stats.deferred_operations,
            conflicts = stats.conflicts.len(),
            "Reconcile finished"
        );
        Ok(stats)
    }

    async fn replay(&self, token: &str, mutation: &PendingMutation) -> SyncResult<Replay> {
        let item = &mutation.item;
        let Some(id) = item.id() else {
            tracing::warn!(key = %mutation.key, "Dropping pending snapshot without id");
            return Ok(Replay::Failed);
        };
        let operation = mutation.operation();

        let result = match operation {
            OperationType::Delete => match self.api.delete(token, id).await {
                Ok(_) | Err(ApiError::NotFound) => {
                    self.store.remove_item(id).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            OperationType::Create => match self.api.create(token, item).await {
                Ok(saved) => {
                    if saved.id().is_some_and(|server_id| server_id != id) {
                        tracing::debug!(client_id = id, server_id = ?saved.id, "Server assigned a new id");
                        self.store.remove_item(id).await?;
                    }
                    self.store.put_item(&saved).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            OperationType::Update => match self.api.update(token, item).await {
                Ok(saved) => {
                    self.store.put_item(&saved).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                tracing::debug!(item_id = id, operation = operation.as_str(), "Pushed pending mutation");
                Ok(Replay::Pushed)
            }
            Err(ApiError::Conflict(server)) => {
                tracing::info!(
                    item_id = id,
                    local_version = item.version,
                    server_version = server.version,
                    "Pending update conflicts with server"
                );
                self.store.put_item(&server).await?;
                Ok(Replay::Conflict(ConflictPair::new(item.clone(), *server)))
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, item_id = id, "Server unreachable, deferring the rest of the queue");
                Ok(Replay::Deferred)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    item_id = id,
                    operation = operation.as_str(),
                    "Server rejected pending mutation, dropping it"
                );
                self.discard(token, id, operation).await?;
                Ok(Replay::Failed)
            }
        }
    }

    /// Bring the cached entry back in line with the server after a rejection.
    async fn discard(&self, token: &str, id: &str, operation: OperationType) -> SyncResult<()> {
        match operation {
            // Never reached the server.
            OperationType::Create => self.store.remove_item(id).await,
            OperationType::Update => match self.api.get(token, id).await {
                Ok(server) => self.store.put_item(&server).await,
                Err(ApiError::NotFound) => self.store.remove_item(id).await,
                Err(e) => {
                    tracing::warn!(error = %e, item_id = id, "Could not refresh rejected item");
                    Ok(())
                }
            },
            OperationType::Delete => Ok(()),
        }
    }
}
