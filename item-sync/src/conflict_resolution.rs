//! Conflict resolution support
//!
//! Conflicts surfaced by the gateway or the reconcile run wait here in FIFO
//! order. The user picks a side for the current pair and the choice is
//! re-submitted through the [`MutationGateway`] against the server's current
//! version.
//!
//! Key features:
//! - One pair presented at a time
//! - Accept local, accept server or a custom payload
//! - Field diffs for side-by-side display

use crate::error::{SyncError, SyncResult};
use crate::gateway::{MutationGateway, SaveOutcome};
use crate::model::{ConflictPair, Item};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which side of a conflict the user kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Re-submit the local edit over the server state
    AcceptLocal,
    /// Keep the server state as is
    AcceptServer,
    /// Re-submit a payload edited by the user
    Custom,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptLocal => "accept_local",
            Self::AcceptServer => "accept_server",
            Self::Custom => "custom",
        }
    }
}

/// One field that differs between the two sides of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: serde_json::Value,
    pub server_value: serde_json::Value,
}

/// Bookkeeping fields are left out; they always differ.
const IGNORED_FIELDS: &[&str] = &["version", "lastModified", "hasConflicts"];

/// Payload fields whose values differ between the local and server item.
pub fn differing_fields(pair: &ConflictPair) -> SyncResult<Vec<FieldDiff>> {
    let local = serde_json::to_value(&pair.local)?;
    let server = serde_json::to_value(&pair.server)?;
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return Err(SyncError::Internal("item did not serialize to an object".to_string()));
    };

    let mut fields: Vec<&String> = local.keys().chain(server.keys()).collect();
    fields.sort();
    fields.dedup();

    let diffs = fields
        .into_iter()
        .filter(|field| !IGNORED_FIELDS.contains(&field.as_str()))
        .filter_map(|field| {
            let local_value = local.get(field).cloned().unwrap_or_default();
            let server_value = server.get(field).cloned().unwrap_or_default();
            (local_value != server_value).then(|| FieldDiff {
                field: field.clone(),
                local_value,
                server_value,
            })
        })
        .collect();
    Ok(diffs)
}

/// Result of accepting one side of the current conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// What the gateway did with the chosen item
    pub outcome: SaveOutcome,
    /// Pair to present next, `None` once the queue is empty
    pub next: Option<ConflictPair>,
}

impl Resolution {
    pub fn is_done(&self) -> bool {
        self.next.is_none()
    }
}

/// FIFO queue of unresolved conflict pairs
#[derive(Debug, Default)]
pub struct ConflictResolver {
    queue: VecDeque<ConflictPair>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly surfaced pairs behind the ones already waiting. A pair
    /// for an id that is already waiting replaces it in place.
    pub fn extend(&mut self, pairs: impl IntoIterator<Item = ConflictPair>) {
        let before = self.queue.len();
        for pair in pairs {
            let waiting = pair
                .id()
                .and_then(|id| self.queue.iter().position(|queued| queued.id() == Some(id)));
            match waiting {
                Some(index) => self.queue[index] = pair,
                None => self.queue.push_back(pair),
            }
        }
        if self.queue.len() > before {
            tracing::info!(
                added = self.queue.len() - before,
                waiting = self.queue.len(),
                "Conflicts waiting for resolution"
            );
        }
    }

    pub fn current(&self) -> Option<&ConflictPair> {
        self.queue.front()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &ConflictPair> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Re-submit `chosen` for the current pair.
    ///
    /// The chosen payload is sent with the server's current version. A second
    /// conflict replaces the current pair; any other outcome, including an
    /// offline queue, removes it.
    pub async fn accept(
        &mut self,
        gateway: &MutationGateway,
        token: &str,
        connected: bool,
        mut chosen: Item,
        strategy: ResolutionStrategy,
    ) -> SyncResult<Resolution> {
        let Some(pair) = self.queue.front() else {
            return Err(SyncError::InvalidOperation("no conflict to resolve".to_string()));
        };
        chosen.version = pair.server_version();
        chosen.has_conflicts = false;

        let outcome = if chosen.id.is_some() {
            gateway.update(token, chosen, connected).await?
        } else {
            gateway.create(token, chosen, connected).await?
        };

        match &outcome {
            SaveOutcome::Conflict(again) => {
                tracing::info!(
                    item_id = ?again.id(),
                    server_version = again.server_version(),
                    "Resolution conflicted again"
                );
                if let Some(front) = self.queue.front_mut() {
                    *front = again.clone();
                }
            }
            SaveOutcome::Confirmed(item) | SaveOutcome::Queued(item) => {
                tracing::info!(
                    item_id = ?item.id,
                    strategy = strategy.as_str(),
                    queued = matches!(outcome, SaveOutcome::Queued(_)),
                    "Conflict resolved"
                );
                self.queue.pop_front();
            }
        }

        Ok(Resolution {
            outcome,
            next: self.queue.front().cloned(),
        })
    }

    pub async fn accept_local(
        &mut self,
        gateway: &MutationGateway,
        token: &str,
        connected: bool,
    ) -> SyncResult<Resolution> {
        let chosen = self.front_side(|pair| &pair.local)?;
        self.accept(gateway, token, connected, chosen, ResolutionStrategy::AcceptLocal)
            .await
    }

    pub async fn accept_server(
        &mut self,
        gateway: &MutationGateway,
        token: &str,
        connected: bool,
    ) -> SyncResult<Resolution> {
        let chosen = self.front_side(|pair| &pair.server)?;
        self.accept(gateway, token, connected, chosen, ResolutionStrategy::AcceptServer)
            .await
    }

    fn front_side(&self, side: impl Fn(&ConflictPair) -> &Item) -> SyncResult<Item> {
        self.queue
            .front()
            .map(|pair| side(pair).clone())
            .ok_or_else(|| SyncError::InvalidOperation("no conflict to resolve".to_string()))
    }
}
