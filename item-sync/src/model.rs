//! Domain records shared by every layer of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the synchronized collection, used as the key prefix in the local store.
pub const ITEMS: &str = "items";

/// Version of an item created locally and never confirmed by the server.
pub const UNCONFIRMED_VERSION: i64 = 0;

/// Version marking a locally initiated delete that the server has not confirmed.
pub const TOMBSTONE_VERSION: i64 = -1;

/// A synchronized item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Field used for filtering, searching and ordering.
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub price: f64,

    #[serde(default)]
    pub produced_on: Option<DateTime<Utc>>,

    #[serde(default)]
    pub available: bool,

    /// `0` unconfirmed, `-1` tombstone, `>= 1` server revision.
    #[serde(default)]
    pub version: i64,

    /// Assigned by the server when it confirms a revision.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,

    /// Set by the server when an update was rejected as stale.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_conflicts: bool,
}

impl Item {
    /// New unsaved item with the given model name.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Placeholder used to queue a delete when nothing is cached for the id.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            version: TOMBSTONE_VERSION,
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.version == TOMBSTONE_VERSION
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.version == UNCONFIRMED_VERSION
    }
}

/// Operation a pending snapshot stands for, derived from its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn for_version(version: i64) -> Self {
        match version {
            TOMBSTONE_VERSION => OperationType::Delete,
            UNCONFIRMED_VERSION => OperationType::Create,
            _ => OperationType::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// A queued create/update/delete waiting for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Store key the snapshot lives under.
    pub key: String,
    pub item: Item,
}

impl PendingMutation {
    pub fn operation(&self) -> OperationType {
        OperationType::for_version(self.item.version)
    }
}

/// The client's intended item and the server's current item for the same id,
/// produced when the server rejects a stale write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub local: Item,
    pub server: Item,
}

impl ConflictPair {
    pub fn new(local: Item, mut server: Item) -> Self {
        server.has_conflicts = false;
        Self { local, server }
    }

    pub fn id(&self) -> Option<&str> {
        self.server.id().or_else(|| self.local.id())
    }

    pub fn server_version(&self) -> i64 {
        self.server.version
    }
}

/// Parameters of one paginated read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDescriptor {
    /// Zero-based page number.
    pub page: usize,
    /// Exact match on `model`.
    pub filter: Option<String>,
    /// Case-sensitive substring match on `model`.
    pub search: Option<String>,
}

impl QueryDescriptor {
    pub fn page(page: usize) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = non_empty(filter.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = non_empty(search.into());
        self
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref().filter(|f| !f.is_empty())
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref().filter(|s| !s.is_empty())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
