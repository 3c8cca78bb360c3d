//! Offline-first synchronization engine for a collection of items
//!
//! Provides:
//! - Local key-value cache (SQLite or in-memory) with a pending-mutation queue
//! - Paginated, filtered reads blending cached and server data
//! - Create/update/delete with offline fallback
//! - Reconciliation of queued mutations with version-conflict detection
//! - User-driven conflict resolution
//! - Live updates over a WebSocket push channel

pub mod api;
pub mod config;
pub mod conflict_resolution;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod gateway;
pub mod live_channel;
pub mod local_db;
pub mod memory_store;
pub mod model;
pub mod query;
pub mod state;
pub mod store;
pub mod subscription;
pub mod sync_protocol;

pub use api::{HttpItemApi, ItemApi, ListOutcome};
pub use config::SyncConfig;
pub use conflict_resolution::{
    differing_fields, ConflictResolver, FieldDiff, Resolution, ResolutionStrategy,
};
pub use connectivity::Connectivity;
pub use context::AppContext;
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use gateway::{DeleteOutcome, MutationGateway, SaveOutcome};
pub use live_channel::{ItemEvent, LiveUpdateChannel, PushMessage};
pub use local_db::{LocalDatabase, LocalDbConfig};
pub use memory_store::MemoryStore;
pub use model::{ConflictPair, Item, OperationType, PendingMutation, QueryDescriptor};
pub use query::{paginate_and_match, QueryEngine, PAGE_SIZE};
pub use state::{reduce, ItemsAction, ItemsState};
pub use store::{ItemStore, KeyValueStore, Namespace};
pub use subscription::Subscription;
pub use sync_protocol::{SyncCoordinator, SyncStats};
