//! Application context
//!
//! Owns the store, the API client, the credential, the connectivity signal,
//! the in-memory item state and the conflict queue. Everything a front end
//! does goes through here, and the long-running work (reconcile on reconnect,
//! live updates, reachability checks) is started from here as
//! [`Subscription`]s.

use crate::api::{HttpItemApi, ItemApi};
use crate::config::SyncConfig;
use crate::conflict_resolution::{ConflictResolver, Resolution, ResolutionStrategy};
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{DeleteOutcome, MutationGateway, SaveOutcome};
use crate::live_channel::{ItemEvent, LiveUpdateChannel};
use crate::local_db::LocalDatabase;
use crate::model::{ConflictPair, Item, QueryDescriptor};
use crate::query::QueryEngine;
use crate::state::{reduce, ItemsAction, ItemsState};
use crate::store::{ItemStore, KeyValueStore};
use crate::subscription::Subscription;
use crate::sync_protocol::{SyncCoordinator, SyncStats};
use std::sync::atomic::{AtomicBool, Ordering};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

pub struct AppContext {
    config: SyncConfig,
    api: Arc<dyn ItemApi>,
    store: ItemStore,
    queries: QueryEngine,
    gateway: MutationGateway,
    coordinator: SyncCoordinator,
    channel: LiveUpdateChannel,
    connectivity: Connectivity,
    credential: watch::Sender<String>,
    state: RwLock<ItemsState>,
    query: RwLock<QueryDescriptor>,
    conflicts: Mutex<ConflictResolver>,
    saved_offline: AtomicBool,
}

impl AppContext {
    pub fn new(
        config: SyncConfig,
        kv: Arc<dyn KeyValueStore>,
        api: Arc<dyn ItemApi>,
        connectivity: Connectivity,
    ) -> Self {
        let store = ItemStore::new(kv);
        let channel = LiveUpdateChannel::new(
            config.ws_url.clone(),
            config.max_retries,
            config.retry_backoff(),
            store.clone(),
        );
        let (credential, _) = watch::channel(config.auth_token.clone().unwrap_or_default());

        Self {
            queries: QueryEngine::new(api.clone(), store.clone()),
            gateway: MutationGateway::new(api.clone(), store.clone()),
            coordinator: SyncCoordinator::new(api.clone(), store.clone()),
            api,
            channel,
            store,
            connectivity,
            credential,
            state: RwLock::new(ItemsState::default()),
            query: RwLock::new(QueryDescriptor::default()),
            conflicts: Mutex::new(ConflictResolver::new()),
            saved_offline: AtomicBool::new(false),
            config,
        }
    }

    /// Context backed by the SQLite store and the HTTP API from `config`,
    /// with the conflicts left over from earlier runs queued again.
    pub async fn open(config: SyncConfig, connectivity: Connectivity) -> SyncResult<Self> {
        config.validate()?;
        let db = LocalDatabase::new(config.local_db.clone()).await?;
        let api = HttpItemApi::new(&config)?;
        let ctx = Self::new(config, Arc::new(db), Arc::new(api), connectivity);
        ctx.restore_conflicts().await?;
        Ok(ctx)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn token(&self) -> String {
        self.credential.borrow().clone()
    }

    /// Replace the credential. The live channel reopens when it changes.
    pub fn set_credential(&self, token: impl Into<String>) -> bool {
        let token = token.into();
        self.credential.send_if_modified(|current| {
            if *current == token {
                return false;
            }
            *current = token;
            true
        })
    }

    pub async fn state(&self) -> ItemsState {
        self.state.read().await.clone()
    }

    async fn dispatch(&self, action: ItemsAction) {
        tracing::debug!(action = action.name(), "Dispatching item action");
        let mut state = self.state.write().await;
        let current = std::mem::take(&mut *state);
        *state = reduce(current, action);
    }

    pub async fn query(&self) -> QueryDescriptor {
        self.query.read().await.clone()
    }

    pub async fn set_page(&self, page: usize) {
        self.query.write().await.page = page;
    }

    pub async fn set_filter(&self, filter: impl Into<String>) {
        let mut query = self.query.write().await;
        *query = std::mem::take(&mut *query).with_filter(filter);
    }

    pub async fn set_search(&self, search: impl Into<String>) {
        let mut query = self.query.write().await;
        *query = std::mem::take(&mut *query).with_search(search);
    }

    /// Whether a mutation was queued locally since the last acknowledgement.
    pub fn saved_offline(&self) -> bool {
        self.saved_offline.load(Ordering::SeqCst)
    }

    pub fn acknowledge_saved_offline(&self) {
        self.saved_offline.store(false, Ordering::SeqCst);
    }

    /// Load the current page into the item state.
    pub async fn fetch_items(&self) -> SyncResult<Vec<Item>> {
        self.fetch_page(None).await
    }

    /// Fetch in the background; the result is dropped if the subscription is
    /// canceled first.
    pub fn spawn_fetch(self: &Arc<Self>) -> Subscription {
        let canceled = Subscription::flag();
        let ctx = Arc::clone(self);
        let flag = canceled.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = ctx.fetch_page(Some(&*flag)).await {
                tracing::warn!(error = %e, "Background fetch failed");
            }
        });
        Subscription::new(canceled, vec![handle])
    }

    async fn fetch_page(&self, canceled: Option<&AtomicBool>) -> SyncResult<Vec<Item>> {
        let query = self.query().await;
        let token = self.token();
        let connected = self.is_online() && !token.trim().is_empty();
        if self.is_online() && !connected {
            tracing::debug!(page = query.page, "No credential, serving cached page");
        }
        self.dispatch(ItemsAction::FetchStarted).await;

        match self.queries.list(connected, &token, &query).await {
            Ok(page) => {
                if canceled.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                    tracing::debug!(page = query.page, "Dropping fetch result after cancellation");
                    return Ok(page);
                }
                self.dispatch(ItemsAction::FetchSucceeded(page.clone())).await;
                Ok(page)
            }
            Err(e) => {
                self.dispatch(ItemsAction::FetchFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    pub async fn get_item(&self, id: &str) -> SyncResult<Option<Item>> {
        self.dispatch(ItemsAction::SaveStarted).await;
        match self.queries.get_one(self.is_online(), &self.token(), id).await {
            Ok(Some(item)) => {
                self.dispatch(ItemsAction::SaveSucceeded(item.clone())).await;
                Ok(Some(item))
            }
            Ok(None) => {
                self.dispatch(ItemsAction::SaveFailed(format!("Item {id} not found"))).await;
                Ok(None)
            }
            Err(e) => {
                self.dispatch(ItemsAction::SaveFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Distinct model names for the filter picker.
    pub async fn filter_values(&self) -> SyncResult<Vec<String>> {
        self.queries.filter_values(self.is_online(), &self.token()).await
    }

    /// Create when the item has no id, update otherwise.
    pub async fn save_item(&self, item: Item) -> SyncResult<SaveOutcome> {
        self.dispatch(ItemsAction::SaveStarted).await;
        let online = self.is_online();
        let token = self.token();

        let result = if item.id.is_some() {
            self.gateway.update(&token, item, online).await
        } else {
            self.gateway.create(&token, item, online).await
        };

        match result {
            Ok(outcome) => {
                self.apply_save(&outcome).await;
                if let SaveOutcome::Conflict(pair) = &outcome {
                    self.record_conflicts(vec![pair.clone()]).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                self.dispatch(ItemsAction::SaveFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn apply_save(&self, outcome: &SaveOutcome) {
        match outcome {
            SaveOutcome::Confirmed(item) => {
                self.dispatch(ItemsAction::SaveSucceeded(item.clone())).await;
            }
            SaveOutcome::Queued(item) => {
                self.saved_offline.store(true, Ordering::SeqCst);
                self.dispatch(ItemsAction::SaveSucceeded(item.clone())).await;
            }
            SaveOutcome::Conflict(pair) => {
                self.dispatch(ItemsAction::SaveConflicted(pair.clone())).await;
            }
        }
    }

    pub async fn delete_item(&self, id: &str) -> SyncResult<DeleteOutcome> {
        self.dispatch(ItemsAction::DeleteStarted).await;
        match self.gateway.delete(&self.token(), id, self.is_online()).await {
            Ok(outcome) => {
                if matches!(outcome, DeleteOutcome::Queued(_)) {
                    self.saved_offline.store(true, Ordering::SeqCst);
                }
                self.dispatch(ItemsAction::DeleteSucceeded {
                    id: id.to_string(),
                    item: outcome.item().cloned(),
                })
                .await;
                Ok(outcome)
            }
            Err(e) => {
                self.dispatch(ItemsAction::DeleteFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Empty the in-memory collection, e.g. before a new search.
    pub async fn reset_items(&self) {
        self.dispatch(ItemsAction::Reset).await;
    }

    /// Replay the pending queue now and queue any conflicts it surfaces.
    pub async fn reconcile_pending(&self) -> SyncResult<SyncStats> {
        let stats = self.coordinator.reconcile(&self.token()).await?;
        self.record_conflicts(stats.conflicts.clone()).await?;
        Ok(stats)
    }

    /// Persist conflict pairs, then queue them for resolution. The replayed
    /// local edit only survives in the stored pair.
    async fn record_conflicts(&self, pairs: Vec<ConflictPair>) -> SyncResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        for pair in &pairs {
            self.store.save_conflict(pair).await?;
        }
        self.conflicts.lock().await.extend(pairs);
        Ok(())
    }

    /// Queue the conflicts persisted by an earlier session.
    pub async fn restore_conflicts(&self) -> SyncResult<usize> {
        let stored = self.store.conflicts().await?;
        let restored = stored.len();
        if restored > 0 {
            tracing::info!(conflicts = restored, "Restored unresolved conflicts");
            self.conflicts.lock().await.extend(stored);
        }
        Ok(restored)
    }

    pub async fn conflicts(&self) -> Vec<ConflictPair> {
        self.conflicts.lock().await.pairs().cloned().collect()
    }

    pub async fn current_conflict(&self) -> Option<ConflictPair> {
        self.conflicts.lock().await.current().cloned()
    }

    /// Resolve the current conflict. `custom` is required for
    /// [`ResolutionStrategy::Custom`] and ignored otherwise.
    pub async fn resolve_conflict(
        &self,
        strategy: ResolutionStrategy,
        custom: Option<Item>,
    ) -> SyncResult<Resolution> {
        let online = self.is_online();
        let token = self.token();
        let mut resolver = self.conflicts.lock().await;
        let resolved_id = resolver.current().and_then(|pair| pair.id()).map(str::to_string);

        let resolution = match strategy {
            ResolutionStrategy::AcceptLocal => {
                resolver.accept_local(&self.gateway, &token, online).await?
            }
            ResolutionStrategy::AcceptServer => {
                resolver.accept_server(&self.gateway, &token, online).await?
            }
            ResolutionStrategy::Custom => {
                let chosen = custom.ok_or_else(|| {
                    SyncError::InvalidOperation("custom resolution needs an item".to_string())
                })?;
                resolver
                    .accept(&self.gateway, &token, online, chosen, strategy)
                    .await?
            }
        };
        drop(resolver);

        match &resolution.outcome {
            SaveOutcome::Conflict(again) => self.store.save_conflict(again).await?,
            SaveOutcome::Confirmed(_) | SaveOutcome::Queued(_) => {
                if let Some(id) = &resolved_id {
                    self.store.remove_conflict(id).await?;
                }
            }
        }
        self.apply_save(&resolution.outcome).await;
        Ok(resolution)
    }

    /// Project a push-channel change into the item state.
    pub async fn apply_item_event(&self, event: ItemEvent) {
        match event {
            ItemEvent::Upserted(item) => self.dispatch(ItemsAction::SaveSucceeded(item)).await,
            ItemEvent::Removed(id) => {
                self.dispatch(ItemsAction::DeleteSucceeded { id, item: None }).await;
            }
        }
    }

    /// Reconcile on every offline to online transition, then refresh the page.
    pub fn spawn_sync_on_reconnect(self: &Arc<Self>) -> Subscription {
        let canceled = Subscription::flag();
        let ctx = Arc::clone(self);
        let flag = canceled.clone();
        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();

        let handle = tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                let online = *online_rx.borrow_and_update();
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                if online && !was_online {
                    ctx.sync_after_reconnect(&flag).await;
                }
                was_online = online;
            }
        });
        Subscription::new(canceled, vec![handle])
    }

    async fn sync_after_reconnect(&self, canceled: &AtomicBool) {
        let stats = match self.coordinator.reconcile(&self.token()).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Reconcile after reconnect failed");
                return;
            }
        };
        if canceled.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.record_conflicts(stats.conflicts).await {
            tracing::error!(error = %e, "Could not record reconcile conflicts");
        }
        if let Err(e) = self.fetch_page(Some(canceled)).await {
            tracing::warn!(error = %e, "Refresh after reconnect failed");
        }
    }

    /// Check every `every` whether the server answers and drive the
    /// connectivity signal from the result. A conditional read of the first
    /// page keeps the check cheap; any answer from the server, even an error
    /// status, counts as reachable.
    pub fn spawn_reachability_check(self: &Arc<Self>, every: Duration) -> Subscription {
        let canceled = Subscription::flag();
        let ctx = Arc::clone(self);
        let flag = canceled.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }

                let first_page = QueryDescriptor::default();
                let token = ctx.token();
                let answer = ctx.api.list(&token, &first_page, Some(Utc::now())).await;
                let reachable = match answer {
                    Ok(_) => true,
                    Err(e) => !e.is_retryable(),
                };
                if !reachable {
                    tracing::debug!("Server did not answer the reachability check");
                }
                ctx.connectivity.set_online(reachable);
            }
        });
        Subscription::new(canceled, vec![handle])
    }

    /// Keep a push channel open while there is a credential and connectivity,
    /// reopening it whenever either changes.
    pub fn spawn_live_updates(self: &Arc<Self>) -> Subscription {
        let canceled = Subscription::flag();
        let ctx = Arc::clone(self);
        let flag = canceled.clone();
        let mut online_rx = self.connectivity.subscribe();
        let mut token_rx = self.credential.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let online = *online_rx.borrow_and_update();
                let token = token_rx.borrow_and_update().clone();

                let (tx, mut events) = mpsc::unbounded_channel();
                let _session = if online && !token.trim().is_empty() {
                    Some(ctx.channel.open(token, tx))
                } else {
                    tracing::debug!(online, "Push channel idle");
                    None
                };

                loop {
                    tokio::select! {
                        changed = online_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        changed = token_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        Some(event) = events.recv() => {
                            if flag.load(Ordering::SeqCst) {
                                return;
                            }
                            ctx.apply_item_event(event).await;
                        }
                    }
                }
            }
        });
        Subscription::new(canceled, vec![handle])
    }
}
