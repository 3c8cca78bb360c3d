//! In-memory stand-in for the item server.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use item_sync::{
    paginate_and_match, ApiError, ApiResult, AppContext, Connectivity, Item, ItemApi, ListOutcome,
    MemoryStore, QueryDescriptor, SyncConfig,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Versioned item server with optimistic concurrency on update.
pub struct FakeServer {
    items: Mutex<BTreeMap<String, Item>>,
    next_id: AtomicUsize,
    clock: AtomicUsize,
    reachable: AtomicBool,
    pub list_calls: AtomicUsize,
    pub not_modified_answers: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
            clock: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            list_calls: AtomicUsize::new(0),
            not_modified_answers: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Seed an item as if another client had created it.
    pub fn seed(&self, model: &str) -> Item {
        let item = Item {
            id: Some(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
            model: model.to_string(),
            version: 1,
            last_modified: Some(self.tick()),
            ..Item::default()
        };
        self.items
            .lock()
            .unwrap()
            .insert(item.id.clone().unwrap_or_default(), item.clone());
        item
    }

    pub fn item(&self, id: &str) -> Option<Item> {
        self.items.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Server timestamps advance one second per write.
    fn tick(&self) -> DateTime<Utc> {
        let step = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(step)
    }

    fn check_reachable(&self) -> ApiResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Transport("connection refused".into()))
        }
    }
}

#[async_trait]
impl ItemApi for FakeServer {
    async fn list(
        &self,
        _token: &str,
        query: &QueryDescriptor,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> ApiResult<ListOutcome> {
        self.check_reachable()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let all: Vec<Item> = self.items.lock().unwrap().values().cloned().collect();
        let page = paginate_and_match(all, query);
        let newest = page.iter().filter_map(|item| item.last_modified).max();

        if let (Some(since), Some(newest)) = (if_modified_since, newest) {
            if newest < since {
                self.not_modified_answers.fetch_add(1, Ordering::SeqCst);
                return Ok(ListOutcome::NotModified);
            }
        }
        Ok(ListOutcome::Fresh(page))
    }

    async fn list_all(&self, _token: &str) -> ApiResult<Vec<Item>> {
        self.check_reachable()?;
        Ok(self.items.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, _token: &str, id: &str) -> ApiResult<Item> {
        self.check_reachable()?;
        self.item(id).ok_or(ApiError::NotFound)
    }

    async fn create(&self, _token: &str, item: &Item) -> ApiResult<Item> {
        self.check_reachable()?;
        let mut saved = item.clone();
        saved.id = Some(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        saved.version = 1;
        saved.last_modified = Some(self.tick());
        self.items
            .lock()
            .unwrap()
            .insert(saved.id.clone().unwrap_or_default(), saved.clone());
        Ok(saved)
    }

    async fn update(&self, _token: &str, item: &Item) -> ApiResult<Item> {
        self.check_reachable()?;
        let id = item.id.clone().ok_or(ApiError::NotFound)?;
        let last_modified = self.tick();
        let mut items = self.items.lock().unwrap();
        let current = items.get(&id).cloned().ok_or(ApiError::NotFound)?;

        if current.version != item.version {
            let mut flagged = current;
            flagged.has_conflicts = true;
            return Err(ApiError::Conflict(Box::new(flagged)));
        }

        let mut saved = item.clone();
        saved.version = current.version + 1;
        saved.last_modified = Some(last_modified);
        items.insert(id, saved.clone());
        Ok(saved)
    }

    async fn delete(&self, _token: &str, id: &str) -> ApiResult<Option<Item>> {
        self.check_reachable()?;
        match self.items.lock().unwrap().remove(id) {
            Some(item) => Ok(Some(item)),
            None => Err(ApiError::NotFound),
        }
    }
}

/// Fresh context over an in-memory store talking to `server`.
pub fn device(server: &Arc<FakeServer>, online: bool) -> Arc<AppContext> {
    let config = SyncConfig {
        auth_token: Some("token".into()),
        ..SyncConfig::default()
    };
    Arc::new(AppContext::new(
        config,
        Arc::new(MemoryStore::new()),
        server.clone(),
        Connectivity::new(online),
    ))
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
