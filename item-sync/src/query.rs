//! Paginated, filtered reads that blend the local cache with server pages.

use crate::api::{ItemApi, ListOutcome};
use crate::error::SyncResult;
use crate::model::{Item, QueryDescriptor};
use crate::store::ItemStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Items per page.
pub const PAGE_SIZE: usize = 3;

/// Filter by exact model, then by model substring, sort by model and cut out
/// the requested page. The sort is stable, so equal models keep store order.
pub fn paginate_and_match(mut items: Vec<Item>, query: &QueryDescriptor) -> Vec<Item> {
    if let Some(filter) = query.filter() {
        items.retain(|item| item.model == filter);
    }
    if let Some(search) = query.search() {
        items.retain(|item| item.model.contains(search));
    }
    items.retain(|item| !item.is_tombstone());
    items.sort_by(|a, b| a.model.cmp(&b.model));

    items
        .into_iter()
        .skip(query.page.saturating_mul(PAGE_SIZE))
        .take(PAGE_SIZE)
        .collect()
}

/// Newest `last_modified` on the page plus one second.
pub fn if_modified_since(page: &[Item]) -> Option<DateTime<Utc>> {
    page.iter()
        .filter_map(|item| item.last_modified)
        .max()
        .map(|newest| newest + Duration::seconds(1))
}

/// Replace by id, else append.
fn merge_into(page: &mut Vec<Item>, incoming: Item) {
    match page.iter_mut().find(|item| item.id.is_some() && item.id == incoming.id) {
        Some(slot) => *slot = incoming,
        None => page.push(incoming),
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    api: Arc<dyn ItemApi>,
    store: ItemStore,
}

impl QueryEngine {
    pub fn new(api: Arc<dyn ItemApi>, store: ItemStore) -> Self {
        Self { api, store }
    }

    async fn local_page(&self, query: &QueryDescriptor) -> SyncResult<Vec<Item>> {
        Ok(paginate_and_match(self.store.items().await?, query))
    }

    /// One page of items. Offline, or when the server cannot be reached, the
    /// page comes from the local cache alone.
    pub async fn list(
        &self,
        connected: bool,
        token: &str,
        query: &QueryDescriptor,
    ) -> SyncResult<Vec<Item>> {
        let mut page = self.local_page(query).await?;
        if !connected {
            return Ok(page);
        }

        let since = if_modified_since(&page);
        match self.api.list(token, query, since).await {
            Ok(ListOutcome::Fresh(items)) => {
                for item in self.visible(items).await? {
                    self.store.put_item(&item).await?;
                    merge_into(&mut page, item);
                }
                Ok(page)
            }
            Ok(ListOutcome::NotModified) => Ok(page),
            Err(e) => {
                tracing::warn!(error = %e, page = query.page, "Server read failed, serving cached page");
                Ok(page)
            }
        }
    }

    /// Server items the client may cache: those with an id and no delete
    /// queued locally.
    async fn visible(&self, items: Vec<Item>) -> SyncResult<Vec<Item>> {
        let mut visible = Vec::with_capacity(items.len());
        for item in items {
            let Some(id) = item.id() else {
                tracing::warn!(model = %item.model, "Dropping server item without id");
                continue;
            };
            if item.is_tombstone() || self.store.has_tombstone(id).await? {
                tracing::debug!(item_id = id, "Skipping server item with a pending delete");
                continue;
            }
            visible.push(item);
        }
        Ok(visible)
    }

    /// A single item, refreshed from the server when connected. An item with
    /// a pending delete is not found.
    pub async fn get_one(&self, connected: bool, token: &str, id: &str) -> SyncResult<Option<Item>> {
        if self.store.has_tombstone(id).await? {
            return Ok(None);
        }
        if connected {
            match self.api.get(token, id).await {
                Ok(item) => {
                    self.store.put_item(&item).await?;
                    return Ok(Some(item));
                }
                Err(e) => {
                    tracing::warn!(error = %e, item_id = id, "Server read failed, using cached item");
                }
            }
        }
        self.store.get_item(id).await
    }

    /// Every item, unpaginated.
    pub async fn get_all(&self, connected: bool, token: &str) -> SyncResult<Vec<Item>> {
        if connected {
            match self.api.list_all(token).await {
                Ok(items) => {
                    let items = self.visible(items).await?;
                    for item in &items {
                        self.store.put_item(item).await?;
                    }
                    return Ok(items);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Server listing failed, using cached items");
                }
            }
        }
        self.store.items().await
    }

    /// Sorted distinct model names, offered as filter choices.
    pub async fn filter_values(&self, connected: bool, token: &str) -> SyncResult<Vec<String>> {
        let mut models: Vec<String> = self
            .get_all(connected, token)
            .await?
            .into_iter()
            .map(|item| item.model)
            .collect();
        models.sort();
        models.dedup();
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockItemApi;
    use crate::error::ApiError;
    use crate::memory_store::MemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn item(id: &str, model: &str) -> Item {
        Item {
            id: Some(id.to_string()),
            model: model.to_string(),
            version: 1,
            ..Item::default()
        }
    }

    fn models(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.model.as_str()).collect()
    }

    async fn seeded_store(items: &[Item]) -> ItemStore {
        let store = ItemStore::new(Arc::new(MemoryStore::new()));
        for item in items {
            store.put_item(item).await.unwrap();
        }
        store
    }

    fn seven_items() -> Vec<Item> {
        ["G", "C", "A", "F", "B", "E", "D"]
            .iter()
            .enumerate()
            .map(|(i, model)| item(&i.to_string(), model))
            .collect()
    }

    #[test]
    fn test_pages_follow_model_order() {
        let items = seven_items();
        assert_eq!(models(&paginate_and_match(items.clone(), &QueryDescriptor::page(0))), ["A", "B", "C"]);
        assert_eq!(models(&paginate_and_match(items.clone(), &QueryDescriptor::page(1))), ["D", "E", "F"]);
        assert_eq!(models(&paginate_and_match(items.clone(), &QueryDescriptor::page(2))), ["G"]);
        assert!(paginate_and_match(items, &QueryDescriptor::page(3)).is_empty());
    }

    #[test]
    fn test_filter_then_case_sensitive_search() {
        let items = vec![
            item("1", "Stratocaster"),
            item("2", "stratocaster"),
            item("3", "Telecaster"),
            item("4", "Stratocaster"),
        ];

        let filtered = paginate_and_match(items.clone(), &QueryDescriptor::page(0).with_filter("Stratocaster"));
        assert_eq!(filtered.len(), 2);

        let searched = paginate_and_match(items.clone(), &QueryDescriptor::page(0).with_search("caster"));
        assert_eq!(searched.len(), 3);

        let searched = paginate_and_match(items, &QueryDescriptor::page(0).with_search("Strat"));
        assert_eq!(models(&searched), ["Stratocaster", "Stratocaster"]);
    }

    #[test]
    fn test_tombstones_never_paginated() {
        let mut deleted = item("9", "AAA");
        deleted.version = -1;
        let page = paginate_and_match(vec![deleted, item("1", "B")], &QueryDescriptor::page(0));
        assert_eq!(models(&page), ["B"]);
    }

    #[test]
    fn test_if_modified_since_is_newest_plus_one_second() {
        let mut a = item("1", "A");
        a.last_modified = Some(Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap());
        let mut b = item("2", "B");
        b.last_modified = Some(Utc.with_ymd_and_hms(2026, 10, 2, 9, 30, 0).unwrap());
        let c = item("3", "C");

        assert_eq!(
            if_modified_since(&[a, b, c]),
            Some(Utc.with_ymd_and_hms(2026, 10, 2, 9, 30, 1).unwrap())
        );
        assert_eq!(if_modified_since(&[]), None);
    }

    #[tokio::test]
    async fn test_offline_list_reads_cache_only() {
        let store = seeded_store(&seven_items()).await;
        let mut api = MockItemApi::new();
        api.expect_list().never();

        let engine = QueryEngine::new(Arc::new(api), store);
        let page = engine.list(false, "tok", &QueryDescriptor::page(1)).await.unwrap();
        assert_eq!(models(&page), ["D", "E", "F"]);
    }

    #[tokio::test]
    async fn test_not_modified_returns_cached_page_unchanged() {
        let mut cached = seven_items();
        for (i, item) in cached.iter_mut().enumerate() {
            item.last_modified = Some(Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, i as u32).unwrap());
        }
        let store = seeded_store(&cached).await;
        let expected = paginate_and_match(cached, &QueryDescriptor::page(0));

        let mut api = MockItemApi::new();
        api.expect_list()
            .withf(|token, query, since| token == "tok" && query.page == 0 && since.is_some())
            .times(1)
            .returning(|_, _, _| Ok(ListOutcome::NotModified));

        let engine = QueryEngine::new(Arc::new(api), store);
        let page = engine.list(true, "tok", &QueryDescriptor::page(0)).await.unwrap();
        assert_eq!(page, expected);
    }

    #[tokio::test]
    async fn test_fresh_page_merges_and_persists() {
        let store = seeded_store(&[item("1", "A"), item("2", "B")]).await;

        let mut api = MockItemApi::new();
        api.expect_list().times(1).returning(|_, _, _| {
            let mut updated = item("2", "B");
            updated.version = 4;
            Ok(ListOutcome::Fresh(vec![updated, item("3", "C")]))
        });

        let engine = QueryEngine::new(Arc::new(api), store.clone());
        let page = engine.list(true, "tok", &QueryDescriptor::page(0)).await.unwrap();

        assert_eq!(models(&page), ["A", "B", "C"]);
        assert_eq!(page[1].version, 4);
        assert_eq!(store.get_item("2").await.unwrap().unwrap().version, 4);
        assert!(store.get_item("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_server_failure_falls_back_to_cache() {
        let store = seeded_store(&seven_items()).await;

        let mut api = MockItemApi::new();
        api.expect_list()
            .returning(|_, _, _| Err(ApiError::Transport("connection reset".into())));
        api.expect_get()
            .returning(|_, _| Err(ApiError::Transport("connection reset".into())));
        api.expect_list_all()
            .returning(|_| Err(ApiError::Status { status: 500, message: String::new() }));

        let engine = QueryEngine::new(Arc::new(api), store);
        let page = engine.list(true, "tok", &QueryDescriptor::page(0)).await.unwrap();
        assert_eq!(models(&page), ["A", "B", "C"]);

        let one = engine.get_one(true, "tok", "0").await.unwrap().unwrap();
        assert_eq!(one.model, "G");

        assert_eq!(engine.get_all(true, "tok").await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_get_one_online_refreshes_cache() {
        let store = seeded_store(&[item("1", "Old")]).await;

        let mut api = MockItemApi::new();
        api.expect_get()
            .withf(|_, id| id == "1")
            .returning(|_, _| Ok(item("1", "New")));

        let engine = QueryEngine::new(Arc::new(api), store.clone());
        let fetched = engine.get_one(true, "tok", "1").await.unwrap().unwrap();
        assert_eq!(fetched.model, "New");
        assert_eq!(store.get_item("1").await.unwrap().unwrap().model, "New");
    }

    #[tokio::test]
    async fn test_server_copy_of_pending_delete_stays_hidden() {
        let store = seeded_store(&[item("1", "A")]).await;
        store.queue_tombstone(&item("2", "Mustang")).await.unwrap();

        let mut api = MockItemApi::new();
        api.expect_list()
            .times(1)
            .returning(|_, _, _| Ok(ListOutcome::Fresh(vec![item("2", "Mustang"), item("3", "C")])));
        api.expect_list_all()
            .times(1)
            .returning(|_| Ok(vec![item("1", "A"), item("2", "Mustang")]));
        api.expect_get().never();

        let engine = QueryEngine::new(Arc::new(api), store.clone());
        let page = engine.list(true, "tok", &QueryDescriptor::page(0)).await.unwrap();
        assert_eq!(models(&page), ["A", "C"]);

        let all = engine.get_all(true, "tok").await.unwrap();
        assert_eq!(models(&all), ["A"]);

        assert!(engine.get_one(true, "tok", "2").await.unwrap().is_none());
        assert!(store.get_item("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filter_values_are_distinct_and_sorted() {
        let store = seeded_store(&[item("1", "SG"), item("2", "Les Paul"), item("3", "SG")]).await;
        let engine = QueryEngine::new(Arc::new(MockItemApi::new()), store);

        let values = engine.filter_values(false, "tok").await.unwrap();
        assert_eq!(values, vec!["Les Paul", "SG"]);
    }

    proptest! {
        #[test]
        fn prop_pages_partition_sorted_items(names in proptest::collection::vec("[a-e]{1,3}", 0..20)) {
            let items: Vec<Item> = names
                .iter()
                .enumerate()
                .map(|(i, name)| item(&i.to_string(), name))
                .collect();

            let mut expected: Vec<String> = names.clone();
            expected.sort();

            let mut paged = Vec::new();
            let mut page = 0;
            loop {
                let chunk = paginate_and_match(items.clone(), &QueryDescriptor::page(page));
                prop_assert!(chunk.len() <= PAGE_SIZE);
                if chunk.is_empty() {
                    break;
                }
                paged.extend(chunk.into_iter().map(|i| i.model));
                page += 1;
            }
            prop_assert_eq!(paged, expected);
        }
    }
}
