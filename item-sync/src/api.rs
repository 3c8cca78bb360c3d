//! Remote item API
//!
//! The engine talks to the server only through [`ItemApi`]. [`HttpItemApi`]
//! is the reqwest implementation of the REST contract:
//!
//! - `GET /api/items?page&filter&search` (conditional on `if-modified-since`)
//! - `GET /api/items/{id}`
//! - `POST /api/items`
//! - `PUT /api/items/{id}` (`409` or `hasConflicts` on a stale version)
//! - `DELETE /api/items/{id}`

use crate::config::SyncConfig;
use crate::error::{ApiError, ApiResult, SyncError, SyncResult};
use crate::model::{Item, QueryDescriptor, ITEMS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::IF_MODIFIED_SINCE;
use reqwest::{RequestBuilder, Response, StatusCode};

/// Result of a conditional page read.
#[derive(Debug, Clone, PartialEq)]
pub enum ListOutcome {
    Fresh(Vec<Item>),
    NotModified,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemApi: Send + Sync {
    /// Read one page; `if_modified_since` makes the read conditional.
    async fn list(
        &self,
        token: &str,
        query: &QueryDescriptor,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> ApiResult<ListOutcome>;

    /// Unpaginated listing.
    async fn list_all(&self, token: &str) -> ApiResult<Vec<Item>>;

    async fn get(&self, token: &str, id: &str) -> ApiResult<Item>;

    /// Returns the item as stored by the server, with its id and version.
    async fn create(&self, token: &str, item: &Item) -> ApiResult<Item>;

    /// Fails with [`ApiError::Conflict`] when `item.version` is stale.
    async fn update(&self, token: &str, item: &Item) -> ApiResult<Item>;

    /// Returns the deleted item when the server echoes it.
    async fn delete(&self, token: &str, id: &str) -> ApiResult<Option<Item>>;
}

/// Format a timestamp as an RFC 7231 HTTP date.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// reqwest-backed [`ItemApi`]
#[derive(Clone)]
pub struct HttpItemApi {
    client: reqwest::Client,
    items_url: String,
}

impl HttpItemApi {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            items_url: format!("{}/api/{}", config.server_url.trim_end_matches('/'), ITEMS),
        })
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/{}", self.items_url, id)
    }

    fn authorized(request: RequestBuilder, token: &str) -> RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.bearer_auth(token)
        }
    }

    async fn check_status(response: Response) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ItemApi for HttpItemApi {
    async fn list(
        &self,
        token: &str,
        query: &QueryDescriptor,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> ApiResult<ListOutcome> {
        let mut request = Self::authorized(self.client.get(&self.items_url), token)
            .query(&[("page", query.page.to_string())]);
        if let Some(filter) = query.filter() {
            request = request.query(&[("filter", filter)]);
        }
        if let Some(search) = query.search() {
            request = request.query(&[("search", search)]);
        }
        if let Some(since) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, http_date(since));
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!(page = query.page, "Page not modified on server");
            return Ok(ListOutcome::NotModified);
        }

        let items: Vec<Item> = Self::check_status(response).await?.json().await?;
        tracing::debug!(page = query.page, count = items.len(), "Fetched page from server");
        Ok(ListOutcome::Fresh(items))
    }

    async fn list_all(&self, token: &str) -> ApiResult<Vec<Item>> {
        let response = Self::authorized(self.client.get(&self.items_url), token)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn get(&self, token: &str, id: &str) -> ApiResult<Item> {
        let response = Self::authorized(self.client.get(self.item_url(id)), token)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn create(&self, token: &str, item: &Item) -> ApiResult<Item> {
        let response = Self::authorized(self.client.post(&self.items_url), token)
            .json(item)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn update(&self, token: &str, item: &Item) -> ApiResult<Item> {
        let id = item.id().ok_or(ApiError::NotFound)?;
        let response = Self::authorized(self.client.put(self.item_url(id)), token)
            .json(item)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let server: Item = response.json().await?;
            return Err(ApiError::Conflict(Box::new(server)));
        }

        let saved: Item = Self::check_status(response).await?.json().await?;
        if saved.has_conflicts {
            return Err(ApiError::Conflict(Box::new(saved)));
        }
        Ok(saved)
    }

    async fn delete(&self, token: &str, id: &str) -> ApiResult<Option<Item>> {
        let response = Self::authorized(self.client.delete(self.item_url(id)), token)
            .send()
            .await?;
        let body = Self::check_status(response).await?.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str::<Option<Item>>(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
