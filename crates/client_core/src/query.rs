use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use shared::{
    error::ApiError,
    protocol::{ListPage, ListQuery},
};

use crate::{cache::ListSnapshot, error::StoreQueryError};

/// Where authoritative pages come from. The HTTP implementation below talks
/// to the reference server; tests substitute their own.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn query_page(&self, query: &ListQuery) -> Result<ListPage, StoreQueryError>;
}

pub struct HttpStoreBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStoreBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StoreBackend for HttpStoreBackend {
    async fn query_page(&self, query: &ListQuery) -> Result<ListPage, StoreQueryError> {
        let mut request = self
            .http
            .get(format!("{}/records", self.base_url))
            .query(&[("page", query.page), ("limit", query.limit)]);
        if let Some(search) = &query.search {
            request = request.query(&[("search", search)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(api_error) => api_error.message,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            };
            return Err(StoreQueryError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ListPage>()
            .await
            .map_err(|err| StoreQueryError::Decode(err.to_string()))
    }
}

/// Translates user navigation into full-replacement store queries and
/// enforces last-request-wins: every fetch carries a monotonic request id,
/// and a response is discarded when a later-issued request has already been
/// applied, regardless of arrival order.
pub struct QueryController {
    backend: Arc<dyn StoreBackend>,
    next_request_id: AtomicU64,
    last_applied: AtomicU64,
}

impl QueryController {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            next_request_id: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
        }
    }

    /// Fetches one page. `Ok(None)` means the result arrived too late and
    /// was discarded; the caller keeps whatever it currently displays.
    /// On error the previous snapshot is untouched by construction: nothing
    /// is replaced unless a page actually arrives and wins.
    pub async fn fetch(
        &self,
        page_index: u32,
        page_size: u32,
        filter: Option<&str>,
    ) -> Result<Option<ListSnapshot>, StoreQueryError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let query = ListQuery {
            // The store contract is 1-based.
            page: page_index + 1,
            limit: page_size,
            search: filter
                .map(str::trim)
                .filter(|needle| !needle.is_empty())
                .map(str::to_string),
        };

        let page = self.backend.query_page(&query).await?;

        let won = self
            .last_applied
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                (request_id > last).then_some(request_id)
            })
            .is_ok();
        if !won {
            debug!(request_id, "discarding superseded fetch result");
            return Ok(None);
        }

        Ok(Some(snapshot_from_page(
            page,
            page_index,
            page_size,
            query.search,
        )))
    }
}

/// Normalizes a raw store page into a snapshot that upholds the cache
/// invariants even against a misbehaving store: unique ids, at most
/// `page_size` items, and a total never below the item count.
fn snapshot_from_page(
    page: ListPage,
    page_index: u32,
    page_size: u32,
    filter: Option<String>,
) -> ListSnapshot {
    let mut seen = HashSet::new();
    let mut items: Vec<_> = page
        .items
        .into_iter()
        .filter(|record| seen.insert(record.id))
        .collect();
    items.truncate(page_size as usize);

    let total_count = page.total_items.max(items.len() as u64);
    ListSnapshot {
        items,
        total_count,
        page_index,
        page_size,
        filter,
        fetched_at: Utc::now(),
    }
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
