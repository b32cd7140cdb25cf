//! External collaborators: listing fetch, content fetch, raw object storage.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FetchResult, ObjectStoreError};
use crate::types::{ListingEntry, TitleFilters};

/// Produces the current candidate set of postings for one source.
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    /// Fetch the listing for `source`, keeping only titles that pass `filters`.
    ///
    /// Failing for one source must not affect any other source.
    async fn fetch_listing(
        &self,
        source: &str,
        filters: &TitleFilters,
    ) -> FetchResult<Vec<ListingEntry>>;
}

/// Retrieves raw document bytes.
///
/// Every error is treated as retryable by the crawl worker.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult<Bytes>;
}

/// Persists raw document bytes and returns an opaque locator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ObjectStoreError>;
}
