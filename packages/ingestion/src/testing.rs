//! Testing utilities including mock collaborators.
//!
//! These let applications exercise the pipeline end to end without network
//! access: listings and page bodies are scripted up front, and every call is
//! recorded for assertions.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{FetchError, FetchResult, ObjectStoreError};
use crate::traits::collaborators::{ContentFetcher, ListingFetcher, ObjectStore};
use crate::types::{ListingEntry, TitleFilters};

// ============================================================================
// Listing Fetcher
// ============================================================================

#[derive(Debug, Clone)]
enum ScriptedListing {
    Entries(Vec<ListingEntry>),
    Failure(String),
}

/// A mock listing fetcher with per-source scripted listings.
///
/// Sources without a script fail with HTTP 404. Title filters are applied to
/// scripted entries the same way the HTTP fetcher applies them.
#[derive(Default, Clone)]
pub struct MockListingFetcher {
    listings: Arc<RwLock<HashMap<String, ScriptedListing>>>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockListingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the listing returned for a source.
    pub fn with_listing(self, source: impl Into<String>, entries: Vec<ListingEntry>) -> Self {
        self.set_listing(source, entries);
        self
    }

    /// Make every listing request for a source fail.
    pub fn with_failure(self, source: impl Into<String>, message: impl Into<String>) -> Self {
        self.listings
            .write()
            .unwrap()
            .insert(source.into(), ScriptedListing::Failure(message.into()));
        self
    }

    /// Replace a source's listing, e.g. between two runs.
    pub fn set_listing(&self, source: impl Into<String>, entries: Vec<ListingEntry>) {
        self.listings
            .write()
            .unwrap()
            .insert(source.into(), ScriptedListing::Entries(entries));
    }

    /// Sources requested so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl ListingFetcher for MockListingFetcher {
    async fn fetch_listing(
        &self,
        source: &str,
        filters: &TitleFilters,
    ) -> FetchResult<Vec<ListingEntry>> {
        self.calls.write().unwrap().push(source.to_string());

        let scripted = self.listings.read().unwrap().get(source).cloned();
        match scripted {
            Some(ScriptedListing::Entries(entries)) => Ok(entries
                .into_iter()
                .filter(|entry| filters.matches(&entry.title))
                .collect()),
            Some(ScriptedListing::Failure(message)) => Err(FetchError::InvalidPayload(message)),
            None => Err(FetchError::Status {
                url: format!("mock://listings/{}", source),
                status: 404,
            }),
        }
    }
}

// ============================================================================
// Content Fetcher
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ScriptedPage {
    body: Option<Bytes>,
    /// Fetches that fail before `body` is served
    failures_left: u32,
}

/// A mock content fetcher serving scripted page bodies by URL.
///
/// Unknown URLs fail with HTTP 404. A URL can be made to fail a fixed number
/// of times before succeeding, or forever.
#[derive(Default, Clone)]
pub struct MockContentFetcher {
    pages: Arc<RwLock<HashMap<String, ScriptedPage>>>,
    fetch_counts: Arc<RwLock<HashMap<String, u32>>>,
}

impl MockContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `url`.
    pub fn with_page(self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.set_page(url, body);
        self
    }

    /// Fail every fetch of `url`.
    pub fn with_failing_url(self, url: impl Into<String>) -> Self {
        self.set_failing_url(url);
        self
    }

    /// Fail the next `times` fetches of `url`, then serve whatever body it has.
    pub fn with_transient_failures(self, url: impl Into<String>, times: u32) -> Self {
        self.pages
            .write()
            .unwrap()
            .entry(url.into())
            .or_default()
            .failures_left = times;
        self
    }

    /// Replace the body served for `url`.
    pub fn set_page(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        let mut pages = self.pages.write().unwrap();
        let page = pages.entry(url.into()).or_default();
        page.body = Some(body.into());
        if page.failures_left == u32::MAX {
            page.failures_left = 0;
        }
    }

    /// Fail every fetch of `url` from now on.
    pub fn set_failing_url(&self, url: impl Into<String>) {
        self.pages.write().unwrap().insert(
            url.into(),
            ScriptedPage {
                body: None,
                failures_left: u32::MAX,
            },
        );
    }

    /// How many times `url` has been fetched.
    pub fn fetch_count(&self, url: &str) -> u32 {
        self.fetch_counts
            .read()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Fetches across all URLs.
    pub fn total_fetches(&self) -> u32 {
        self.fetch_counts.read().unwrap().values().sum()
    }
}

#[async_trait]
impl ContentFetcher for MockContentFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<Bytes> {
        *self
            .fetch_counts
            .write()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let mut pages = self.pages.write().unwrap();
        let Some(page) = pages.get_mut(url) else {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            });
        };

        if page.failures_left > 0 {
            if page.failures_left != u32::MAX {
                page.failures_left -= 1;
            }
            return Err(FetchError::Timeout {
                url: url.to_string(),
            });
        }

        page.body.clone().ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

// ============================================================================
// Object Store
// ============================================================================

/// In-memory object store.
///
/// References are `mem://{key}`. Writes can be switched off to simulate an
/// unavailable backend.
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<RwLock<bool>>,
    puts: Arc<RwLock<usize>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.write().unwrap() = fail;
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Successful and failed put calls.
    pub fn put_count(&self) -> usize {
        *self.puts.read().unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ObjectStoreError> {
        *self.puts.write().unwrap() += 1;
        if *self.fail_writes.read().unwrap() {
            return Err(ObjectStoreError::Backend("object store unavailable".to_string()));
        }
        self.objects
            .write()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(format!("mem://{}", key))
    }
}
