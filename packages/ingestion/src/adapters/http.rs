//! HTTP implementations of the listing and content fetch collaborators.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult};
use crate::traits::collaborators::{ContentFetcher, ListingFetcher};
use crate::types::{ListingEntry, TitleFilters};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_USER_AGENT: &str = "JobIngestionBot/1.0";

fn map_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Http(Box::new(error))
    }
}

/// Fetches raw posting pages over HTTP.
///
/// Non-2xx responses, timeouts and transport failures all surface as
/// `FetchError` and are retried by the crawl worker.
pub struct HttpContentFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
}

impl Default for HttpContentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContentFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set a custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<Bytes> {
        debug!(url = %url, "HTTP fetch starting");
        let response = self
            .client
            .get(url)
            .header("User-Agent", &self.user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "HTTP request failed");
                map_reqwest_error(url, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|e| map_reqwest_error(url, e))
    }
}

/// Reads source listings from a listing service at `{base_url}/{source}`.
///
/// The service returns a JSON array of `{external_id, title, location, url}`;
/// titles are filtered locally with the owner's [`TitleFilters`].
pub struct HttpListingFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpListingFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn listing_url(&self, source: &str) -> String {
        format!("{}/{}", self.base_url, source)
    }
}

#[async_trait]
impl ListingFetcher for HttpListingFetcher {
    async fn fetch_listing(
        &self,
        source: &str,
        filters: &TitleFilters,
    ) -> FetchResult<Vec<ListingEntry>> {
        let url = self.listing_url(source);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let entries: Vec<ListingEntry> = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidPayload(e.to_string()))?;

        let total = entries.len();
        let kept: Vec<ListingEntry> = entries
            .into_iter()
            .filter(|entry| filters.matches(&entry.title))
            .collect();

        debug!(source = %source, total, kept = kept.len(), "listing fetched");
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_url_trims_trailing_slash() {
        let fetcher = HttpListingFetcher::new("http://listings.local/api/");
        assert_eq!(fetcher.listing_url("acme"), "http://listings.local/api/acme");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        let fetcher = HttpContentFetcher::new().with_timeout(Duration::from_millis(500));
        let result = fetcher.fetch("http://127.0.0.1:9/posting").await;
        assert!(result.is_err());
    }
}
