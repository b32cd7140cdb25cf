//! Timing configuration for the ingestion pipeline.
//!
//! Policy counts (failure threshold, attempts per job) are constants in
//! [`crate::circuit`]; only the waits are configurable.

use std::time::Duration;

/// Configuration for crawl workers and progress streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Fixed backoff between fetch attempts of one job.
    ///
    /// Default: 1s.
    pub retry_delay: Duration,

    /// Pause after each crawl before the worker returns, bounding the request
    /// rate per source to roughly one per interval.
    ///
    /// Default: 1s.
    pub crawl_throttle: Duration,

    /// How often a progress stream polls run and job state.
    ///
    /// Default: 3s.
    pub stream_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            crawl_throttle: Duration::from_secs(1),
            stream_poll_interval: Duration::from_secs(3),
        }
    }
}

impl PipelineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// No waits at all. Useful in tests.
    pub fn immediate() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            crawl_throttle: Duration::ZERO,
            stream_poll_interval: Duration::ZERO,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_crawl_throttle(mut self, throttle: Duration) -> Self {
        self.crawl_throttle = throttle;
        self
    }

    pub fn with_stream_poll_interval(mut self, interval: Duration) -> Self {
        self.stream_poll_interval = interval;
        self
    }
}
