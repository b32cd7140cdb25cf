use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use ingestion::PipelineConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
    pub listing_base_url: String,
    pub raw_content_dir: String,
    pub dispatch_concurrency: usize,
    pub dispatch_poll_interval: Duration,
    pub dedupe_window_secs: i64,
    pub crawl_retry_delay: Duration,
    pub crawl_throttle: Duration,
    pub stream_poll_interval: Duration,
    pub db_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: parse_var("PORT", 8080)?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "ingestion".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|origins| parse_origins(&origins))
                .unwrap_or_default(),
            listing_base_url: env::var("LISTING_BASE_URL")
                .context("LISTING_BASE_URL must be set")?,
            raw_content_dir: env::var("RAW_CONTENT_DIR").unwrap_or_else(|_| "./raw".to_string()),
            dispatch_concurrency: parse_var("DISPATCH_CONCURRENCY", 8)?,
            dispatch_poll_interval: Duration::from_millis(parse_var(
                "DISPATCH_POLL_INTERVAL_MS",
                1000,
            )?),
            dedupe_window_secs: parse_var("DEDUPE_WINDOW_SECS", 86_400)?,
            crawl_retry_delay: Duration::from_millis(parse_var("CRAWL_RETRY_DELAY_MS", 1000)?),
            crawl_throttle: Duration::from_millis(parse_var("CRAWL_THROTTLE_MS", 1000)?),
            stream_poll_interval: Duration::from_millis(parse_var(
                "STREAM_POLL_INTERVAL_MS",
                3000,
            )?),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
        })
    }

    /// Timing knobs handed to the crawl worker and progress streamer.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_retry_delay(self.crawl_retry_delay)
            .with_crawl_throttle(self.crawl_throttle)
            .with_stream_poll_interval(self.stream_poll_interval)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_skips_blanks() {
        assert_eq!(
            parse_origins("https://a.example, ,https://b.example,"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(parse_origins("").is_empty());
    }

    #[test]
    fn test_parse_var_default_and_invalid() {
        assert_eq!(parse_var::<u16>("INGESTION_TEST_UNSET_PORT", 8080).unwrap(), 8080);

        env::set_var("INGESTION_TEST_BAD_NUMBER", "eight");
        assert!(parse_var::<usize>("INGESTION_TEST_BAD_NUMBER", 8).is_err());

        env::set_var("INGESTION_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(parse_var::<usize>("INGESTION_TEST_GOOD_NUMBER", 8).unwrap(), 42);
    }
}
