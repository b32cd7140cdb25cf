// Job Posting Ingestion - API Server
//
// HTTP surface for the ingestion pipeline: start, observe and abort runs,
// and manage per-owner source settings. Crawl work is executed by a
// dispatcher running in the same process.

pub mod auth;
pub mod config;
pub mod server;

pub use config::*;
