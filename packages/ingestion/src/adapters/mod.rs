//! Concrete collaborator implementations.

pub mod fs;
pub mod http;

pub use fs::FsObjectStore;
pub use http::{HttpContentFetcher, HttpListingFetcher};
