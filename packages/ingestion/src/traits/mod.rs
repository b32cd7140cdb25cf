//! Core trait abstractions.

pub mod collaborators;
pub mod store;

pub use collaborators::{ContentFetcher, ListingFetcher, ObjectStore};
pub use store::{IngestionStore, JobRecordStore, RunStore, SourceSettingsStore};
