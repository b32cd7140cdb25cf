//! Test fixtures for creating test data.

use anyhow::Result;
use ingestion::{IngestionStore, ListingEntry, SourceSetting};
use uuid::Uuid;

/// Enable `sources` for a fresh owner and return the owner id.
pub async fn create_test_owner(store: &dyn IngestionStore, sources: &[&str]) -> Result<Uuid> {
    let owner_id = Uuid::new_v4();
    for source in sources {
        store
            .upsert_source(&SourceSetting::enabled(owner_id, *source))
            .await?;
    }
    Ok(owner_id)
}

/// Listing entry whose URL is derived from source and external id.
pub fn listing_entry(source: &str, external_id: &str, title: &str) -> ListingEntry {
    ListingEntry::new(external_id, title, page_url(source, external_id))
}

pub fn page_url(source: &str, external_id: &str) -> String {
    format!("https://{}.test/jobs/{}", source, external_id)
}
