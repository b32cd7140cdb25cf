//! Per-owner source configuration.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Title filters applied to a source's listing before records are upserted.
///
/// A missing or empty include list keeps every title; otherwise a title must
/// contain at least one include term. Any exclude term rejects the title outright. Matching is
/// case-insensitive substring search, and empty titles never match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleFilters {
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TitleFilters {
    pub fn include(mut self, terms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = Some(terms.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude(mut self, terms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, title: &str) -> bool {
        if title.is_empty() {
            return false;
        }

        let title = title.to_lowercase();

        if self
            .exclude
            .iter()
            .any(|term| title.contains(&term.to_lowercase()))
        {
            return false;
        }

        match self.include.as_deref() {
            Some(terms) if !terms.is_empty() => {
                terms.iter().any(|term| title.contains(&term.to_lowercase()))
            }
            _ => true,
        }
    }
}

/// A source an owner ingests from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSetting {
    pub owner_id: Uuid,
    pub source: String,
    #[serde(default)]
    pub title_filters: TitleFilters,
    pub is_enabled: bool,
}

impl SourceSetting {
    pub fn enabled(owner_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            owner_id,
            source: source.into(),
            title_filters: TitleFilters::default(),
            is_enabled: true,
        }
    }

    pub fn with_filters(mut self, filters: TitleFilters) -> Self {
        self.title_filters = filters;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}
