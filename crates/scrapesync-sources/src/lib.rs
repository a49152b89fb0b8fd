//! Source scraper contracts and the concrete upstream sources.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scrapesync_core::ScrapedCandidate;
use scrapesync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fed;
pub mod fixture;
pub mod reddit;

pub use fed::{FedListing, FedReserveScraper, FedReserveSettings};
pub use fixture::{FixtureScraper, FixtureSettings};
pub use reddit::{RedditScraper, RedditSettings};

pub const CRATE_NAME: &str = "scrapesync-sources";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FedReserve,
    Reddit,
    Fixture,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The upstream could not be reached at all; nothing was fetched.
    #[error("source {source_id} unreachable: {message}")]
    Unreachable { source_id: String, message: String },
    /// One item could not be processed; scrapers log and skip these.
    #[error("item {item}: {message}")]
    Item { item: String, message: String },
    #[error("invalid settings for {source_id}: {message}")]
    InvalidSettings { source_id: String, message: String },
}

impl SourceError {
    pub fn unreachable(source_id: &str, message: impl Into<String>) -> Self {
        Self::Unreachable {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

/// One upstream content source.
///
/// `fetch_since` must not touch shared state. `cutoff` is a hint; callers
/// deduplicate exactly by identity and fingerprint.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScrapedCandidate>, SourceError>;
}

/// Text-fetching seam between scrapers and the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url).await?.text())
    }
}

/// Kind-specific settings, tagged by `kind` in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    FedReserve(FedReserveSettings),
    Reddit(RedditSettings),
    Fixture(FixtureSettings),
}

impl SourceSettings {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::FedReserve(_) => SourceKind::FedReserve,
            Self::Reddit(_) => SourceKind::Reddit,
            Self::Fixture(_) => SourceKind::Fixture,
        }
    }
}

pub fn scraper_for_source(
    source_id: &str,
    settings: &SourceSettings,
    fetcher: Arc<dyn PageFetcher>,
) -> Result<Arc<dyn SourceScraper>, SourceError> {
    Ok(match settings {
        SourceSettings::FedReserve(settings) => {
            Arc::new(FedReserveScraper::new(source_id, settings.clone(), fetcher)?)
        }
        SourceSettings::Reddit(settings) => {
            Arc::new(RedditScraper::new(source_id, settings.clone(), fetcher))
        }
        SourceSettings::Fixture(settings) => Arc::new(FixtureScraper::new(source_id, settings.clone())),
    })
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
