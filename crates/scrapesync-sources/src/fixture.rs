//! Manually curated items read from a local JSON file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scrapesync_core::ScrapedCandidate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::{SourceError, SourceKind, SourceScraper};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSettings {
    pub path: PathBuf,
    /// Skip items published before the cutoff instead of leaving dedup to the runner.
    #[serde(default)]
    pub respect_cutoff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureItem {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    pub url: String,
    #[serde(default)]
    pub published_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

/// Either a bare array of items or `{"items": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Items(Vec<FixtureItem>),
    Wrapped { items: Vec<FixtureItem> },
}

pub fn parse_fixture(text: &str) -> Result<Vec<FixtureItem>, serde_json::Error> {
    Ok(match serde_json::from_str::<FixtureFile>(text)? {
        FixtureFile::Items(items) | FixtureFile::Wrapped { items } => items,
    })
}

#[derive(Debug, Clone)]
pub struct FixtureScraper {
    source_id: String,
    settings: FixtureSettings,
}

impl FixtureScraper {
    pub fn new(source_id: &str, settings: FixtureSettings) -> Self {
        Self {
            source_id: source_id.to_string(),
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    fn to_candidate(&self, item: FixtureItem, fetched_at: DateTime<Utc>) -> Result<ScrapedCandidate, SourceError> {
        if item.title.trim().is_empty() || item.content.trim().is_empty() {
            return Err(SourceError::Item {
                item: item.id.unwrap_or(item.url),
                message: "empty title or content".into(),
            });
        }
        let mut candidate = ScrapedCandidate::new(
            &self.source_id,
            item.id.as_deref(),
            item.title,
            item.content,
            item.url,
            item.published_date.unwrap_or(fetched_at),
        );
        candidate.metadata = item.metadata;
        candidate
            .metadata
            .entry("content_type")
            .or_insert_with(|| "fixture".into());
        Ok(candidate)
    }
}

#[async_trait]
impl SourceScraper for FixtureScraper {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Fixture
    }

    async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScrapedCandidate>, SourceError> {
        let path = &self.settings.path;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| SourceError::unreachable(&self.source_id, format!("reading {}: {err}", path.display())))?;
        let items = parse_fixture(&text)
            .map_err(|err| SourceError::unreachable(&self.source_id, format!("parsing {}: {err}", path.display())))?;

        let fetched_at = Utc::now();
        let mut candidates = Vec::with_capacity(items.len());
        for item in items {
            if self.settings.respect_cutoff && item.published_date.is_some_and(|date| date < cutoff) {
                debug!(url = %item.url, "fixture item older than cutoff");
                continue;
            }
            match self.to_candidate(item, fetched_at) {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => warn!(error = %err, "skipping fixture item"),
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const ITEMS: &str = r#"{
        "items": [
            {"id": "memo-1", "title": "Rate memo", "content": "Body one", "url": "https://example.test/1",
             "published_date": "2026-02-01T12:00:00Z", "metadata": {"desk": "rates"}},
            {"title": "No id", "content": "Body two", "url": "https://example.test/2"},
            {"title": "  ", "content": "Body three", "url": "https://example.test/3"}
        ]
    }"#;

    fn scraper_for(path: PathBuf, respect_cutoff: bool) -> FixtureScraper {
        FixtureScraper::new("manual", FixtureSettings { path, respect_cutoff })
    }

    #[test]
    fn both_file_shapes_parse() {
        assert_eq!(parse_fixture(ITEMS).unwrap().len(), 3);
        let bare = r#"[{"title": "t", "content": "c", "url": "u"}]"#;
        assert_eq!(parse_fixture(bare).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn items_become_candidates_and_blank_ones_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manual.json");
        std::fs::write(&path, ITEMS).unwrap();

        let candidates = scraper_for(path, false)
            .fetch_since(Utc::now())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, "memo-1");
        assert_eq!(candidates[0].metadata["desk"], "rates");
        assert_eq!(candidates[0].metadata["content_type"], "fixture");
        assert!(candidates[1].identity().is_synthesized());
    }

    #[tokio::test]
    async fn cutoff_is_applied_only_when_requested() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manual.json");
        std::fs::write(&path, ITEMS).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

        let filtered = scraper_for(path.clone(), true).fetch_since(cutoff).await.unwrap();
        assert_eq!(filtered.len(), 1, "undated items are kept");
        let unfiltered = scraper_for(path, false).fetch_since(cutoff).await.unwrap();
        assert_eq!(unfiltered.len(), 2);
    }

    #[tokio::test]
    async fn missing_or_invalid_file_is_unreachable() {
        let dir = tempdir().unwrap();
        let missing = scraper_for(dir.path().join("absent.json"), false);
        assert!(matches!(
            missing.fetch_since(Utc::now()).await,
            Err(SourceError::Unreachable { .. })
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            scraper_for(path, false).fetch_since(Utc::now()).await,
            Err(SourceError::Unreachable { .. })
        ));
    }
}
