//! Core domain model, content identity and change fingerprints for scrapesync.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scrapesync-core";

/// Prefix of external ids synthesized for sources without a stable upstream id.
pub const SYNTHESIZED_ID_PREFIX: &str = "url:";

/// Change fingerprint: lowercase SHA-256 hex over the UTF-8 bytes.
pub fn content_hash(content: &str) -> String {
    content_hash_bytes(content.as_bytes())
}

pub fn content_hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic external id for an item that only has a URL.
pub fn synthesized_external_id(url: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, url.trim().as_bytes());
    format!("{SYNTHESIZED_ID_PREFIX}{id}")
}

/// Key deciding whether two candidates refer to the same item across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentIdentity {
    pub source: String,
    pub external_id: String,
}

impl ContentIdentity {
    /// Every item gets an external id: the upstream one when present and
    /// non-blank, otherwise one synthesized from the URL.
    pub fn resolve(source: &str, external_id: Option<&str>, url: &str) -> Self {
        let external_id = match external_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => synthesized_external_id(url),
        };
        Self {
            source: source.to_string(),
            external_id,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        self.external_id.starts_with(SYNTHESIZED_ID_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

impl Classification {
    pub fn classify(stored_hash: Option<&str>, candidate_hash: &str) -> Self {
        match stored_hash {
            None => Self::New,
            Some(stored) if stored == candidate_hash => Self::Unchanged,
            Some(_) => Self::Changed,
        }
    }
}

/// Transient item produced by a source fetch, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedCandidate {
    pub id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub published_date: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub content_hash: String,
}

impl ScrapedCandidate {
    /// Builds a candidate, resolving its identity and fingerprinting `content`.
    pub fn new(
        source: &str,
        external_id: Option<&str>,
        title: impl Into<String>,
        content: impl Into<String>,
        url: impl Into<String>,
        published_date: DateTime<Utc>,
    ) -> Self {
        let url = url.into();
        let content = content.into();
        let identity = ContentIdentity::resolve(source, external_id, &url);
        Self {
            id: identity.external_id,
            title: title.into(),
            content_hash: content_hash(&content),
            content,
            url,
            published_date,
            source: source.to_string(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn identity(&self) -> ContentIdentity {
        ContentIdentity::resolve(&self.source, Some(&self.id), &self.url)
    }
}

/// Persisted content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: i64,
    pub external_id: String,
    pub source: String,
    pub url: String,
    pub title: String,
    pub raw_content: String,
    pub processed_content: Option<String>,
    pub metadata: JsonValue,
    pub content_hash: String,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted "last synced up to" marker for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperCheckpoint {
    pub name: String,
    pub last_check_time: Option<DateTime<Utc>>,
    pub run_metadata: JsonValue,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only status projection of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointView {
    pub last_check_time: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub success_rate: f64,
    pub last_run_successful: Option<bool>,
    pub never_run: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CheckpointView {
    pub fn never_run() -> Self {
        Self {
            last_check_time: None,
            total_runs: 0,
            successful_runs: 0,
            success_rate: 0.0,
            last_run_successful: None,
            never_run: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl From<&ScraperCheckpoint> for CheckpointView {
    fn from(checkpoint: &ScraperCheckpoint) -> Self {
        let success_rate = if checkpoint.total_runs > 0 {
            checkpoint.successful_runs as f64 / checkpoint.total_runs as f64
        } else {
            0.0
        };
        Self {
            last_check_time: checkpoint.last_check_time,
            total_runs: checkpoint.total_runs,
            successful_runs: checkpoint.successful_runs,
            success_rate,
            last_run_successful: checkpoint
                .run_metadata
                .get("successful")
                .and_then(JsonValue::as_bool),
            never_run: false,
            created_at: Some(checkpoint.created_at),
            updated_at: Some(checkpoint.updated_at),
        }
    }
}

/// Why a per-source run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnreachable,
    Persistence,
    Checkpoint,
    WorkerFault,
    TimedOut,
}

/// Structured outcome of one source run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scraper_name: String,
    pub success: bool,
    pub new_content_count: usize,
    pub changed_content_count: usize,
    pub unchanged_content_count: usize,
    pub total_content_found: usize,
    pub content_ids: Vec<i64>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub last_check: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
}

impl RunResult {
    pub fn failed(
        scraper_name: &str,
        failure: FailureKind,
        error: impl Into<String>,
        last_check: Option<DateTime<Utc>>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            scraper_name: scraper_name.to_string(),
            success: false,
            new_content_count: 0,
            changed_content_count: 0,
            unchanged_content_count: 0,
            total_content_found: 0,
            content_ids: Vec::new(),
            message: None,
            error: Some(error.into()),
            failure: Some(failure),
            last_check,
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub total_scrapers: usize,
    pub successful_scrapers: usize,
    pub failed_scrapers: usize,
    pub total_new_content: usize,
    pub total_content_found: usize,
    pub total_execution_time_ms: u64,
    pub average_scraper_time_ms: f64,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
}

impl AggregateSummary {
    pub fn from_results(
        results: &BTreeMap<String, RunResult>,
        execution_start: DateTime<Utc>,
        execution_end: DateTime<Utc>,
    ) -> Self {
        let successful_scrapers = results.values().filter(|r| r.success).count();
        let total_time: u64 = results.values().map(|r| r.execution_time_ms).sum();
        let average_scraper_time_ms = if results.is_empty() {
            0.0
        } else {
            total_time as f64 / results.len() as f64
        };
        Self {
            total_scrapers: results.len(),
            successful_scrapers,
            failed_scrapers: results.len() - successful_scrapers,
            total_new_content: results.values().map(|r| r.new_content_count).sum(),
            total_content_found: results.values().map(|r| r.total_content_found).sum(),
            total_execution_time_ms: (execution_end - execution_start)
                .num_milliseconds()
                .max(0) as u64,
            average_scraper_time_ms,
            execution_start,
            execution_end,
        }
    }
}

/// Outcome of one coordinated run over every registered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub run_id: Uuid,
    /// True when at least one source succeeded.
    pub success: bool,
    pub summary: AggregateSummary,
    pub scraper_results: BTreeMap<String, RunResult>,
}

impl AggregateResult {
    pub fn new(
        run_id: Uuid,
        scraper_results: BTreeMap<String, RunResult>,
        execution_start: DateTime<Utc>,
        execution_end: DateTime<Utc>,
    ) -> Self {
        let summary = AggregateSummary::from_results(&scraper_results, execution_start, execution_end);
        Self {
            run_id,
            success: summary.successful_scrapers > 0,
            summary,
            scraper_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().unwrap()
    }

    fn ok_result(name: &str, new: usize, found: usize, ms: u64) -> RunResult {
        RunResult {
            scraper_name: name.to_string(),
            success: true,
            new_content_count: new,
            changed_content_count: 0,
            unchanged_content_count: found - new,
            total_content_found: found,
            content_ids: Vec::new(),
            message: None,
            error: None,
            failure: None,
            last_check: Some(ts()),
            execution_time_ms: ms,
        }
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        assert_eq!(
            content_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn identity_prefers_upstream_id() {
        let identity = ContentIdentity::resolve("reddit_wsb", Some("wsb_abc"), "https://x/1");
        assert_eq!(identity.external_id, "wsb_abc");
        assert!(!identity.is_synthesized());
    }

    #[test]
    fn identity_is_synthesized_from_url_when_missing_or_blank() {
        let a = ContentIdentity::resolve("fed_reserve", None, "https://www.federalreserve.gov/a.htm");
        let b = ContentIdentity::resolve("fed_reserve", Some("  "), "https://www.federalreserve.gov/a.htm");
        let c = ContentIdentity::resolve("fed_reserve", None, "https://www.federalreserve.gov/b.htm");
        assert!(a.is_synthesized());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn candidate_keeps_synthesized_identity_on_roundtrip() {
        let candidate = ScrapedCandidate::new(
            "fed_reserve",
            None,
            "FOMC statement",
            "body",
            "https://www.federalreserve.gov/x.htm",
            ts(),
        );
        assert!(candidate.id.starts_with(SYNTHESIZED_ID_PREFIX));
        assert_eq!(candidate.identity().external_id, candidate.id);
        assert_eq!(candidate.content_hash, content_hash("body"));
    }

    #[test]
    fn classification_covers_new_changed_unchanged() {
        assert_eq!(Classification::classify(None, "a"), Classification::New);
        assert_eq!(Classification::classify(Some("a"), "a"), Classification::Unchanged);
        assert_eq!(Classification::classify(Some("a"), "b"), Classification::Changed);
    }

    #[test]
    fn checkpoint_view_derives_success_rate() {
        let checkpoint = ScraperCheckpoint {
            name: "fed_reserve".into(),
            last_check_time: Some(ts()),
            run_metadata: serde_json::json!({"successful": false}),
            total_runs: 4,
            successful_runs: 3,
            created_at: ts(),
            updated_at: ts(),
        };
        let view = CheckpointView::from(&checkpoint);
        assert!((view.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(view.last_run_successful, Some(false));
        assert!(!view.never_run);
        assert_eq!(CheckpointView::never_run().success_rate, 0.0);
    }

    #[test]
    fn aggregate_sums_counts_and_succeeds_on_any_success() {
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), ok_result("a", 3, 4, 100));
        results.insert("b".to_string(), ok_result("b", 5, 9, 300));
        results.insert(
            "c".to_string(),
            RunResult::failed("c", FailureKind::SourceUnreachable, "down", None, 50),
        );
        let start = ts();
        let end = start + chrono::Duration::milliseconds(400);
        let aggregate = AggregateResult::new(Uuid::new_v4(), results, start, end);

        assert!(aggregate.success);
        assert_eq!(aggregate.summary.total_new_content, 8);
        assert_eq!(aggregate.summary.total_content_found, 13);
        assert_eq!(aggregate.summary.successful_scrapers, 2);
        assert_eq!(aggregate.summary.failed_scrapers, 1);
        assert_eq!(aggregate.summary.total_execution_time_ms, 400);
        assert!((aggregate.summary.average_scraper_time_ms - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_fails_when_nothing_succeeds() {
        let mut results = BTreeMap::new();
        results.insert(
            "a".to_string(),
            RunResult::failed("a", FailureKind::TimedOut, "timed out", None, 0),
        );
        let aggregate = AggregateResult::new(Uuid::new_v4(), results, ts(), ts());
        assert!(!aggregate.success);
    }
}
