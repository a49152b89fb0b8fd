//! One source's incremental run: fetch since the checkpoint, persist the delta,
//! then advance the checkpoint.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use scrapesync_core::{Classification, FailureKind, RunResult};
use scrapesync_sources::SourceScraper;
use scrapesync_storage::ContentStore;
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 14;

pub struct ScraperRunner {
    name: String,
    scraper: Arc<dyn SourceScraper>,
    store: Arc<dyn ContentStore>,
    lookback: ChronoDuration,
}

impl std::fmt::Debug for ScraperRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScraperRunner")
            .field("name", &self.name)
            .field("kind", &self.scraper.kind())
            .field("lookback", &self.lookback)
            .finish()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ScraperRunner {
    /// The runner and its checkpoint are named after the scraper's source id.
    pub fn new(scraper: Arc<dyn SourceScraper>, store: Arc<dyn ContentStore>, lookback_days: i64) -> Self {
        Self {
            name: scraper.source_id().to_string(),
            scraper,
            store,
            lookback: ChronoDuration::days(lookback_days.max(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cutoff used when the source has never completed a run.
    pub fn default_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lookback
    }

    pub async fn run(&self, force_update: bool) -> RunResult {
        let span = info_span!("scraper_run", source = %self.name);
        self.run_inner(force_update).instrument(span).await
    }

    async fn run_inner(&self, force_update: bool) -> RunResult {
        let started = Instant::now();

        let previous = match self.store.load_checkpoint(&self.name).await {
            Ok(checkpoint) => checkpoint.and_then(|c| c.last_check_time),
            Err(err) => {
                error!(error = %err, "loading checkpoint failed");
                return RunResult::failed(
                    &self.name,
                    FailureKind::Checkpoint,
                    format!("loading checkpoint: {err}"),
                    None,
                    elapsed_ms(started),
                );
            }
        };

        let run_start = Utc::now();
        let cutoff = previous.unwrap_or_else(|| self.default_cutoff(run_start));
        info!(%cutoff, force_update, first_run = previous.is_none(), "run started");

        let mut candidates = match self.scraper.fetch_since(cutoff).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "source fetch failed");
                let message = err.to_string();
                self.count_failure(FailureKind::SourceUnreachable, &message).await;
                return RunResult::failed(
                    &self.name,
                    FailureKind::SourceUnreachable,
                    message,
                    previous,
                    elapsed_ms(started),
                );
            }
        };
        candidates.sort_by(|a, b| b.published_date.cmp(&a.published_date));

        let total = candidates.len();
        let mut persisted = 0usize;
        let mut changed = 0usize;
        let mut unchanged = 0usize;
        let mut content_ids = Vec::new();

        for candidate in &candidates {
            let identity = candidate.identity();
            let outcome = match self.store.find_fingerprint(&identity).await {
                Ok(stored) => {
                    let classification = Classification::classify(
                        stored.as_ref().map(|f| f.content_hash.as_str()),
                        &candidate.content_hash,
                    );
                    debug!(external_id = %identity.external_id, ?classification, "classified");
                    match classification {
                        Classification::Unchanged => unchanged += 1,
                        Classification::Changed => changed += 1,
                        Classification::New => {}
                    }
                    if classification == Classification::Unchanged && !force_update {
                        continue;
                    }
                    self.store.upsert_content(candidate, Utc::now()).await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(id) => {
                    persisted += 1;
                    content_ids.push(id);
                }
                Err(err) => {
                    error!(external_id = %identity.external_id, error = %err, "persisting content failed");
                    let message = format!("persisting {}: {err}", identity.external_id);
                    self.count_failure(FailureKind::Persistence, &message).await;
                    let mut result = RunResult::failed(
                        &self.name,
                        FailureKind::Persistence,
                        message,
                        previous,
                        elapsed_ms(started),
                    );
                    result.new_content_count = persisted;
                    result.changed_content_count = changed;
                    result.unchanged_content_count = unchanged;
                    result.total_content_found = total;
                    result.content_ids = content_ids;
                    return result;
                }
            }
        }

        let metadata = json!({
            "successful": true,
            "timestamp": iso(run_start),
            "new_content": persisted,
            "changed_content": changed,
            "total_found": total,
            "forced": force_update,
        });
        let checkpoint = match self.store.record_success(&self.name, run_start, metadata).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(error = %err, "advancing checkpoint failed");
                let mut result = RunResult::failed(
                    &self.name,
                    FailureKind::Checkpoint,
                    format!("advancing checkpoint: {err}"),
                    previous,
                    elapsed_ms(started),
                );
                result.new_content_count = persisted;
                result.total_content_found = total;
                result.content_ids = content_ids;
                return result;
            }
        };

        let message = format!(
            "{persisted} persisted ({changed} changed, {unchanged} unchanged) of {total} found"
        );
        info!(
            persisted,
            changed,
            unchanged,
            total,
            last_check = ?checkpoint.last_check_time,
            "run completed"
        );
        RunResult {
            scraper_name: self.name.clone(),
            success: true,
            new_content_count: persisted,
            changed_content_count: changed,
            unchanged_content_count: unchanged,
            total_content_found: total,
            content_ids,
            message: Some(message),
            error: None,
            failure: None,
            last_check: checkpoint.last_check_time,
            execution_time_ms: elapsed_ms(started),
        }
    }

    /// Count a run the coordinator gave up on (timed out or panicked).
    /// Returns the checkpoint time, which this never changes.
    pub async fn record_abandoned(&self, failure: FailureKind, reason: &str) -> Option<DateTime<Utc>> {
        warn!(source = %self.name, ?failure, reason, "run abandoned");
        self.count_failure(failure, reason).await
    }

    async fn count_failure(&self, failure: FailureKind, message: &str) -> Option<DateTime<Utc>> {
        let metadata = json!({
            "successful": false,
            "timestamp": iso(Utc::now()),
            "error": message,
            "failure": failure,
        });
        match self.store.record_failure(&self.name, metadata).await {
            Ok(checkpoint) => checkpoint.last_check_time,
            Err(err) => {
                error!(source = %self.name, error = %err, "recording failed run");
                None
            }
        }
    }
}
