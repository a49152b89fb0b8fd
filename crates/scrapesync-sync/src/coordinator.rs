//! Registry of runners plus fault-isolated fan-out over them.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use scrapesync_core::{AggregateResult, CheckpointView, ContentRecord, FailureKind, RunResult};
use scrapesync_storage::{ContentStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::runner::ScraperRunner;

const ACTIVITY_TITLES_PER_SOURCE: usize = 3;
const TRENDING_SAMPLE: usize = 100;
const TRENDING_TOP: usize = 10;
const TRENDING_PREVIEW_CHARS: usize = 200;

const FINANCIAL_KEYWORDS: [&str; 18] = [
    "rate", "inflation", "fed", "powell", "earnings", "market", "stock", "trading", "investment",
    "economy", "gdp", "fomc", "monetary", "policy", "bank", "finance", "bull", "bear",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub force_update: bool,
    pub parallel: bool,
    /// Wall-clock budget for the whole `run_all`; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_update: false,
            parallel: true,
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown source {name:?}; available: {available}")]
    UnknownSource { name: String, available: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceActivity {
    pub source: String,
    pub record_count: u64,
    pub latest_at: DateTime<Utc>,
    pub latest_titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub window_hours: i64,
    pub since: DateTime<Utc>,
    pub total_records: u64,
    pub sources: Vec<SourceActivity>,
    /// Financial terms in the titles and content previews of the latest records.
    pub trending_keywords: Vec<KeywordCount>,
}

/// Counts [`FINANCIAL_KEYWORDS`] as whole lowercase words; most frequent first,
/// ties alphabetical, at most `top` entries.
pub fn trending_keywords<'a>(texts: impl IntoIterator<Item = &'a str>, top: usize) -> Vec<KeywordCount> {
    let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
    for text in texts {
        for word in text.split(|c: char| !c.is_ascii_alphabetic()) {
            let word = word.to_ascii_lowercase();
            if let Some(keyword) = FINANCIAL_KEYWORDS.iter().find(|k| **k == word) {
                *counts.entry(*keyword).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<KeywordCount> = counts
        .into_iter()
        .map(|(keyword, count)| KeywordCount {
            keyword: keyword.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.keyword.cmp(&b.keyword)));
    ranked.truncate(top);
    ranked
}

pub struct SyncCoordinator {
    runners: BTreeMap<String, Arc<ScraperRunner>>,
    store: Arc<dyn ContentStore>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("runners", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            runners: BTreeMap::new(),
            store,
        }
    }

    /// Registers a runner under its name, replacing and returning any previous one.
    pub fn register(&mut self, runner: ScraperRunner) -> Option<Arc<ScraperRunner>> {
        let name = runner.name().to_string();
        self.runners.insert(name, Arc::new(runner))
    }

    pub fn names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub async fn run_all(&self, options: RunOptions) -> AggregateResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", run_id = %run_id);
        self.run_all_inner(run_id, options).instrument(span).await
    }

    async fn run_all_inner(&self, run_id: Uuid, options: RunOptions) -> AggregateResult {
        let execution_start = Utc::now();
        let deadline = options.timeout.map(|budget| tokio::time::Instant::now() + budget);
        info!(
            sources = self.runners.len(),
            parallel = options.parallel,
            force_update = options.force_update,
            "sync run started"
        );

        let mut results = BTreeMap::new();
        if options.parallel {
            let started = Instant::now();
            let handles: Vec<_> = self
                .runners
                .iter()
                .map(|(name, runner)| (name, runner, spawn_run(runner, options.force_update)))
                .collect();
            for (name, runner, handle) in handles {
                let result = collect(name, runner, handle, deadline, started).await;
                results.insert(name.clone(), result);
            }
        } else {
            for (name, runner) in &self.runners {
                let started = Instant::now();
                let result = if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    let reason = "not started before the run deadline";
                    let last_check = runner.record_abandoned(FailureKind::TimedOut, reason).await;
                    RunResult::failed(name, FailureKind::TimedOut, reason, last_check, 0)
                } else {
                    let handle = spawn_run(runner, options.force_update);
                    collect(name, runner, handle, deadline, started).await
                };
                results.insert(name.clone(), result);
            }
        }

        let aggregate = AggregateResult::new(run_id, results, execution_start, Utc::now());
        info!(
            successful = aggregate.summary.successful_scrapers,
            failed = aggregate.summary.failed_scrapers,
            new_content = aggregate.summary.total_new_content,
            "sync run finished"
        );
        aggregate
    }

    pub async fn run_single(&self, name: &str, force_update: bool) -> Result<RunResult, SyncError> {
        let runner = self.runners.get(name).ok_or_else(|| SyncError::UnknownSource {
            name: name.to_string(),
            available: self.names().join(", "),
        })?;
        let handle = spawn_run(runner, force_update);
        Ok(collect(name, runner, handle, None, Instant::now()).await)
    }

    /// Checkpoint view for every registered or previously seen source.
    pub async fn status(&self) -> Result<BTreeMap<String, CheckpointView>, StoreError> {
        let mut status: BTreeMap<String, CheckpointView> = self
            .runners
            .keys()
            .map(|name| (name.clone(), CheckpointView::never_run()))
            .collect();
        for checkpoint in self.store.list_checkpoints().await? {
            status.insert(checkpoint.name.clone(), CheckpointView::from(&checkpoint));
        }
        Ok(status)
    }

    pub async fn recent_content(
        &self,
        hours: i64,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ContentRecord>, StoreError> {
        let since = Utc::now() - ChronoDuration::hours(hours.max(0));
        self.store.recent_content(since, limit, source).await
    }

    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(days.max(0));
        let deleted = self.store.delete_content_before(cutoff).await?;
        info!(days, deleted, "old content removed");
        Ok(deleted)
    }

    pub async fn activity(&self, hours: i64) -> Result<ActivitySummary, StoreError> {
        let since = Utc::now() - ChronoDuration::hours(hours.max(0));
        let counts = self.store.source_activity(since).await?;

        let mut sources = Vec::with_capacity(counts.len());
        for count in counts {
            let latest_titles = self
                .store
                .recent_content(since, ACTIVITY_TITLES_PER_SOURCE, Some(&count.source))
                .await?
                .into_iter()
                .map(|record| record.title)
                .collect();
            sources.push(SourceActivity {
                source: count.source,
                record_count: count.record_count,
                latest_at: count.latest_created_at,
                latest_titles,
            });
        }

        let sample = self.store.recent_content(since, TRENDING_SAMPLE, None).await?;
        let previews: Vec<String> = sample
            .iter()
            .map(|record| {
                let preview: String = record.raw_content.chars().take(TRENDING_PREVIEW_CHARS).collect();
                format!("{} {preview}", record.title)
            })
            .collect();

        Ok(ActivitySummary {
            window_hours: hours,
            since,
            total_records: sources.iter().map(|s| s.record_count).sum(),
            sources,
            trending_keywords: trending_keywords(previews.iter().map(String::as_str), TRENDING_TOP),
        })
    }
}

fn spawn_run(runner: &Arc<ScraperRunner>, force_update: bool) -> JoinHandle<RunResult> {
    let runner = Arc::clone(runner);
    tokio::spawn(async move { runner.run(force_update).await }.in_current_span())
}

/// Waits for one runner task, turning panics and deadline overruns into failed results.
///
/// A task still running at the deadline is aborted and awaited. A run that
/// completed in that window is reported as it finished. Abort only stops the
/// task at an await point: a checkpoint write already handed to the database
/// may still commit, so the reported `last_check` is read back from the store
/// rather than assumed unchanged.
async fn collect(
    name: &str,
    runner: &ScraperRunner,
    mut handle: JoinHandle<RunResult>,
    deadline: Option<tokio::time::Instant>,
    started: Instant,
) -> RunResult {
    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                if let Ok(result) = handle.await {
                    info!(source = name, "run finished as the deadline passed");
                    return result;
                }
                warn!(source = name, "run exceeded the deadline; task aborted");
                let reason = "run exceeded the deadline";
                let last_check = runner.record_abandoned(FailureKind::TimedOut, reason).await;
                return RunResult::failed(name, FailureKind::TimedOut, reason, last_check, elapsed_ms(started));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(result) => result,
        Err(err) => {
            let reason = if err.is_panic() {
                format!("worker panicked: {}", panic_message(err.into_panic().as_ref()))
            } else {
                "worker task was cancelled".to_string()
            };
            error!(source = name, reason = %reason, "run failed in worker");
            let last_check = runner.record_abandoned(FailureKind::WorkerFault, &reason).await;
            RunResult::failed(name, FailureKind::WorkerFault, reason, last_check, elapsed_ms(started))
        }
    }
}
