//! Sync orchestration: configuration, source registry, runners, the coordinator,
//! run reports and the cron scheduler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use scrapesync_core::{AggregateResult, FailureKind};
use scrapesync_sources::{scraper_for_source, PageFetcher, SourceSettings};
use scrapesync_storage::{
    ContentStore, HttpClientConfig, HttpFetcher, LockError, ProcessLock, ReportStore, SqliteContentStore,
};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod coordinator;
pub mod runner;

pub use coordinator::{
    trending_keywords, ActivitySummary, KeywordCount, RunOptions, SourceActivity, SyncCoordinator, SyncError,
};
pub use runner::{ScraperRunner, DEFAULT_LOOKBACK_DAYS};

pub const CRATE_NAME: &str = "scrapesync-sync";

pub const RUN_RESULT_FILE: &str = "run_result.json";
pub const SUMMARY_FILE: &str = "summary.md";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub lookback_days: Option<i64>,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if source.source_id.trim().is_empty() {
                bail!("source registry contains an empty source_id");
            }
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {:?} in source registry", source.source_id);
            }
        }
        Ok(registry)
    }

    /// Loads `sources.yaml`; relative fixture paths are resolved against its directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut registry =
            Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))?;
        if let Some(base) = path.parent() {
            registry.resolve_relative_paths(base);
        }
        Ok(registry)
    }

    pub fn resolve_relative_paths(&mut self, base: &Path) {
        for source in &mut self.sources {
            if let SourceSettings::Fixture(fixture) = &mut source.settings {
                if fixture.path.is_relative() {
                    fixture.path = base.join(&fixture.path);
                }
            }
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub lookback_days: i64,
    pub retention_days: i64,
    pub parallel: bool,
    pub schedule: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://scrapesync.db".to_string(),
            sources_file: PathBuf::from("./sources.yaml"),
            reports_dir: PathBuf::from("./reports"),
            lock_file: PathBuf::from("./scrapesync.lock"),
            user_agent: "scrapesync/0.1".to_string(),
            http_timeout_secs: 20,
            run_timeout_secs: 300,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            retention_days: 30,
            parallel: true,
            schedule: "0 */30 9-17 * * Mon-Fri".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            sources_file: std::env::var("SCRAPESYNC_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            reports_dir: std::env::var("SCRAPESYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            lock_file: std::env::var("SCRAPESYNC_LOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.lock_file),
            user_agent: std::env::var("SCRAPESYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("SCRAPESYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            run_timeout_secs: env_or("SCRAPESYNC_RUN_TIMEOUT_SECS", defaults.run_timeout_secs),
            lookback_days: env_or("SCRAPESYNC_LOOKBACK_DAYS", defaults.lookback_days),
            retention_days: env_or("SCRAPESYNC_RETENTION_DAYS", defaults.retention_days),
            parallel: env_flag("SCRAPESYNC_PARALLEL", defaults.parallel),
            schedule: std::env::var("SCRAPESYNC_SCHEDULE").unwrap_or(defaults.schedule),
        }
    }

    pub fn run_options(&self, force_update: bool) -> RunOptions {
        RunOptions {
            force_update,
            parallel: self.parallel,
            timeout: (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs)),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// Registers a runner for every enabled source in the registry.
pub fn register_sources(
    coordinator: &mut SyncCoordinator,
    registry: &SourceRegistry,
    fetcher: Arc<dyn PageFetcher>,
    default_lookback_days: i64,
) -> Result<usize> {
    let mut registered = 0usize;
    for source in registry.enabled() {
        let scraper = scraper_for_source(&source.source_id, &source.settings, fetcher.clone())
            .with_context(|| format!("building scraper for {}", source.source_id))?;
        let lookback = source.lookback_days.unwrap_or(default_lookback_days);
        coordinator.register(ScraperRunner::new(scraper, coordinator.store().clone(), lookback));
        info!(
            source = %source.source_id,
            display_name = source.display_name.as_deref().unwrap_or(""),
            kind = ?source.settings.kind(),
            lookback_days = lookback,
            "source registered"
        );
        registered += 1;
    }
    Ok(registered)
}

pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ContentStore>> {
    let store = SqliteContentStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening content store {}", config.database_url))?;
    Ok(Arc::new(store))
}

pub async fn build_coordinator(config: &SyncConfig) -> Result<SyncCoordinator> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let store = open_store(config).await?;
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let mut coordinator = SyncCoordinator::new(store);
    let registered = register_sources(&mut coordinator, &registry, fetcher, config.lookback_days)?;
    if registered == 0 {
        warn!(path = %config.sources_file.display(), "no enabled sources");
    }
    Ok(coordinator)
}

#[derive(Debug, Clone)]
pub struct RunReportPaths {
    pub run_dir: PathBuf,
    pub run_result: PathBuf,
    pub summary: PathBuf,
}

pub fn render_summary_markdown(result: &AggregateResult) -> String {
    let summary = &result.summary;
    let mut lines = vec![
        "# scrapesync run summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", result.run_id),
        format!("- Started: {}", summary.execution_start),
        format!("- Finished: {}", summary.execution_end),
        format!(
            "- Status: {}",
            if result.success { "success" } else { "all sources failed" }
        ),
        format!(
            "- Sources: {} total, {} succeeded, {} failed",
            summary.total_scrapers, summary.successful_scrapers, summary.failed_scrapers
        ),
        format!("- New content: {}", summary.total_new_content),
        format!("- Content found: {}", summary.total_content_found),
        format!(
            "- Execution time: {} ms (average {:.1} ms per source)",
            summary.total_execution_time_ms, summary.average_scraper_time_ms
        ),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| source | status | new | changed | unchanged | found | ms | detail |".to_string(),
        "|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for (name, run) in &result.scraper_results {
        let status = match run.failure {
            None if run.success => "ok".to_string(),
            Some(FailureKind::SourceUnreachable) => "unreachable".to_string(),
            Some(FailureKind::Persistence) => "persistence error".to_string(),
            Some(FailureKind::Checkpoint) => "checkpoint error".to_string(),
            Some(FailureKind::WorkerFault) => "worker fault".to_string(),
            Some(FailureKind::TimedOut) => "timed out".to_string(),
            None => "failed".to_string(),
        };
        let detail = run
            .error
            .as_deref()
            .or(run.message.as_deref())
            .unwrap_or("")
            .replace('|', "\\|");
        lines.push(format!(
            "| {name} | {status} | {} | {} | {} | {} | {} | {detail} |",
            run.new_content_count,
            run.changed_content_count,
            run.unchanged_content_count,
            run.total_content_found,
            run.execution_time_ms
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_run_reports(reports: &ReportStore, result: &AggregateResult) -> Result<RunReportPaths> {
    let json = serde_json::to_vec_pretty(result).context("serializing run result")?;
    let run_result = reports
        .write_report(result.run_id, RUN_RESULT_FILE, &json)
        .await?
        .absolute_path;
    let summary = reports
        .write_report(result.run_id, SUMMARY_FILE, render_summary_markdown(result).as_bytes())
        .await?
        .absolute_path;
    Ok(RunReportPaths {
        run_dir: reports.run_dir(result.run_id),
        run_result,
        summary,
    })
}

#[derive(Debug)]
pub enum LockedSyncOutcome {
    Completed {
        result: AggregateResult,
        reports: RunReportPaths,
    },
    /// Another instance holds the process lock; nothing ran.
    Contended { reason: String },
}

/// Lock, run every source, write reports, release.
pub async fn run_locked_sync(
    config: &SyncConfig,
    coordinator: &SyncCoordinator,
    options: RunOptions,
) -> Result<LockedSyncOutcome> {
    let lock = match ProcessLock::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(err @ (LockError::Held { .. } | LockError::Busy { .. })) => {
            warn!(error = %err, "sync skipped: lock contention");
            return Ok(LockedSyncOutcome::Contended {
                reason: err.to_string(),
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("acquiring {}", config.lock_file.display()));
        }
    };

    let result = coordinator.run_all(options).await;
    let reports = write_run_reports(&ReportStore::new(&config.reports_dir), &result).await;
    lock.release();

    let reports = reports?;
    info!(
        run_id = %result.run_id,
        success = result.success,
        reports = %reports.run_dir.display(),
        "sync complete"
    );
    Ok(LockedSyncOutcome::Completed { result, reports })
}

/// Cron scheduler running the locked sync on each tick; contended ticks are skipped.
pub async fn build_scheduler(
    config: SyncConfig,
    coordinator: Arc<SyncCoordinator>,
    options: RunOptions,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match run_locked_sync(&config, &coordinator, options).await {
                Ok(LockedSyncOutcome::Completed { result, .. }) => {
                    info!(run_id = %result.run_id, success = result.success, "scheduled sync finished");
                }
                Ok(LockedSyncOutcome::Contended { reason }) => {
                    warn!(%reason, "scheduled sync skipped");
                }
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[derive(Debug, Deserialize)]
struct ReportHeader {
    run_id: Uuid,
    success: bool,
    summary: scrapesync_core::AggregateSummary,
}

/// Markdown index of the most recent run report directories.
pub fn report_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join(RUN_RESULT_FILE);
            let text = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str::<ReportHeader>(&text) {
                Ok(header) => Some((entry.path(), header)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable run report");
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| b.1.summary.execution_start.cmp(&a.1.summary.execution_start));

    let mut lines = vec!["# scrapesync reports".to_string(), String::new()];
    for (dir, header) in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", header.run_id));
        lines.push(format!("- started: {}", header.summary.execution_start));
        lines.push(format!(
            "- status: {}",
            if header.success { "success" } else { "failed" }
        ));
        lines.push(format!(
            "- sources: {}/{} succeeded",
            header.summary.successful_scrapers, header.summary.total_scrapers
        ));
        lines.push(format!("- new content: {}", header.summary.total_new_content));
        lines.push(format!("- result: `{}`", dir.join(RUN_RESULT_FILE).display()));
        let summary = dir.join(SUMMARY_FILE);
        if summary.exists() {
            lines.push(format!("- summary: `{}`", summary.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
