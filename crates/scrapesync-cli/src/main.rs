//! scrapesync - incremental multi-source content sync.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scrapesync_storage::SqliteContentStore;
use scrapesync_sync::{
    build_coordinator, build_scheduler, report_markdown, run_locked_sync, LockedSyncOutcome, SyncConfig,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_ALL_FAILED: u8 = 2;
const EXIT_LOCK_CONTENDED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "scrapesync")]
#[command(about = "Incremental multi-source content sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once under the process lock.
    Sync {
        /// Persist every candidate, even unchanged ones.
        #[arg(long)]
        force: bool,
        /// Run sources one after another instead of concurrently.
        #[arg(long)]
        sequential: bool,
        /// Overall deadline in seconds; 0 disables it.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Run a single source without taking the process lock.
    Run {
        source: String,
        #[arg(long)]
        force: bool,
    },
    /// Show checkpoint status per source.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List recently stored content.
    Recent {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        source: Option<String>,
    },
    /// Delete content stored more than `days` ago.
    Cleanup {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Per-source activity within a window.
    Activity {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long)]
        json: bool,
    },
    Migrate,
    /// Markdown listing of the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the locked sync on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrapesync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync {
        force: false,
        sequential: false,
        timeout_secs: None,
    }))
    .await
    {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env();

    match command {
        Commands::Sync {
            force,
            sequential,
            timeout_secs,
        } => {
            if sequential {
                config.parallel = false;
            }
            if let Some(secs) = timeout_secs {
                config.run_timeout_secs = secs;
            }
            let coordinator = build_coordinator(&config).await?;
            match run_locked_sync(&config, &coordinator, config.run_options(force)).await? {
                LockedSyncOutcome::Contended { reason } => {
                    eprintln!("sync skipped: {reason}");
                    return Ok(ExitCode::from(EXIT_LOCK_CONTENDED));
                }
                LockedSyncOutcome::Completed { result, reports } => {
                    let summary = &result.summary;
                    println!(
                        "sync complete: run_id={} sources={} succeeded={} failed={} new={} reports={}",
                        result.run_id,
                        summary.total_scrapers,
                        summary.successful_scrapers,
                        summary.failed_scrapers,
                        summary.total_new_content,
                        reports.run_dir.display()
                    );
                    for (name, run) in &result.scraper_results {
                        if let Some(err) = &run.error {
                            eprintln!("  {name}: {err}");
                        }
                    }
                    if !result.success {
                        return Ok(ExitCode::from(EXIT_ALL_FAILED));
                    }
                }
            }
        }
        Commands::Run { source, force } => {
            let coordinator = build_coordinator(&config).await?;
            let result = coordinator.run_single(&source, force).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                return Ok(ExitCode::from(EXIT_ALL_FAILED));
            }
        }
        Commands::Status { json } => {
            let coordinator = build_coordinator(&config).await?;
            let status = coordinator.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for (name, view) in &status {
                    if view.never_run {
                        println!("{name}: never run");
                        continue;
                    }
                    let last_check = view
                        .last_check_time
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{name}: last_check={last_check} runs={} ok={} rate={:.0}% last_ok={}",
                        view.total_runs,
                        view.successful_runs,
                        view.success_rate * 100.0,
                        view.last_run_successful.unwrap_or(false)
                    );
                }
            }
        }
        Commands::Recent { hours, limit, source } => {
            let coordinator = build_coordinator(&config).await?;
            let records = coordinator.recent_content(hours, limit, source.as_deref()).await?;
            for record in &records {
                println!(
                    "{} [{}] {} {}",
                    record.created_at.to_rfc3339(),
                    record.source,
                    record.title,
                    record.url
                );
            }
            println!("{} record(s) in the last {hours}h", records.len());
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let coordinator = build_coordinator(&config).await?;
            let deleted = coordinator.cleanup_older_than(days).await?;
            println!("deleted {deleted} record(s) older than {days} day(s)");
        }
        Commands::Activity { hours, json } => {
            let coordinator = build_coordinator(&config).await?;
            let activity = coordinator.activity(hours).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&activity)?);
            } else {
                println!("{} record(s) in the last {hours}h", activity.total_records);
                for source in &activity.sources {
                    println!(
                        "{}: {} record(s), latest {}",
                        source.source,
                        source.record_count,
                        source.latest_at.to_rfc3339()
                    );
                    for title in &source.latest_titles {
                        println!("  - {title}");
                    }
                }
                if !activity.trending_keywords.is_empty() {
                    let keywords: Vec<String> = activity
                        .trending_keywords
                        .iter()
                        .map(|k| format!("{}({})", k.keyword, k.count))
                        .collect();
                    println!("trending: {}", keywords.join(", "));
                }
            }
        }
        Commands::Migrate => {
            SqliteContentStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(&config.reports_dir, runs)?);
        }
        Commands::Schedule => {
            let coordinator = Arc::new(build_coordinator(&config).await?);
            let options = config.run_options(false);
            let schedule = config.schedule.clone();
            let mut sched = build_scheduler(config, coordinator, options).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%schedule, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
