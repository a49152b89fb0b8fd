//! Relational store for scraper checkpoints and content records.
//!
//! Every operation is a single statement or a short transaction; no lock is
//! held across a whole sync run. Timestamps are stored as fixed-width RFC 3339
//! UTC text (microsecond precision) so that SQL string comparison orders them.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use scrapesync_core::{ContentIdentity, ContentRecord, ScrapedCandidate, ScraperCheckpoint};
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CHECKPOINT_COLUMNS: &str =
    "name, last_check_time, run_metadata, total_runs, successful_runs, created_at, updated_at";

const CONTENT_COLUMNS: &str = "id, external_id, source, url, target_content, raw_content, \
     processed_content, extra_metadata, content_hash, published_at, scraped_at, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid json in column {column}: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Identity lookup result used for change classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub id: i64,
    pub content_hash: String,
}

/// Per-source record count over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCount {
    pub source: String,
    pub record_count: u64,
    pub latest_created_at: DateTime<Utc>,
}

/// Checkpoint and content persistence, injected into runners and the coordinator.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<ScraperCheckpoint>, StoreError>;

    async fn list_checkpoints(&self) -> Result<Vec<ScraperCheckpoint>, StoreError>;

    /// Count a successful run and move `last_check_time` forward to `check_time`.
    /// An earlier `check_time` never moves the stored value backwards.
    async fn record_success(
        &self,
        name: &str,
        check_time: DateTime<Utc>,
        run_metadata: JsonValue,
    ) -> Result<ScraperCheckpoint, StoreError>;

    /// Count a failed run; `last_check_time` is left as is.
    async fn record_failure(
        &self,
        name: &str,
        run_metadata: JsonValue,
    ) -> Result<ScraperCheckpoint, StoreError>;

    async fn find_fingerprint(
        &self,
        identity: &ContentIdentity,
    ) -> Result<Option<StoredFingerprint>, StoreError>;

    /// Insert or overwrite the record for the candidate's identity; returns the row id.
    async fn upsert_content(
        &self,
        candidate: &ScrapedCandidate,
        scraped_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn get_content(&self, id: i64) -> Result<Option<ContentRecord>, StoreError>;

    async fn recent_content(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ContentRecord>, StoreError>;

    async fn delete_content_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Sources with records created since `since`, busiest first.
    async fn source_activity(&self, since: DateTime<Utc>) -> Result<Vec<SourceCount>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteContentStore {
    pool: SqlitePool,
}

impl SqliteContentStore {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "content store ready");
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}

fn decode_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(decode_ts).transpose()
}

fn decode_json(column: &'static str, value: &str) -> Result<JsonValue, StoreError> {
    serde_json::from_str(value).map_err(|source| StoreError::Json { column, source })
}

fn encode_json(column: &'static str, value: &impl serde::Serialize) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Json { column, source })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<ScraperCheckpoint, StoreError> {
    let metadata: String = row.try_get("run_metadata")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let total_runs: i64 = row.try_get("total_runs")?;
    let successful_runs: i64 = row.try_get("successful_runs")?;
    Ok(ScraperCheckpoint {
        name: row.try_get("name")?,
        last_check_time: decode_optional_ts(row.try_get("last_check_time")?)?,
        run_metadata: decode_json("run_metadata", &metadata)?,
        total_runs: total_runs.max(0) as u64,
        successful_runs: successful_runs.max(0) as u64,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

fn content_from_row(row: &SqliteRow) -> Result<ContentRecord, StoreError> {
    let metadata: String = row.try_get("extra_metadata")?;
    let scraped_at: String = row.try_get("scraped_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(ContentRecord {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        title: row.try_get("target_content")?,
        raw_content: row.try_get("raw_content")?,
        processed_content: row.try_get("processed_content")?,
        metadata: decode_json("extra_metadata", &metadata)?,
        content_hash: row.try_get("content_hash")?,
        published_at: decode_optional_ts(row.try_get("published_at")?)?,
        scraped_at: decode_ts(&scraped_at)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

fn source_count_from_row(row: &SqliteRow) -> Result<SourceCount, StoreError> {
    let record_count: i64 = row.try_get("record_count")?;
    let latest: String = row.try_get("latest_created_at")?;
    Ok(SourceCount {
        source: row.try_get("source")?,
        record_count: record_count.max(0) as u64,
        latest_created_at: decode_ts(&latest)?,
    })
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<ScraperCheckpoint>, StoreError> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM scraper_checkpoints WHERE name = ?1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn list_checkpoints(&self) -> Result<Vec<ScraperCheckpoint>, StoreError> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM scraper_checkpoints ORDER BY name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn record_success(
        &self,
        name: &str,
        check_time: DateTime<Utc>,
        run_metadata: JsonValue,
    ) -> Result<ScraperCheckpoint, StoreError> {
        let now = encode_ts(Utc::now());
        let sql = format!(
            r#"INSERT INTO scraper_checkpoints
                   (name, last_check_time, run_metadata, total_runs, successful_runs, created_at, updated_at)
               VALUES (?1, ?2, ?3, 1, 1, ?4, ?4)
               ON CONFLICT(name) DO UPDATE SET
                   last_check_time = CASE
                       WHEN scraper_checkpoints.last_check_time IS NULL
                         OR scraper_checkpoints.last_check_time < excluded.last_check_time
                       THEN excluded.last_check_time
                       ELSE scraper_checkpoints.last_check_time
                   END,
                   run_metadata = excluded.run_metadata,
                   total_runs = scraper_checkpoints.total_runs + 1,
                   successful_runs = scraper_checkpoints.successful_runs + 1,
                   updated_at = excluded.updated_at
               RETURNING {CHECKPOINT_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(encode_ts(check_time))
            .bind(encode_json("run_metadata", &run_metadata)?)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        let checkpoint = checkpoint_from_row(&row)?;
        debug!(name, last_check_time = ?checkpoint.last_check_time, "checkpoint advanced");
        Ok(checkpoint)
    }

    async fn record_failure(
        &self,
        name: &str,
        run_metadata: JsonValue,
    ) -> Result<ScraperCheckpoint, StoreError> {
        let now = encode_ts(Utc::now());
        let sql = format!(
            r#"INSERT INTO scraper_checkpoints
                   (name, last_check_time, run_metadata, total_runs, successful_runs, created_at, updated_at)
               VALUES (?1, NULL, ?2, 1, 0, ?3, ?3)
               ON CONFLICT(name) DO UPDATE SET
                   run_metadata = excluded.run_metadata,
                   total_runs = scraper_checkpoints.total_runs + 1,
                   updated_at = excluded.updated_at
               RETURNING {CHECKPOINT_COLUMNS}"#
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(encode_json("run_metadata", &run_metadata)?)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        checkpoint_from_row(&row)
    }

    async fn find_fingerprint(
        &self,
        identity: &ContentIdentity,
    ) -> Result<Option<StoredFingerprint>, StoreError> {
        let row = sqlx::query(
            "SELECT id, content_hash FROM content_records WHERE source = ?1 AND external_id = ?2",
        )
        .bind(&identity.source)
        .bind(&identity.external_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(StoredFingerprint {
                id: row.try_get("id")?,
                content_hash: row.try_get("content_hash")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_content(
        &self,
        candidate: &ScrapedCandidate,
        scraped_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let identity = candidate.identity();
        let mut metadata = candidate.metadata.clone();
        metadata.insert("content_hash".into(), candidate.content_hash.clone().into());
        metadata.insert("published_date".into(), encode_ts(candidate.published_date).into());
        let scraped_at = encode_ts(scraped_at);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"INSERT INTO content_records
                   (external_id, source, url, target_content, raw_content, processed_content,
                    extra_metadata, content_hash, published_at, scraped_at, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?9, ?9)
               ON CONFLICT(source, external_id) DO UPDATE SET
                   url = excluded.url,
                   target_content = excluded.target_content,
                   raw_content = excluded.raw_content,
                   processed_content = NULL,
                   extra_metadata = excluded.extra_metadata,
                   content_hash = excluded.content_hash,
                   published_at = excluded.published_at,
                   scraped_at = excluded.scraped_at,
                   updated_at = excluded.updated_at
               RETURNING id"#,
        )
        .bind(&identity.external_id)
        .bind(&identity.source)
        .bind(&candidate.url)
        .bind(&candidate.title)
        .bind(&candidate.content)
        .bind(encode_json("extra_metadata", &metadata)?)
        .bind(&candidate.content_hash)
        .bind(encode_ts(candidate.published_date))
        .bind(&scraped_at)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get("id")?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_content(&self, id: i64) -> Result<Option<ContentRecord>, StoreError> {
        let sql = format!("SELECT {CONTENT_COLUMNS} FROM content_records WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(content_from_row).transpose()
    }

    async fn recent_content(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ContentRecord>, StoreError> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM content_records
             WHERE created_at >= ?1 AND (?2 IS NULL OR source = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(encode_ts(since))
            .bind(source)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(content_from_row).collect()
    }

    async fn delete_content_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM content_records WHERE created_at < ?1")
            .bind(encode_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn source_activity(&self, since: DateTime<Utc>) -> Result<Vec<SourceCount>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS record_count, MAX(created_at) AS latest_created_at
             FROM content_records
             WHERE created_at >= ?1
             GROUP BY source
             ORDER BY record_count DESC, source ASC",
        )
        .bind(encode_ts(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_count_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn candidate(source: &str, id: &str, content: &str) -> ScrapedCandidate {
        ScrapedCandidate::new(
            source,
            Some(id),
            format!("title {id}"),
            content,
            format!("https://example.test/{id}"),
            at(8),
        )
        .with_metadata("flair", "DD")
    }

    #[test]
    fn timestamps_encode_fixed_width_and_roundtrip() {
        let ts = at(9) + ChronoDuration::microseconds(42);
        let encoded = encode_ts(ts);
        assert_eq!(encoded, "2026-03-02T09:00:00.000042Z");
        assert_eq!(encode_ts(at(9)).len(), encoded.len());
        assert_eq!(decode_ts(&encoded).unwrap(), ts);
        assert!(decode_ts("yesterday").is_err());
    }

    #[tokio::test]
    async fn upsert_then_lookup_by_identity() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        let item = candidate("reddit_wsb", "wsb_1", "first body");

        assert!(store.find_fingerprint(&item.identity()).await.unwrap().is_none());
        let id = store.upsert_content(&item, at(9)).await.unwrap();

        let fingerprint = store.find_fingerprint(&item.identity()).await.unwrap().unwrap();
        assert_eq!(fingerprint.id, id);
        assert_eq!(fingerprint.content_hash, item.content_hash);

        let record = store.get_content(id).await.unwrap().unwrap();
        assert_eq!(record.external_id, "wsb_1");
        assert_eq!(record.title, "title wsb_1");
        assert_eq!(record.metadata["flair"], json!("DD"));
        assert_eq!(record.metadata["content_hash"], json!(item.content_hash));
        assert_eq!(record.published_at, Some(at(8)));
        assert!(record.processed_content.is_none());
    }

    #[tokio::test]
    async fn upsert_on_same_identity_updates_in_place() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        let first = store
            .upsert_content(&candidate("reddit_wsb", "wsb_1", "v1"), at(9))
            .await
            .unwrap();
        sqlx::query("UPDATE content_records SET processed_content = 'summary' WHERE id = ?1")
            .bind(first)
            .execute(store.pool())
            .await
            .unwrap();

        let changed = candidate("reddit_wsb", "wsb_1", "v2");
        let second = store.upsert_content(&changed, at(10)).await.unwrap();
        assert_eq!(first, second);

        let record = store.get_content(second).await.unwrap().unwrap();
        assert_eq!(record.raw_content, "v2");
        assert_eq!(record.content_hash, changed.content_hash);
        assert!(record.processed_content.is_none(), "changed content must be reprocessed");
        assert_eq!(record.created_at, at(9));
        assert_eq!(record.updated_at, at(10));
    }

    #[tokio::test]
    async fn same_external_id_in_different_sources_is_distinct() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        let a = store.upsert_content(&candidate("a", "x", "body"), at(9)).await.unwrap();
        let b = store.upsert_content(&candidate("b", "x", "body"), at(9)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn checkpoint_counts_runs_and_only_moves_forward() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        assert!(store.load_checkpoint("fed_reserve").await.unwrap().is_none());

        let first = store
            .record_success("fed_reserve", at(10), json!({"successful": true}))
            .await
            .unwrap();
        assert_eq!(first.last_check_time, Some(at(10)));
        assert_eq!((first.total_runs, first.successful_runs), (1, 1));

        let older = store
            .record_success("fed_reserve", at(7), json!({"successful": true}))
            .await
            .unwrap();
        assert_eq!(older.last_check_time, Some(at(10)));
        assert_eq!((older.total_runs, older.successful_runs), (2, 2));

        let failed = store
            .record_failure("fed_reserve", json!({"successful": false, "error": "down"}))
            .await
            .unwrap();
        assert_eq!(failed.last_check_time, Some(at(10)));
        assert_eq!((failed.total_runs, failed.successful_runs), (3, 2));
        assert_eq!(failed.run_metadata["error"], json!("down"));
        assert_eq!(failed.created_at, first.created_at);
    }

    #[tokio::test]
    async fn failure_on_first_run_creates_checkpoint_without_check_time() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        let checkpoint = store
            .record_failure("reddit_wsb", json!({"successful": false}))
            .await
            .unwrap();
        assert!(checkpoint.last_check_time.is_none());
        assert_eq!((checkpoint.total_runs, checkpoint.successful_runs), (1, 0));
        assert_eq!(store.list_checkpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_content_filters_orders_and_limits() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        store.upsert_content(&candidate("a", "1", "x"), at(1)).await.unwrap();
        store.upsert_content(&candidate("a", "2", "x"), at(5)).await.unwrap();
        store.upsert_content(&candidate("b", "3", "x"), at(6)).await.unwrap();
        store.upsert_content(&candidate("a", "4", "x"), at(7)).await.unwrap();

        let all = store.recent_content(at(4), 10, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["4", "3", "2"]);

        let only_a = store.recent_content(at(4), 1, Some("a")).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].external_id, "4");
    }

    #[tokio::test]
    async fn activity_groups_by_source_within_window() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        store.upsert_content(&candidate("a", "1", "x"), at(1)).await.unwrap();
        store.upsert_content(&candidate("a", "2", "x"), at(5)).await.unwrap();
        store.upsert_content(&candidate("a", "3", "x"), at(6)).await.unwrap();
        store.upsert_content(&candidate("b", "4", "x"), at(7)).await.unwrap();

        let activity = store.source_activity(at(4)).await.unwrap();
        assert_eq!(
            activity,
            vec![
                SourceCount { source: "a".into(), record_count: 2, latest_created_at: at(6) },
                SourceCount { source: "b".into(), record_count: 1, latest_created_at: at(7) },
            ]
        );
    }

    #[tokio::test]
    async fn delete_before_cutoff_keeps_newer_records() {
        let store = SqliteContentStore::in_memory().await.unwrap();
        store.upsert_content(&candidate("a", "old", "x"), at(1)).await.unwrap();
        store.upsert_content(&candidate("a", "new", "x"), at(9)).await.unwrap();

        assert_eq!(store.delete_content_before(at(5)).await.unwrap(), 1);
        let left = store.recent_content(at(0), 10, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].external_id, "new");
    }
}
