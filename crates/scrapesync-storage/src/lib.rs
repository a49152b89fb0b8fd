//! Persistence, run-report artifacts, HTTP fetch utilities and the process lock for scrapesync.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod db;
pub mod fetch;
pub mod lock;

pub use db::{ContentStore, SourceCount, SqliteContentStore, StoreError, StoredFingerprint};
pub use fetch::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use lock::{is_process_alive, LockError, LockRecord, ProcessLock};

pub const CRATE_NAME: &str = "scrapesync-storage";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Run-report artifacts, one directory per run id.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Write a report file through a temp file + rename so readers never see a partial report.
    pub async fn write_report(
        &self,
        run_id: Uuid,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let content_hash = scrapesync_core::content_hash_bytes(bytes);
        let relative_path = PathBuf::from(run_id.to_string()).join(file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.run_dir(run_id);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredReport {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reports_are_written_atomically_under_run_dir() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let stored = store
            .write_report(run_id, "run_result.json", br#"{"success":true}"#)
            .await
            .expect("write report");

        assert_eq!(stored.relative_path, PathBuf::from(run_id.to_string()).join("run_result.json"));
        assert_eq!(
            std::fs::read_to_string(&stored.absolute_path).expect("read back"),
            r#"{"success":true}"#
        );
        let leftovers = std::fs::read_dir(store.run_dir(run_id))
            .expect("read run dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rewriting_a_report_replaces_its_content() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = store.write_report(run_id, "summary.md", b"one").await.expect("first");
        let second = store.write_report(run_id, "summary.md", b"two").await.expect("second");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(std::fs::read(&second.absolute_path).expect("read"), b"two");
    }
}
