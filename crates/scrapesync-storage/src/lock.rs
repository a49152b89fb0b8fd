//! Single-instance process lock backed by a lock file.
//!
//! The file holds a JSON [`LockRecord`] and is also held under an OS advisory
//! lock for as long as the [`ProcessLock`] lives. A record whose pid is no
//! longer running is stale and gets replaced, unless another process still
//! holds the advisory lock on it (a holder that has created the file but not
//! yet written its record). Stale files are renamed aside under their lock
//! before removal, and a fresh lock only counts once the path is confirmed to
//! still name the locked file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started: DateTime<Utc>,
    pub platform: String,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started: Utc::now(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance (pid {pid}) holds {path}")]
    Held { pid: u32, path: PathBuf },
    #[error("lock file {path} is being acquired by another process")]
    Busy { path: PathBuf },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding lock record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Guard for the single-instance lock; released on drop, including during unwinding.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: Option<File>,
    record: LockRecord,
}

impl ProcessLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            clear_stale(&path)?;
        }

        let file = match create_exclusive(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Busy { path });
            }
            Err(err) => return Err(LockError::io(&path, err)),
        };

        if !try_lock_file(&file) || !owns_path(&file, &path) {
            return Err(LockError::Busy { path });
        }

        let record = LockRecord::current();
        let mut lock = Self {
            path,
            file: Some(file),
            record,
        };
        lock.write_record()?;
        info!(path = %lock.path.display(), pid = lock.record.pid, "process lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}

    fn write_record(&mut self) -> Result<(), LockError> {
        let body = serde_json::to_vec_pretty(&self.record)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(&body)
                .and_then(|_| file.sync_all())
                .map_err(|err| LockError::io(&self.path, err))?;
        }
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unlock_file(&file);
            drop(file);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "process lock released"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove lock file"),
        }
    }
}

pub fn read_record(path: &Path) -> Option<LockRecord> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn clear_stale(path: &Path) -> Result<(), LockError> {
    let busy = || LockError::Busy {
        path: path.to_path_buf(),
    };
    let raw = match fs::read(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) if is_sharing_violation(&err) => return Err(busy()),
        Err(_) => None,
    };

    match raw.and_then(|raw| serde_json::from_slice::<LockRecord>(&raw).ok()) {
        Some(record) if is_process_alive(record.pid) => {
            return Err(LockError::Held {
                pid: record.pid,
                path: path.to_path_buf(),
            });
        }
        Some(record) => warn!(path = %path.display(), pid = record.pid, "removing stale lock file"),
        None => warn!(path = %path.display(), "removing unreadable lock file"),
    }

    // Someone may hold the file without having written a record yet.
    let existing = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(existing) => existing,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) if is_sharing_violation(&err) => return Err(busy()),
        Err(err) => return Err(LockError::io(path, err)),
    };
    if !try_lock_file(&existing) || !owns_path(&existing, path) {
        return Err(busy());
    }

    // Move the stale file aside while still holding its lock, so a concurrent
    // cleaner can never unlink a lock file created after this one was judged stale.
    let aside = path.with_file_name(format!(
        ".{}.{}.stale",
        path.file_name().and_then(|name| name.to_str()).unwrap_or("lock"),
        Uuid::new_v4()
    ));
    let renamed = fs::rename(path, &aside);
    unlock_file(&existing);
    drop(existing);
    match renamed {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) if is_sharing_violation(&err) => return Err(busy()),
        Err(err) => return Err(LockError::io(path, err)),
    }
    if let Err(err) = fs::remove_file(&aside) {
        warn!(path = %aside.display(), error = %err, "failed to remove stale lock file");
    }
    Ok(())
}

/// True when `path` still names the file behind `file`.
#[cfg(unix)]
fn owns_path(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

// Windows: a share-mode-0 handle cannot be renamed away underneath its holder.
#[cfg(not(unix))]
fn owns_path(_file: &File, _path: &Path) -> bool {
    true
}

/// ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION: a live holder's exclusive handle.
#[cfg(windows)]
fn is_sharing_violation(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(windows))]
fn is_sharing_violation(_err: &io::Error) -> bool {
    false
}

#[cfg(not(windows))]
fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(windows)]
fn create_exclusive(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .share_mode(0)
        .open(path)
}

#[cfg(unix)]
fn try_lock_file(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and valid for the call.
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn unlock_file(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// Windows: exclusivity comes from the zero share mode on the open handle.
#[cfg(not(unix))]
fn try_lock_file(_file: &File) -> bool {
    true
}

#[cfg(not(unix))]
fn unlock_file(_file: &File) {}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output();
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .any(|field| field == pid.to_string()),
        Err(_) => false,
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(pid: u32) -> bool {
    pid == std::process::id()
}
