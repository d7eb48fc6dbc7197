#![forbid(unsafe_code)]

//! Cross-process run lock. Automation runs share one browser profile, so only
//! one of them may drive it at a time.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, sleep};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Distinguishes handles and tombstones created by the same process.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("lock marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Proof that the caller holds the lock. Hand it back to
/// [`RunLock::release`] when done.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    acquired_at: DateTime<Local>,
    token: String,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquired_at(&self) -> DateTime<Local> {
        self.acquired_at
    }

    /// Ownership token written into the marker.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Mutual exclusion between automation runs. The marker-file implementation
/// can be swapped for an OS advisory lock without touching callers.
pub trait RunLock {
    fn acquire(
        &self,
        max_wait: Duration,
    ) -> impl Future<Output = Result<LockHandle, LockError>> + Send;

    fn release(&self, handle: LockHandle) -> impl Future<Output = ()> + Send;
}

/// Lock backed by the existence of a marker file. A marker older than
/// `stale_after` is presumed to belong to a crashed run and is reclaimed.
#[derive(Debug, Clone)]
pub struct MarkerLock {
    path: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
}

/// Marker line: `pid=<pid> acquired_at=<rfc3339> token=<token>`.
fn marker_token(contents: &str) -> Option<&str> {
    contents
        .split_whitespace()
        .find_map(|field| field.strip_prefix("token="))
}

impl MarkerLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn tombstone_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(
            ".stale.{}.{}",
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        PathBuf::from(name)
    }

    /// Creates the marker atomically. `None` means someone else holds it.
    async fn try_create(&self) -> Result<Option<LockHandle>, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };

        let acquired_at = Local::now();
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            acquired_at.timestamp_nanos_opt().unwrap_or_default(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let line = format!(
            "pid={} acquired_at={} token={token}\n",
            std::process::id(),
            acquired_at.to_rfc3339()
        );
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            drop(file);
            let _ = fs::remove_file(&self.path).await;
            return Err(self.io_error(err));
        }

        Ok(Some(LockHandle {
            path: self.path.clone(),
            acquired_at,
            token,
        }))
    }

    /// Age of the existing marker, `None` when it vanished in the meantime.
    async fn marker_age(&self) -> Result<Option<Duration>, LockError> {
        age_of(&self.path).await.map_err(|err| self.io_error(err))
    }

    /// Moves a stale marker aside and deletes it. The rename is the claim:
    /// only one waiter can move a given marker, and the moved file is checked
    /// again so a marker that a faster waiter freshly created is put back.
    /// Returns `false` when this waiter lost the race and should keep polling.
    async fn reclaim_stale(&self, age: Duration) -> Result<bool, LockError> {
        let tombstone = self.tombstone_path();
        match fs::rename(&self.path, &tombstone).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(self.io_error(err)),
        }

        let still_stale = match age_of(&tombstone).await {
            Ok(Some(moved_age)) => moved_age > self.stale_after,
            Ok(None) => false,
            Err(err) => return Err(self.io_error(err)),
        };
        if !still_stale {
            self.restore(&tombstone).await?;
            return Ok(false);
        }

        tracing::warn!(
            path = %self.path.display(),
            age_secs = age.as_secs(),
            "removing stale lock marker"
        );
        match fs::remove_file(&tombstone).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Puts a live marker that was moved by mistake back in place. A hard
    /// link never replaces a marker created in the meantime.
    async fn restore(&self, tombstone: &Path) -> Result<(), LockError> {
        match fs::hard_link(tombstone, &self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(
                    path = %self.path.display(),
                    "live lock marker displaced by a newer one"
                );
            }
            Err(err) => return Err(self.io_error(err)),
        }
        match fs::remove_file(tombstone).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

async fn age_of(path: &Path) -> io::Result<Option<Duration>> {
    let modified = match fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
    ))
}

impl RunLock for MarkerLock {
    async fn acquire(&self, max_wait: Duration) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        loop {
            if let Some(handle) = self.try_create().await? {
                tracing::info!(
                    path = %self.path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock acquired"
                );
                return Ok(handle);
            }

            match self.marker_age().await? {
                Some(age) if age > self.stale_after => {
                    if self.reclaim_stale(age).await? {
                        continue;
                    }
                }
                Some(_) => {}
                None => continue,
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                tracing::error!(
                    path = %self.path.display(),
                    waited_secs = waited.as_secs(),
                    "gave up waiting for lock"
                );
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            tracing::debug!(path = %self.path.display(), "lock busy, waiting");
            sleep(self.poll_interval.min(max_wait - waited)).await;
        }
    }

    /// Removes the marker only while it still carries this handle's token, so
    /// a run that outlived its staleness window cannot free a newer holder.
    async fn release(&self, handle: LockHandle) {
        let path = &handle.path;
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "lock marker already removed");
                return;
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to read lock marker");
                return;
            }
        };
        if marker_token(&contents) != Some(handle.token.as_str()) {
            tracing::warn!(
                path = %path.display(),
                token = %handle.token,
                "lock marker now belongs to another run, leaving it"
            );
            return;
        }

        match fs::remove_file(path).await {
            Ok(()) => tracing::info!(path = %path.display(), "lock released"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "lock marker already removed");
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to remove lock marker");
            }
        }
    }
}
