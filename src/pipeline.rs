#![forbid(unsafe_code)]

//! Per-item decision flow the downloader consumes: resolve the media URL,
//! derive its content key, and record it in the ledger.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::Instrument;

use crate::context::RunContext;
use crate::keys::{KeyExtractionError, cache_key_from_url, key_from_reconstructed_url};
use crate::ledger::{LedgerError, MediaLedger, SQLITE_DATETIME_FORMAT};
use crate::lock::{LockError, RunLock};
use crate::netlog::{MediaFilter, extract_request_urls, reconstruct_full_url};

/// What the browser layer observed for one media item.
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// `src` of an image element.
    Image { url: String },
    /// A directly usable video URL.
    VideoUrl { url: String },
    /// Blob-backed video; the URL must be rebuilt from the performance log.
    VideoLog { entries: Vec<Value>, filter: MediaFilter },
}

impl MediaSource {
    fn extension(&self) -> &'static str {
        match self {
            MediaSource::Image { .. } => "jpg",
            MediaSource::VideoUrl { .. } | MediaSource::VideoLog { .. } => "mp4",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Key(#[from] KeyExtractionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("no candidate in {candidates} logged requests carried a byte range")]
    NoVideoUrl { candidates: usize },
}

/// Media that passed the ledger and should be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMedia {
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    pub url: String,
    pub captured_at: String,
    pub extension: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    New(NewMedia),
    Duplicate,
}

impl Decision {
    pub fn is_new(&self) -> bool {
        matches!(self, Decision::New(_))
    }
}

/// Result of one item inside a batch. Failures stay local to their item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub index: usize,
    pub result: Result<Decision, ProcessError>,
}

/// Normalizes the capture timestamp used in the media identity.
///
/// RFC 3339 values (what the page's `<time datetime>` exposes) are converted
/// to UTC at second precision so the same post always yields the same text.
/// Other non-empty values are kept verbatim. Missing values fall back to the
/// local processing time.
pub fn normalize_captured_at(raw: Option<&str>) -> String {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|parsed| {
                parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Secs, true)
            })
            .unwrap_or_else(|_| value.to_string()),
        None => Local::now().format(SQLITE_DATETIME_FORMAT).to_string(),
    }
}

/// Resolves the fetchable URL and its content key for one source.
pub fn resolve_media(source: &MediaSource) -> Result<(String, Option<String>), ProcessError> {
    match source {
        MediaSource::Image { url } => {
            let key = cache_key_from_url(url)?;
            Ok((url.clone(), key))
        }
        MediaSource::VideoUrl { url } => {
            let key = key_from_reconstructed_url(url)?;
            Ok((url.clone(), Some(key)))
        }
        MediaSource::VideoLog { entries, filter } => {
            let candidates = extract_request_urls(entries, filter);
            let url = reconstruct_full_url(candidates.iter().map(String::as_str)).ok_or(
                ProcessError::NoVideoUrl {
                    candidates: candidates.len(),
                },
            )?;
            let key = key_from_reconstructed_url(&url)?;
            Ok((url, Some(key)))
        }
    }
}

/// Decides whether `source` is new for the account in `ctx`, recording it in
/// the ledger when it is.
pub async fn process_media(
    ctx: &RunContext,
    ledger: &MediaLedger,
    source: &MediaSource,
    captured_at: Option<&str>,
) -> Result<Decision, ProcessError> {
    record_media(ctx, ledger, source, captured_at)
        .instrument(ctx.span().clone())
        .await
}

async fn record_media(
    ctx: &RunContext,
    ledger: &MediaLedger,
    source: &MediaSource,
    captured_at: Option<&str>,
) -> Result<Decision, ProcessError> {
    let captured_at = normalize_captured_at(captured_at);
    let (url, key) = resolve_media(source)?;
    tracing::info!(
        url = %url,
        key = key.as_deref().unwrap_or("-"),
        captured_at = %captured_at,
        "resolved media"
    );

    if !ledger
        .check_and_insert(ctx, key.as_deref(), &url, &captured_at)
        .await?
    {
        return Ok(Decision::Duplicate);
    }

    Ok(Decision::New(NewMedia {
        account: ctx.account().to_string(),
        content_key: key,
        url,
        captured_at,
        extension: source.extension(),
    }))
}

/// Read-only variant of [`process_media`]; reports what would happen.
pub async fn preview_media(
    ctx: &RunContext,
    ledger: &MediaLedger,
    source: &MediaSource,
    captured_at: Option<&str>,
) -> Result<Decision, ProcessError> {
    let captured_at = normalize_captured_at(captured_at);
    let (url, key) = resolve_media(source)?;
    if ledger
        .contains(ctx.account(), key.as_deref(), &captured_at)
        .await?
    {
        return Ok(Decision::Duplicate);
    }
    Ok(Decision::New(NewMedia {
        account: ctx.account().to_string(),
        content_key: key,
        url,
        captured_at,
        extension: source.extension(),
    }))
}

/// Processes every source of one post. A failing item is logged and
/// reported, and the remaining items still run.
pub async fn process_batch(
    ctx: &RunContext,
    ledger: &MediaLedger,
    sources: &[MediaSource],
    captured_at: Option<&str>,
) -> Vec<ItemOutcome> {
    let mut outcomes = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let result = process_media(ctx, ledger, source, captured_at).await;
        if let Err(err) = &result {
            tracing::error!(parent: ctx.span(), index, error = %err, "media item skipped");
        }
        outcomes.push(ItemOutcome { index, result });
    }
    outcomes
}

/// Runs `work` while holding the run lock. The lock is released whatever
/// `work` returns; failing to get it aborts the run.
pub async fn run_exclusive<L, F, T>(lock: &L, max_wait: Duration, work: F) -> Result<T, LockError>
where
    L: RunLock,
    F: Future<Output = T>,
{
    let handle = lock.acquire(max_wait).await?;
    let output = work.await;
    lock.release(handle).await;
    Ok(output)
}
