#![forbid(unsafe_code)]

//! Reduces captured browser performance logs to the one URL that covers the
//! whole media asset.
//!
//! Blob-backed players never expose a fetchable URL; the browser requests the
//! asset in byte-range chunks instead. Each chunk request is visible in the
//! performance log, so the full asset URL is rebuilt from the chunk that
//! declares the largest `byteend`.

use std::collections::BTreeSet;

use serde_json::Value;
use url::Url;

const BYTE_START_PARAM: &str = "bytestart";
const BYTE_END_PARAM: &str = "byteend";

/// Which request URLs count as candidate media chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFilter {
    /// Substring that must appear in the URL, usually a file extension.
    pub extension: String,
    /// Optional CDN host marker that must also appear.
    pub host_marker: Option<String>,
}

impl MediaFilter {
    pub fn video() -> Self {
        Self {
            extension: ".mp4".to_string(),
            host_marker: None,
        }
    }

    /// Older capture setups only trusted URLs served from the `scontent` CDN.
    pub fn video_on_cdn() -> Self {
        Self {
            host_marker: Some("scontent".to_string()),
            ..Self::video()
        }
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(&self.extension)
            && self
                .host_marker
                .as_deref()
                .is_none_or(|marker| url.contains(marker))
    }
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self::video()
    }
}

/// Collects the distinct request URLs matching `filter`.
///
/// Entries that are not JSON, or that do not describe a request, are skipped.
pub fn extract_request_urls(entries: &[Value], filter: &MediaFilter) -> BTreeSet<String> {
    let mut urls = BTreeSet::new();
    for (index, entry) in entries.iter().enumerate() {
        let Some(url) = request_url(entry) else {
            tracing::debug!(index, "skipping log entry without a request url");
            continue;
        };
        if filter.matches(&url) {
            urls.insert(url);
        }
    }
    tracing::debug!(count = urls.len(), "collected candidate media urls");
    urls
}

/// Pulls `message.params.request.url` out of one log entry. Chrome wraps the
/// inner event as a JSON string under `message`; already-decoded objects are
/// accepted too.
fn request_url(entry: &Value) -> Option<String> {
    let decoded;
    let event = match entry.get("message")? {
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw).ok()?;
            &decoded
        }
        other => other,
    };

    event
        .get("message")?
        .get("params")?
        .get("request")?
        .get("url")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
}

/// Picks the candidate with the largest `byteend` and rewrites it into a
/// full-range URL (`bytestart=0`). Candidates without a parseable `byteend`
/// are ignored; returns `None` when none remain.
pub fn reconstruct_full_url<'a, I>(urls: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(u64, Url)> = None;
    for candidate in urls {
        let Ok(parsed) = Url::parse(candidate) else {
            continue;
        };
        let Some(end) = byte_end(&parsed) else {
            continue;
        };
        if best.as_ref().is_none_or(|(max, _)| end > *max) {
            best = Some((end, parsed));
        }
    }

    let (max_end, mut url) = best?;
    let query = rewrite_range(url.query().unwrap_or_default(), max_end);
    url.set_query(Some(&query));
    Some(url.into())
}

fn byte_end(url: &Url) -> Option<u64> {
    url.query_pairs()
        .find(|(name, _)| name == BYTE_END_PARAM)
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
}

/// Rewrites the range pieces of a raw query string. Every other piece is kept
/// byte-for-byte so signed CDN parameters stay valid.
fn rewrite_range(query: &str, end: u64) -> String {
    let mut pieces = Vec::new();
    let mut saw_start = false;
    let mut saw_end = false;

    for piece in query.split('&').filter(|piece| !piece.is_empty()) {
        let name = piece.split_once('=').map_or(piece, |(name, _)| name);
        match name {
            BYTE_START_PARAM if !saw_start => {
                pieces.push(format!("{BYTE_START_PARAM}=0"));
                saw_start = true;
            }
            BYTE_END_PARAM if !saw_end => {
                pieces.push(format!("{BYTE_END_PARAM}={end}"));
                saw_end = true;
            }
            BYTE_START_PARAM | BYTE_END_PARAM => {}
            _ => pieces.push(piece.to_string()),
        }
    }

    if !saw_start {
        pieces.push(format!("{BYTE_START_PARAM}=0"));
    }
    if !saw_end {
        pieces.push(format!("{BYTE_END_PARAM}={end}"));
    }
    pieces.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "https://scontent-nrt1-2.cdninstagram.com/o1/v/t16/f2/m69/AQOclip_video_dashinit.mp4";

    fn chunk(start: u64, end: u64) -> String {
        format!("{BASE}?efg=abc&_nc_ht=scontent&oh=00_sig&bytestart={start}&byteend={end}")
    }

    fn log_entry(url: &str) -> Value {
        let inner = json!({
            "message": {
                "method": "Network.requestWillBeSent",
                "params": { "request": { "url": url, "method": "GET" } }
            },
            "webview": "ABC"
        });
        json!({ "level": "INFO", "message": inner.to_string(), "timestamp": 1_700_000_000_000u64 })
    }

    #[test]
    fn reconstruct_picks_max_end_and_zeroes_start() {
        let urls = [chunk(900, 100), chunk(12, 500), chunk(4000, 9000)];
        let full = reconstruct_full_url(urls.iter().map(String::as_str)).unwrap();
        assert_eq!(
            full,
            format!("{BASE}?efg=abc&_nc_ht=scontent&oh=00_sig&bytestart=0&byteend=9000")
        );
    }

    #[test]
    fn reconstruct_empty_is_none() {
        assert_eq!(reconstruct_full_url(std::iter::empty()), None);
    }

    #[test]
    fn reconstruct_ignores_unparseable_ranges() {
        let urls = [
            format!("{BASE}?bytestart=0&byteend=oops"),
            format!("{BASE}?bytestart=0"),
            "::not a url::".to_string(),
            chunk(10, 300),
        ];
        let full = reconstruct_full_url(urls.iter().map(String::as_str)).unwrap();
        assert!(full.ends_with("bytestart=0&byteend=300"));

        let only_bad = [format!("{BASE}?byteend=")];
        assert_eq!(reconstruct_full_url(only_bad.iter().map(String::as_str)), None);
    }

    #[test]
    fn reconstruct_appends_missing_start() {
        let urls = [format!("{BASE}?byteend=77&oe=1")];
        let full = reconstruct_full_url(urls.iter().map(String::as_str)).unwrap();
        assert_eq!(full, format!("{BASE}?byteend=77&oe=1&bytestart=0"));
    }

    #[test]
    fn extract_skips_malformed_entries() {
        let entries = vec![
            json!({ "message": "{not json" }),
            json!({ "message": json!({"message": {"params": {}}}).to_string() }),
            json!({ "level": "INFO" }),
            json!("plain string"),
            log_entry(&chunk(0, 100)),
            log_entry("https://scontent.cdninstagram.com/static/app.js"),
        ];
        let urls = extract_request_urls(&entries, &MediaFilter::video());
        assert_eq!(urls.len(), 1);
        assert!(urls.contains(&chunk(0, 100)));
    }

    #[test]
    fn extract_accepts_decoded_message_objects() {
        let entries = vec![json!({
            "message": { "message": { "params": { "request": { "url": chunk(0, 5) } } } }
        })];
        let urls = extract_request_urls(&entries, &MediaFilter::video());
        assert!(urls.contains(&chunk(0, 5)));
    }

    #[test]
    fn host_marker_filter_drops_foreign_hosts() {
        let foreign = "https://video.example.net/clip.mp4?bytestart=0&byteend=10";
        let entries = vec![log_entry(foreign), log_entry(&chunk(0, 10))];

        let strict = extract_request_urls(&entries, &MediaFilter::video_on_cdn());
        assert_eq!(strict.len(), 1);

        let loose = extract_request_urls(&entries, &MediaFilter::video());
        assert_eq!(loose.len(), 2);
    }

    #[test]
    fn duplicate_entries_do_not_change_result() {
        let mut entries = vec![
            log_entry(&chunk(0, 100)),
            log_entry(&chunk(100, 5000)),
            log_entry(&chunk(5000, 2000)),
        ];
        let once = extract_request_urls(&entries, &MediaFilter::video());
        let first = reconstruct_full_url(once.iter().map(String::as_str));

        entries.extend(entries.clone());
        let twice = extract_request_urls(&entries, &MediaFilter::video());
        let second = reconstruct_full_url(twice.iter().map(String::as_str));

        assert_eq!(once, twice);
        assert_eq!(first, second);
        assert!(first.unwrap().contains("bytestart=0&byteend=5000"));
    }
}
