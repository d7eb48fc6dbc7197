#![forbid(unsafe_code)]

//! Content-key extraction for the two URL shapes we see: direct CDN URLs that
//! carry an opaque cache token, and reconstructed video URLs whose only
//! stable identity is the file name stem.

use thiserror::Error;
use url::Url;

/// Query parameter holding the platform-issued cache token on image URLs.
pub const CACHE_KEY_PARAM: &str = "ig_cache_key";
const ENCODED_PADDING: &str = "%3D%3D";
const PADDING: &str = "==";
const VIDEO_EXTENSION: &str = ".mp4";
const DASH_INIT_MARKER: &str = "_video_dashinit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExtractionError {
    #[error("invalid media url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no content key in path of {url}")]
    MissingPathKey { url: String },
}

/// Extracts the cache token from a direct media URL.
///
/// Returns `Ok(None)` when the URL carries no token; the ledger falls back to
/// timestamp-only dedup in that case. Tokens are cut right after the first
/// base64 padding marker so trailing variant segments do not change identity.
pub fn cache_key_from_url(url: &str) -> Result<Option<String>, KeyExtractionError> {
    let parsed = Url::parse(url.trim()).map_err(|err| KeyExtractionError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;

    let Some(token) = parsed
        .query_pairs()
        .find(|(name, _)| name == CACHE_KEY_PARAM)
        .map(|(_, value)| value.trim().to_string())
    else {
        return Ok(None);
    };
    if token.is_empty() {
        return Ok(None);
    }

    Ok(Some(truncate_at_padding(&token).to_string()))
}

/// Keeps everything up to and including the first padding marker. The
/// percent-encoded form wins when both are present, matching tokens that
/// arrive double-encoded.
fn truncate_at_padding(token: &str) -> &str {
    for marker in [ENCODED_PADDING, PADDING] {
        if let Some(index) = token.find(marker) {
            return &token[..index + marker.len()];
        }
    }
    token
}

/// Derives a key from a reconstructed (network-log) video URL by taking the
/// last path segment and stripping the extension and the dash-init marker.
pub fn key_from_reconstructed_url(url: &str) -> Result<String, KeyExtractionError> {
    let trimmed = url.trim();
    let path = match Url::parse(trimmed) {
        Ok(parsed) => parsed.path().to_string(),
        // Relative or scheme-less input: drop the query and treat the rest
        // as a path.
        Err(_) => trimmed
            .split_once('?')
            .map_or(trimmed, |(path, _)| path)
            .to_string(),
    };

    let stem = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(|segment| {
            let segment = segment
                .split_once(VIDEO_EXTENSION)
                .map_or(segment, |(stem, _)| stem);
            segment
                .split_once(DASH_INIT_MARKER)
                .map_or(segment, |(stem, _)| stem)
        })
        .unwrap_or_default();

    if stem.is_empty() {
        return Err(KeyExtractionError::MissingPathKey {
            url: url.to_string(),
        });
    }
    Ok(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_URL: &str = "https://scontent-nrt1-1.cdninstagram.com/v/t51.2885-15/12345_n.jpg?stp=dst-jpg&ig_cache_key=MzUxNjc4NTQ5MTIxNzk2OTI5NQ%3D%3D.3-ccb7-5&_nc_ht=scontent";

    #[test]
    fn cache_key_cuts_after_padding() {
        let key = cache_key_from_url("https://cdn.example/a.jpg?ig_cache_key=abc123%3D%3Dxyz")
            .unwrap();
        assert_eq!(key.as_deref(), Some("abc123=="));
    }

    #[test]
    fn cache_key_from_realistic_url() {
        let key = cache_key_from_url(IMAGE_URL).unwrap();
        assert_eq!(key.as_deref(), Some("MzUxNjc4NTQ5MTIxNzk2OTI5NQ=="));
    }

    #[test]
    fn cache_key_is_idempotent() {
        let first = cache_key_from_url(IMAGE_URL).unwrap();
        let second = cache_key_from_url(IMAGE_URL).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cache_key_keeps_double_encoded_padding() {
        let key =
            cache_key_from_url("https://cdn.example/a.jpg?ig_cache_key=abc%253D%253D.tail").unwrap();
        assert_eq!(key.as_deref(), Some("abc%3D%3D"));
    }

    #[test]
    fn cache_key_without_padding_returns_whole_token() {
        let key = cache_key_from_url("https://cdn.example/a.jpg?ig_cache_key=plain-token").unwrap();
        assert_eq!(key.as_deref(), Some("plain-token"));
    }

    #[test]
    fn missing_cache_key_is_not_an_error() {
        assert_eq!(
            cache_key_from_url("https://cdn.example/a.jpg?stp=dst").unwrap(),
            None
        );
        assert_eq!(
            cache_key_from_url("https://cdn.example/a.jpg?ig_cache_key=%20").unwrap(),
            None
        );
    }

    #[test]
    fn malformed_url_is_rejected() {
        let err = cache_key_from_url("not a url").unwrap_err();
        assert!(matches!(err, KeyExtractionError::InvalidUrl { .. }));
    }

    #[test]
    fn reconstructed_key_strips_extension_and_marker() {
        let key = key_from_reconstructed_url(
            "https://scontent.cdninstagram.com/o1/v/t16/f2/m69/AQN_abc123_video_dashinit.mp4?bytestart=0&byteend=9000",
        )
        .unwrap();
        assert_eq!(key, "AQN_abc123");
    }

    #[test]
    fn reconstructed_key_without_marker() {
        let key =
            key_from_reconstructed_url("https://cdn.example/videos/clip42.mp4?efg=xyz").unwrap();
        assert_eq!(key, "clip42");
    }

    #[test]
    fn reconstructed_key_accepts_relative_path() {
        let key = key_from_reconstructed_url("/v/t16/stem_video_dashinit.mp4?a=b").unwrap();
        assert_eq!(key, "stem");
    }

    #[test]
    fn reconstructed_key_fails_without_segments() {
        let err = key_from_reconstructed_url("https://cdn.example/?bytestart=0").unwrap_err();
        assert!(matches!(err, KeyExtractionError::MissingPathKey { .. }));

        let err = key_from_reconstructed_url("https://cdn.example/dir/.mp4").unwrap_err();
        assert!(matches!(err, KeyExtractionError::MissingPathKey { .. }));
    }
}
