//! URL and input validation utilities

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::core::models::{AppError, AppResult, JobSpec, MediaFormat};

static AUDIO_QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d{1,4}[Kk]?|[0-9]|10)$").expect("valid regex"));

static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

/// Validate if URL is well formed and uses http(s)
pub fn validate_url(url: &str) -> AppResult<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| AppError::Validation(format!("Invalid URL format: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(AppError::Validation(format!(
            "Unsupported URL scheme: {}",
            other
        ))),
    }
}

/// A URL refers to a playlist when it carries a `list` query or a playlist path
pub fn is_playlist_url(url: &str) -> bool {
    match Url::parse(url.trim()) {
        Ok(parsed) => {
            parsed.query_pairs().any(|(key, _)| key == "list")
                || parsed.path().contains("/playlist")
        }
        Err(_) => url.contains("list=") || url.contains("/playlist/"),
    }
}

/// Audio bitrate ("192K", "320k", "128") or VBR level ("0".."10")
pub fn validate_audio_quality(quality: &str) -> AppResult<()> {
    if AUDIO_QUALITY_RE.is_match(quality.trim()) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid audio quality: {}",
            quality
        )))
    }
}

pub fn validate_video_id(id: &str) -> AppResult<()> {
    if VIDEO_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid video id: {:?}", id)))
    }
}

/// Canonical watch URL for a video id
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Reject malformed requests before any probing happens
pub fn validate_job_spec(spec: &JobSpec) -> AppResult<()> {
    validate_url(&spec.url)?;

    if let (MediaFormat::Audio, Some(quality)) = (spec.format, spec.quality.as_deref()) {
        validate_audio_quality(quality)?;
    }

    if spec.playlist_limit == Some(0) {
        return Err(AppError::Validation(
            "Playlist limit must be greater than 0".to_string(),
        ));
    }

    if let Some(items) = &spec.playlist_items {
        for id in items {
            validate_video_id(id)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").is_ok());
        assert!(validate_url("ftp://example.com/file").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_playlist_detection() {
        assert!(is_playlist_url(
            "https://www.youtube.com/playlist?list=PL1234567890"
        ));
        assert!(is_playlist_url(
            "https://www.youtube.com/watch?v=abc&list=PL1234567890"
        ));
        assert!(!is_playlist_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn test_audio_quality() {
        for ok in ["192K", "320k", "128", "0", "5"] {
            assert!(validate_audio_quality(ok).is_ok(), "{ok}");
        }
        for bad in ["", "loud", "192KB", "-1"] {
            assert!(validate_audio_quality(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_job_spec_validation() {
        let mut spec = JobSpec::new("https://www.youtube.com/watch?v=abc", MediaFormat::Audio);
        spec.quality = Some("192K".into());
        assert!(validate_job_spec(&spec).is_ok());

        spec.playlist_limit = Some(0);
        assert!(matches!(
            validate_job_spec(&spec),
            Err(AppError::Validation(_))
        ));

        spec.playlist_limit = None;
        spec.playlist_items = Some(vec!["ok_id-1".into(), "bad id".into()]);
        assert!(validate_job_spec(&spec).is_err());
    }
}
