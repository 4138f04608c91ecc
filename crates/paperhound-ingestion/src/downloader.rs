//! PDF downloader with retry, verification and a content cache.
//!
//! A URL is fetched at most once: a verified cache entry short-circuits
//! with no network traffic. Downloads land in a temp file next to the
//! cache and are renamed into place only after the bytes parse as a PDF.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use paperhound_common::config::DownloadConfig;
use paperhound_common::SandboxClient;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::{cache_key, content_hash, ArtifactCache};
use crate::models::{AccessResolution, DownloadedArtifact};
use crate::retry::{retry, RetryDecision, RetryError, RetryPolicy};

/// PDF magic bytes: "%PDF-"
const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transient failure fetching {url} after {attempts} attempt(s): {message}")]
    Transient { url: String, message: String, attempts: u32 },

    #[error("permanent failure fetching {url}: {message}")]
    Permanent { url: String, message: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("cache error: {0}")]
    Cache(#[from] std::io::Error),
}

impl DownloadError {
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::Transient { .. } => "transient",
            DownloadError::Permanent { .. } => "permanent",
            DownloadError::Cancelled => "cancelled",
            DownloadError::Cache(_) => "cache",
        }
    }
}

/// Outcome of a single attempt, before retry classification.
#[derive(Debug)]
enum AttemptError {
    Transient { message: String, retry_after: Option<Duration> },
    Permanent(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Transient { message, .. } => write!(f, "{message}"),
            AttemptError::Permanent(message) => write!(f, "{message}"),
        }
    }
}

fn classify(e: &AttemptError) -> RetryDecision {
    match e {
        AttemptError::Transient { retry_after, .. } => RetryDecision::Retry(*retry_after),
        AttemptError::Permanent(_) => RetryDecision::Stop,
    }
}

pub struct Downloader {
    client: SandboxClient,
    cache: Arc<ArtifactCache>,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(client: SandboxClient, cache: Arc<ArtifactCache>, policy: RetryPolicy) -> Self {
        Self { client, cache, policy }
    }

    /// Build from configuration, opening the cache directory.
    pub fn from_config(config: &DownloadConfig, client: SandboxClient) -> Result<Self, DownloadError> {
        let cache = Arc::new(ArtifactCache::open(&config.cache_dir)?);
        let policy = RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        );
        Ok(Self::new(client, cache, policy))
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Fetch one URL into the cache.
    pub async fn download(
        &self,
        paper: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact, DownloadError> {
        self.download_via(&self.client, paper, url, cancel).await
    }

    #[instrument(skip(self, client, cancel))]
    async fn download_via(
        &self,
        client: &SandboxClient,
        paper: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let key = cache_key(url);
        let lock = self.cache.key_lock(&key);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            guard = lock.lock() => guard,
        };

        if let Some(hit) = self.cache.lookup(paper, url) {
            info!(%url, "Using cached artifact");
            return Ok(hit);
        }

        let bytes = retry(&self.policy, "download", cancel, |_| fetch_once(client, url), classify)
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => DownloadError::Cancelled,
                RetryError::Failed { error: AttemptError::Permanent(message), .. } => {
                    DownloadError::Permanent { url: url.to_string(), message }
                }
                RetryError::Failed { error: AttemptError::Transient { message, .. }, attempts } => {
                    DownloadError::Transient { url: url.to_string(), message, attempts }
                }
            })?;

        let size = bytes.len() as u64;
        let hash = content_hash(&bytes);
        let path = self.cache.path_for(&key);
        let dir = self.cache.dir().to_path_buf();
        let target = path.clone();

        // Verification parses the whole document; keep it off the runtime.
        tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            if let Err(message) = verify_pdf(&bytes) {
                // Dropping `tmp` removes the partial file.
                return Err(DownloadError::Permanent { url: String::new(), message });
            }
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| DownloadError::Cache(std::io::Error::other(e)))?
        .map_err(|e| match e {
            DownloadError::Permanent { message, .. } => DownloadError::Permanent { url: url.to_string(), message },
            other => other,
        })?;

        let artifact = DownloadedArtifact {
            paper: paper.to_string(),
            url: url.to_string(),
            cache_key: key,
            path,
            content_hash: hash,
            size,
            verified: true,
            fetched_at: Utc::now(),
        };
        self.cache.record(&artifact)?;
        info!(%url, size, "Artifact downloaded and verified");
        Ok(artifact)
    }

    /// Try each candidate of a resolution in order; the first verified
    /// artifact wins. Cancellation stops immediately.
    ///
    /// Candidates were already vetted by the resolver, so their hosts are
    /// allowed for this call even when outside the default allowlist.
    pub async fn download_any(
        &self,
        resolution: &AccessResolution,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let candidates = resolution.candidate_urls();
        let client = self.client.clone().allowing_hosts_of(candidates.iter().copied());
        let mut last_error = None;
        for url in candidates {
            match self.download_via(&client, &resolution.paper, url, cancel).await {
                Ok(artifact) => return Ok(artifact),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) => {
                    warn!(paper = %resolution.paper, %url, error = %e, "Candidate failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DownloadError::Permanent {
            url: String::new(),
            message: format!("{} has no downloadable candidate", resolution.paper),
        }))
    }
}

async fn fetch_once(client: &SandboxClient, url: &str) -> Result<Vec<u8>, AttemptError> {
    let resp = client
        .get(url)
        .map_err(|e| AttemptError::Permanent(e.to_string()))?
        .send()
        .await
        .map_err(request_error)?;

    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(AttemptError::Transient {
            message: "HTTP 429 Too Many Requests".into(),
            retry_after: resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        });
    }
    if status.is_server_error() || status.as_u16() == 408 {
        return Err(AttemptError::Transient { message: format!("HTTP {status}"), retry_after: None });
    }
    if !status.is_success() {
        return Err(AttemptError::Permanent(format!("HTTP {status}")));
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp.bytes().await.map_err(request_error)?;

    if is_likely_html(content_type.as_deref(), &bytes) {
        return Err(AttemptError::Permanent("server returned an HTML page instead of a PDF".into()));
    }
    Ok(bytes.to_vec())
}

fn request_error(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        AttemptError::Transient { message: e.to_string(), retry_after: None }
    } else {
        AttemptError::Permanent(e.to_string())
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Check that a response is a login/paywall page rather than a document.
pub fn is_likely_html(content_type: Option<&str>, bytes: &[u8]) -> bool {
    if content_type.is_some_and(|ct| ct.contains("text/html")) {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(64)]).to_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

/// Non-empty, `%PDF-` header, and parseable by lopdf.
pub fn verify_pdf(bytes: &[u8]) -> Result<(), String> {
    if bytes.is_empty() {
        return Err("empty body".into());
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err("missing %PDF- header".into());
    }
    lopdf::Document::load_mem(bytes).map_err(|e| format!("unparseable PDF: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_is_likely_html() {
        assert!(is_likely_html(Some("text/html; charset=utf-8"), b"%PDF-1.4"));
        assert!(is_likely_html(None, b"  <!DOCTYPE html><html>"));
        assert!(!is_likely_html(Some("application/pdf"), b"%PDF-1.4"));
        assert!(!is_likely_html(None, b""));
    }

    #[test]
    fn test_verify_pdf_rejects_garbage() {
        assert!(verify_pdf(b"").is_err());
        assert!(verify_pdf(b"<html>").is_err());
        assert!(verify_pdf(b"%PDF-1.4 truncated").is_err());
    }

    #[test]
    fn test_error_kinds() {
        let e = DownloadError::Permanent { url: "u".into(), message: "m".into() };
        assert_eq!(e.kind(), "permanent");
        assert_eq!(DownloadError::Cancelled.kind(), "cancelled");
    }
}
