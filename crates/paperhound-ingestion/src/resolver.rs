//! Open-access resolution: find a downloadable PDF for a paper record.
//!
//! Candidates come from per-source URL patterns, Unpaywall and landing-page
//! scraping. Each candidate is checked (headers only) before it is offered
//! to the downloader.

use std::time::Duration;

use paperhound_common::config::ResolverConfig;
use paperhound_common::SandboxClient;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Selector};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::models::{Access, AccessResolution, ArtifactFormat, PaperRecord, SourceKind};
use crate::retry::{retry, RetryDecision, RetryError, RetryPolicy};
use crate::sources::arxiv::extract_arxiv_id;

/// Roots of the URL patterns the resolver knows. Overridable for tests.
#[derive(Debug, Clone)]
pub struct ResolverEndpoints {
    pub arxiv_pdf: String,
    pub pmc: String,
    pub unpaywall: String,
    pub doi: String,
}

impl Default for ResolverEndpoints {
    fn default() -> Self {
        Self {
            arxiv_pdf: "https://arxiv.org/pdf".into(),
            pmc: "https://www.ncbi.nlm.nih.gov/pmc/articles".into(),
            unpaywall: "https://api.unpaywall.org/v2".into(),
            doi: "https://doi.org".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnpaywallResponse {
    best_oa_location: Option<OaLocation>,
    #[serde(default)]
    oa_locations: Vec<OaLocation>,
}

#[derive(Debug, Deserialize)]
struct OaLocation {
    url_for_pdf: Option<String>,
    host_type: Option<String>,
}

#[derive(Debug)]
enum CheckError {
    Server(u16),
    Connect(String),
    Other(String),
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Server(status) => write!(f, "HTTP {status}"),
            CheckError::Connect(m) => write!(f, "connection failed: {m}"),
            CheckError::Other(m) => write!(f, "{m}"),
        }
    }
}

pub struct OpenAccessResolver {
    client: SandboxClient,
    policy: RetryPolicy,
    check_timeout: Duration,
    unpaywall_email: Option<String>,
    scrape_landing_pages: bool,
    endpoints: ResolverEndpoints,
}

impl OpenAccessResolver {
    pub fn new(config: &ResolverConfig, client: SandboxClient) -> Self {
        let initial = Duration::from_millis(config.initial_backoff_ms);
        Self {
            client,
            policy: RetryPolicy::new(config.check_attempts, initial, initial * 16),
            check_timeout: Duration::from_secs(config.check_timeout_secs),
            unpaywall_email: config.unpaywall_email.clone().filter(|e| !e.trim().is_empty()),
            scrape_landing_pages: config.scrape_landing_pages,
            endpoints: ResolverEndpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: ResolverEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Resolve one record. Never fails: problems become `LinkOnly` or
    /// `Unavailable`.
    #[instrument(skip(self, record, cancel), fields(paper = %record.label()))]
    pub async fn resolve(&self, record: &PaperRecord, cancel: &CancellationToken) -> AccessResolution {
        let paper = record.label();
        let mut candidates = direct_candidates(record, &self.endpoints);

        if let (Some(doi), Some(email)) = (record.doi.as_deref(), self.unpaywall_email.as_deref()) {
            for url in self.unpaywall_lookup(doi, email, cancel).await {
                push_unique(&mut candidates, url);
            }
        }

        // Hosts handed out by Unpaywall are trusted for probing.
        let mut client = self.client.clone().allowing_hosts_of(candidates.iter().map(String::as_str));
        let mut pdfs = self.check_all(&client, &candidates, cancel).await;

        let mut landing: Option<String> = None;
        if pdfs.is_empty() && self.scrape_landing_pages && !cancel.is_cancelled() {
            'pages: for page in self.landing_pages(record) {
                let Some((final_url, link)) = self.scrape_landing(&client, &page, cancel).await else {
                    continue;
                };
                if landing.is_none() && final_url != page {
                    landing = Some(final_url.clone());
                }
                // Publisher URL pattern first, then whatever the page links to.
                let found: Vec<String> = publisher_pdf_url(&final_url)
                    .into_iter()
                    .chain(link)
                    .filter(|l| !candidates.contains(l))
                    .collect();
                for link in found {
                    client = client.allowing_hosts_of([link.as_str()]);
                    candidates.push(link.clone());
                    pdfs = self.check_all(&client, &[link], cancel).await;
                    if !pdfs.is_empty() {
                        break 'pages;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return AccessResolution { paper, access: Access::Unavailable { reason: "cancelled".into() } };
        }

        let access = if !pdfs.is_empty() {
            let url = pdfs.remove(0);
            info!(%url, mirrors = pdfs.len(), "Open-access PDF found");
            Access::Downloadable { url, format: ArtifactFormat::Pdf, mirrors: pdfs }
        } else if let Some(link) = self.fallback_link(record, landing) {
            info!(%link, "No PDF, link only");
            Access::LinkOnly { url: link }
        } else {
            Access::Unavailable {
                reason: format!("no open-access PDF among {} candidate(s) and no link", candidates.len()),
            }
        };
        AccessResolution { paper, access }
    }

    /// Check candidates in order; keep every one that answers with a PDF.
    async fn check_all(&self, client: &SandboxClient, candidates: &[String], cancel: &CancellationToken) -> Vec<String> {
        let mut found = Vec::new();
        for url in candidates {
            if cancel.is_cancelled() {
                break;
            }
            if self.check_pdf(client, url, cancel).await {
                found.push(url.clone());
            }
        }
        found
    }

    /// GET, read headers only. 5xx and connection errors are retried;
    /// timeouts and 4xx are answered immediately.
    async fn check_pdf(&self, client: &SandboxClient, url: &str, cancel: &CancellationToken) -> bool {
        let result = retry(
            &self.policy,
            "pdf check",
            cancel,
            |_| async move {
                let resp = client
                    .get(url)
                    .map_err(|e| CheckError::Other(e.to_string()))?
                    .timeout(self.check_timeout)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_connect() && !e.is_timeout() {
                            CheckError::Connect(e.to_string())
                        } else {
                            CheckError::Other(e.to_string())
                        }
                    })?;
                let status = resp.status();
                if status.is_server_error() {
                    return Err(CheckError::Server(status.as_u16()));
                }
                let is_pdf = status.is_success()
                    && resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|ct| ct.to_lowercase().contains("pdf"));
                Ok::<bool, CheckError>(is_pdf)
            },
            |e| match e {
                CheckError::Server(_) | CheckError::Connect(_) => RetryDecision::Retry(None),
                CheckError::Other(_) => RetryDecision::Stop,
            },
        )
        .await;

        match result {
            Ok(is_pdf) => {
                debug!(%url, is_pdf, "Checked");
                is_pdf
            }
            Err(RetryError::Failed { error, attempts }) => {
                debug!(%url, attempts, error = %error, "Check failed");
                false
            }
            Err(RetryError::Cancelled) => false,
        }
    }

    /// PDF URLs Unpaywall knows for a DOI: publisher copies first, then
    /// the best location, then any other location.
    async fn unpaywall_lookup(&self, doi: &str, email: &str, cancel: &CancellationToken) -> Vec<String> {
        let url = format!("{}/{}", self.endpoints.unpaywall, doi);
        let request = match self.client.get(&url) {
            Ok(req) => req.query(&[("email", email)]).timeout(self.check_timeout),
            Err(e) => {
                warn!(error = %e, "Unpaywall lookup blocked");
                return Vec::new();
            }
        };
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            resp = request.send() => resp,
        };
        let data: UnpaywallResponse = match resp {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(d) => d,
                Err(e) => {
                    warn!(%doi, error = %e, "Unpaywall response unreadable");
                    return Vec::new();
                }
            },
            Ok(r) => {
                debug!(%doi, status = %r.status(), "Unpaywall has no record");
                return Vec::new();
            }
            Err(e) => {
                warn!(%doi, error = %e, "Unpaywall lookup failed");
                return Vec::new();
            }
        };
        unpaywall_pdf_urls(data)
    }

    /// Pages worth scraping for a PDF link: the DOI resolver, then the
    /// record's own landing page.
    fn landing_pages(&self, record: &PaperRecord) -> Vec<String> {
        let mut pages = Vec::new();
        if let Some(doi) = record.doi.as_deref() {
            pages.push(format!("{}/{}", self.endpoints.doi, doi.trim()));
        }
        if let Some(url) = record.url.as_deref() {
            push_unique(&mut pages, url.to_string());
        }
        pages
    }

    /// Fetch a landing page. Returns the post-redirect URL and the first
    /// PDF link found in it.
    async fn scrape_landing(
        &self,
        client: &SandboxClient,
        page: &str,
        cancel: &CancellationToken,
    ) -> Option<(String, Option<String>)> {
        let request = client.get(page).ok()?.timeout(self.check_timeout);
        let sent = tokio::select! {
            _ = cancel.cancelled() => return None,
            resp = request.send() => resp,
        };
        let resp = sent.map_err(|e| debug!(%page, error = %e, "Landing page unreachable")).ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let final_url = resp.url().to_string();
        let is_html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("html"));
        if !is_html {
            return Some((final_url, None));
        }
        let html = resp.text().await.ok()?;
        let link = extract_pdf_link(&html, &final_url);
        Some((final_url, link))
    }

    /// A page a reader can open: the landing page if one was reached, else
    /// the DOI resolver, else the record's own URL.
    pub fn fallback_link(&self, record: &PaperRecord, landing: Option<String>) -> Option<String> {
        landing
            .or_else(|| record.doi.as_deref().map(|d| format!("{}/{}", self.endpoints.doi, d.trim())))
            .or_else(|| record.url.clone())
    }
}

/// Source-specific PDF URL patterns.
pub fn direct_candidates(record: &PaperRecord, endpoints: &ResolverEndpoints) -> Vec<String> {
    let mut out = Vec::new();
    match record.source {
        SourceKind::Arxiv => {
            let id = extract_arxiv_id(&record.id)
                .or_else(|| record.url.as_deref().and_then(extract_arxiv_id));
            if let Some(id) = id {
                out.push(format!("{}/{}.pdf", endpoints.arxiv_pdf, id));
            }
        }
        SourceKind::BioRxiv | SourceKind::MedRxiv => {
            if let Some(landing) = record.url.as_deref() {
                let base = landing.split('?').next().unwrap_or(landing).trim_end_matches('/');
                out.push(format!("{base}.full.pdf"));
                out.push(format!("{base}/full.pdf"));
            }
        }
        SourceKind::PubMed => {
            if let Some(pmcid) = record.raw_str("pmcid") {
                out.push(format!("{}/{}/pdf/", endpoints.pmc, pmcid.trim()));
            }
        }
    }
    if let Some(url) = record.url.as_deref().and_then(publisher_pdf_url) {
        push_unique(&mut out, url);
    }
    out
}

/// Publisher article pages whose PDF lives at a fixed suffix.
/// Frontiers serves `<article>/pdf` next to `<article>/full`.
pub fn publisher_pdf_url(page: &str) -> Option<String> {
    let url = Url::parse(page).ok()?;
    let host = url.host_str()?;
    if !(host == "frontiersin.org" || host.ends_with(".frontiersin.org")) {
        return None;
    }
    let path = url.path().trim_end_matches('/');
    let article = path.strip_suffix("/full").unwrap_or(path);
    if article.is_empty() || article.ends_with("/pdf") {
        return None;
    }
    Some(format!("{}://{}{}/pdf", url.scheme(), host, article))
}

fn unpaywall_pdf_urls(data: UnpaywallResponse) -> Vec<String> {
    let mut urls = Vec::new();
    for loc in data.oa_locations.iter().filter(|l| l.host_type.as_deref() == Some("publisher")) {
        if let Some(u) = &loc.url_for_pdf {
            push_unique(&mut urls, u.clone());
        }
    }
    if let Some(u) = data.best_oa_location.and_then(|b| b.url_for_pdf) {
        push_unique(&mut urls, u);
    }
    for loc in &data.oa_locations {
        if let Some(u) = &loc.url_for_pdf {
            push_unique(&mut urls, u.clone());
        }
    }
    urls
}

/// First `citation_pdf_url` meta tag, else the first anchor whose href
/// mentions `.pdf`. Relative links are resolved against `base`.
pub fn extract_pdf_link(html: &str, base: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let base = Url::parse(base).ok()?;

    let meta = Selector::parse(r#"meta[name="citation_pdf_url"]"#).ok()?;
    let from_meta = document
        .select(&meta)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty());

    let anchors = Selector::parse("a[href]").ok()?;
    let href = from_meta.or_else(|| {
        document
            .select(&anchors)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .find(|h| h.to_lowercase().contains(".pdf"))
    })?;

    base.join(href).ok().map(|u| u.to_string())
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}
