//! bioRxiv / medRxiv preprint client.
//!
//! Uses the bioRxiv REST API:
//!   https://api.biorxiv.org/details/{server}/{from}/{to}/{cursor}/json
//!
//! The API has no free-text search, so we page through a date interval and
//! filter client-side.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use paperhound_common::SandboxClient;
use tracing::{debug, instrument, warn};

use super::{SearchQuery, SourceClient, SourceQueryError};
use crate::models::{PaperRecord, SourceKind};

const BIORXIV_API_URL: &str = "https://api.biorxiv.org";
/// Records the details endpoint returns per cursor page.
const PAGE_SIZE: usize = 100;
const DEFAULT_MAX_PAGES: usize = 10;
const ROLLING_WINDOW_DAYS: i64 = 730;

pub struct BioRxivClient {
    client: SandboxClient,
    /// "biorxiv" or "medrxiv"
    server: &'static str,
    base: String,
    max_pages: usize,
}

impl BioRxivClient {
    pub fn new_biorxiv(client: SandboxClient) -> Self {
        Self { client, server: "biorxiv", base: BIORXIV_API_URL.to_string(), max_pages: DEFAULT_MAX_PAGES }
    }

    pub fn new_medrxiv(client: SandboxClient) -> Self {
        Self { client, server: "medrxiv", base: BIORXIV_API_URL.to_string(), max_pages: DEFAULT_MAX_PAGES }
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages.max(1);
        self
    }

    fn source_kind(&self) -> SourceKind {
        if self.server == "medrxiv" { SourceKind::MedRxiv } else { SourceKind::BioRxiv }
    }

    /// Date interval to page through: the requested years, else the last two years.
    fn interval(&self, query: &SearchQuery) -> (NaiveDate, NaiveDate) {
        let today = Utc::now().date_naive();
        match query.years {
            Some(range) => {
                let from = NaiveDate::from_ymd_opt(range.from, 1, 1).unwrap_or(today);
                let to = NaiveDate::from_ymd_opt(range.to, 12, 31).unwrap_or(today).min(today);
                (from, to)
            }
            None => (today - chrono::Duration::days(ROLLING_WINDOW_DAYS), today),
        }
    }

    /// Normalize one element of the API's `collection` array.
    fn to_record(&self, item: &serde_json::Value) -> Option<PaperRecord> {
        let doi = item["doi"].as_str()?.trim().to_string();
        let title = item["title"].as_str().unwrap_or("").trim().to_string();
        if doi.is_empty() || title.is_empty() {
            return None;
        }

        let mut record = PaperRecord::new(self.source_kind(), doi.clone(), title);
        record.authors = item["authors"]
            .as_str()
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        record.abstract_text = item["abstract"].as_str().map(|s| s.trim().to_string());
        record.published = item["date"].as_str().and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        let version = item["version"].as_str().unwrap_or("1");
        record.url = Some(format!("https://www.{}.org/content/{}v{}", self.server, doi, version));
        record.doi = Some(doi);

        if let Some(category) = item["category"].as_str() {
            record.raw.insert("category".into(), category.into());
        }
        if let Some(published_doi) = item["published"].as_str().filter(|p| *p != "NA") {
            record.raw.insert("journal_doi".into(), published_doi.into());
        }
        record.raw.insert("version".into(), version.into());
        Some(record)
    }
}

#[async_trait]
impl SourceClient for BioRxivClient {
    fn kind(&self) -> SourceKind {
        self.source_kind()
    }

    #[instrument(skip(self, query), fields(server = self.server, topic = %query.topic))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperRecord>, SourceQueryError> {
        let catalog = self.source_kind();
        let (from, to) = self.interval(query);
        let mut papers = Vec::new();
        let mut cursor = query.offset;

        for _ in 0..self.max_pages {
            let url = format!("{}/details/{}/{}/{}/{}/json", self.base, self.server, from, to, cursor);
            let resp = self.client
                .get(&url)?
                .send()
                .await
                .map_err(|error| SourceQueryError::Http { catalog, error })?;

            if !resp.status().is_success() {
                return Err(SourceQueryError::Status { catalog, status: resp.status().as_u16() });
            }

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|error| SourceQueryError::Http { catalog, error })?;

            let collection = match body["collection"].as_array() {
                Some(c) => c,
                None => {
                    // The API reports an empty interval as a message with no collection.
                    let status = body["messages"][0]["status"].as_str().unwrap_or("");
                    if status == "ok" || status.starts_with("no posts") {
                        break;
                    }
                    return Err(SourceQueryError::Parse {
                        catalog,
                        message: "response has no collection array".into(),
                    });
                }
            };
            debug!(cursor, fetched = collection.len(), "bioRxiv API page");

            papers.extend(
                collection
                    .iter()
                    .filter_map(|item| self.to_record(item))
                    .filter(|p| {
                        query.matches(&p.title, p.abstract_text.as_deref().unwrap_or(""), &p.authors)
                            && query.year_allowed(p.published.map(|d| d.year()))
                    }),
            );

            if papers.len() >= query.max_results || collection.len() < PAGE_SIZE {
                break;
            }
            cursor += collection.len();
        }

        if papers.is_empty() {
            warn!(server = self.server, %from, %to, "No matching preprints in interval");
        }
        papers.truncate(query.max_results);
        Ok(papers)
    }
}
