//! arXiv Atom API client.
//!
//! Endpoint: http://export.arxiv.org/api/query
//!
//! The API's matching is broad (any term, any field), so we over-fetch and
//! apply the strict keyword/author logic from [`SearchQuery::matches`].

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use paperhound_common::SandboxClient;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use tracing::{debug, instrument, warn};

use super::{SearchMode, SearchQuery, SourceClient, SourceQueryError};
use crate::models::{normalize_title, PaperRecord, SourceKind};

const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";
/// Broad API matches per requested result.
const OVERFETCH_FACTOR: usize = 5;

lazy_static! {
    static ref VERSION_SUFFIX: Regex = Regex::new(r"v\d+$").unwrap();
    static ref NEW_STYLE_ID: Regex = Regex::new(r"(\d{4}\.\d{4,5})(?:v\d+)?").unwrap();
    static ref OLD_STYLE_ID: Regex = Regex::new(r"([a-z][a-z.-]*/\d{7})(?:v\d+)?").unwrap();
}

pub struct ArxivClient {
    client: SandboxClient,
    base: String,
}

impl ArxivClient {
    pub fn new(client: SandboxClient) -> Self {
        Self { client, base: ARXIV_API_URL.to_string() }
    }

    /// Point the client at a different API root (mirrors, tests).
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }
}

/// Build the `search_query` parameter.
pub fn build_search_query(query: &SearchQuery) -> String {
    let topic_part = query
        .keywords()
        .iter()
        .map(|k| format!("all:\"{k}\""))
        .collect::<Vec<_>>()
        .join(" AND ");
    let author_part = query.author.as_deref().map(|a| format!("au:\"{}\"", a.trim()));

    match (query.mode, author_part) {
        (SearchMode::Author, Some(a)) => a,
        (SearchMode::Both, Some(a)) if !topic_part.is_empty() => format!("{topic_part} AND {a}"),
        _ => topic_part,
    }
}

/// Extract an arXiv identifier (without version) from an ID, URL or arXiv DOI.
pub fn extract_arxiv_id(input: &str) -> Option<String> {
    if let Some(cap) = NEW_STYLE_ID.captures(input) {
        return Some(cap[1].to_string());
    }
    OLD_STYLE_ID.captures(input).map(|cap| cap[1].to_string())
}

#[async_trait]
impl SourceClient for ArxivClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Arxiv
    }

    #[instrument(skip(self, query), fields(topic = %query.topic))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperRecord>, SourceQueryError> {
        let search_query = build_search_query(query);
        if search_query.is_empty() {
            return Ok(Vec::new());
        }

        let params = [
            ("search_query", search_query),
            ("start", query.offset.to_string()),
            ("max_results", (query.max_results * OVERFETCH_FACTOR).to_string()),
        ];

        let resp = self.client
            .get(&self.base)?
            .query(&params)
            .send()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::Arxiv, error })?;

        if !resp.status().is_success() {
            return Err(SourceQueryError::Status { catalog: SourceKind::Arxiv, status: resp.status().as_u16() });
        }

        let xml = resp
            .text()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::Arxiv, error })?;

        let entries = parse_atom_feed(&xml)?;
        debug!(fetched = entries.len(), "arXiv API response");

        let papers: Vec<PaperRecord> = entries
            .into_iter()
            .filter(|p| {
                query.matches(&p.title, p.abstract_text.as_deref().unwrap_or(""), &p.authors)
                    && query.year_allowed(p.published.map(|d| d.year()))
            })
            .take(query.max_results)
            .collect();

        Ok(papers)
    }
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
    Doi,
}

/// Parse an arXiv Atom feed into records.
pub fn parse_atom_feed(xml: &str) -> Result<Vec<PaperRecord>, SourceQueryError> {
    let mut papers = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<PaperRecord> = None;
    let mut field = Field::None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.name().as_ref() {
                    b"entry" => current = Some(PaperRecord::new(SourceKind::Arxiv, "", "")),
                    b"id" if current.is_some() => field = Field::Id,
                    b"title" if current.is_some() => field = Field::Title,
                    b"summary" if current.is_some() => field = Field::Summary,
                    b"published" if current.is_some() => field = Field::Published,
                    b"name" if current.is_some() => field = Field::AuthorName,
                    b"arxiv:doi" if current.is_some() => field = Field::Doi,
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                if let (Some(p), true) = (current.as_mut(), e.name().as_ref() == b"link") {
                    let href = attr_value(e, b"href");
                    let rel = attr_value(e, b"rel");
                    let title = attr_value(e, b"title");
                    if title.as_deref() == Some("pdf") {
                        if let Some(h) = href {
                            p.raw.insert("pdf_url".into(), serde_json::Value::String(h));
                        }
                    } else if rel.as_deref() == Some("alternate") {
                        p.url = href;
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if field != Field::None {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                if let Some(ref mut p) = current {
                    let value = std::mem::take(&mut text);
                    match (field, name.as_ref()) {
                        (Field::Id, b"id") => {
                            let id = value.rsplit("/abs/").next().unwrap_or(&value).trim();
                            p.id = VERSION_SUFFIX.replace(id, "").to_string();
                        }
                        (Field::Title, b"title") => p.title = collapse(&value),
                        (Field::Summary, b"summary") => p.abstract_text = Some(collapse(&value)),
                        (Field::Published, b"published") => {
                            p.published = value.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
                        }
                        (Field::AuthorName, b"name") => p.authors.push(collapse(&value)),
                        (Field::Doi, b"arxiv:doi") => p.doi = Some(value.trim().to_string()),
                        _ => {}
                    }
                    field = Field::None;
                }
                if name.as_ref() == b"entry" {
                    if let Some(p) = current.take() {
                        if p.id.is_empty() || normalize_title(&p.title).is_empty() {
                            warn!("Skipping arXiv entry without id or title");
                        } else {
                            papers.push(p);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceQueryError::Parse {
                    catalog: SourceKind::Arxiv,
                    message: e.to_string(),
                });
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
