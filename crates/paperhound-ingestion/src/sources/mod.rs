//! Bibliographic source clients.
//!
//! Each adapter is the only place its catalog's response schema is handled;
//! everything downstream sees [`PaperRecord`].

pub mod arxiv;
pub mod biorxiv;
pub mod pubmed;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use paperhound_common::PaperhoundError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{PaperRecord, SourceKind};

// ── Query ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Topic,
    Author,
    Both,
}

impl SearchMode {
    pub fn uses_topic(&self) -> bool {
        matches!(self, SearchMode::Topic | SearchMode::Both)
    }

    pub fn uses_author(&self) -> bool {
        matches!(self, SearchMode::Author | SearchMode::Both)
    }
}

/// Inclusive publication-year range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct YearRange {
    pub from: i32,
    pub to: i32,
}

impl YearRange {
    pub fn single(year: i32) -> Self {
        Self { from: year, to: year }
    }

    pub fn contains(&self, year: i32) -> bool {
        year >= self.from && year <= self.to
    }
}

/// One search request, shared by every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Comma-separated keywords; every keyword must match.
    pub topic: String,
    pub author: Option<String>,
    #[serde(default)]
    pub mode: SearchMode,
    pub max_results: usize,
    #[serde(default)]
    pub years: Option<YearRange>,
    /// Paging offset for sources that support it.
    #[serde(default)]
    pub offset: usize,
}

impl SearchQuery {
    pub fn topic(topic: impl Into<String>, max_results: usize) -> Self {
        Self {
            topic: topic.into(),
            author: None,
            mode: SearchMode::Topic,
            max_results,
            years: None,
            offset: 0,
        }
    }

    /// Lower-cased, trimmed, non-empty keywords.
    pub fn keywords(&self) -> Vec<String> {
        parse_topics(&self.topic)
    }

    /// Client-side strict filter for catalogs whose API matching is broad.
    pub fn matches(&self, title: &str, abstract_text: &str, authors: &[String]) -> bool {
        if self.mode.uses_topic() {
            let keywords = self.keywords();
            if !(contains_all_keywords(title, &keywords) || contains_all_keywords(abstract_text, &keywords)) {
                return false;
            }
        }
        if self.mode.uses_author() {
            let wanted = self.author.as_deref().unwrap_or("").trim().to_lowercase();
            if wanted.is_empty() || !authors.iter().any(|a| a.to_lowercase().contains(&wanted)) {
                return false;
            }
        }
        true
    }

    pub fn year_allowed(&self, year: Option<i32>) -> bool {
        match (self.years, year) {
            (Some(range), Some(y)) => range.contains(y),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

pub fn parse_topics(topic: &str) -> Vec<String> {
    topic
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn contains_all_keywords(text: &str, keywords: &[String]) -> bool {
    let text = text.to_lowercase();
    keywords.iter().all(|k| text.contains(k.as_str()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SourceQueryError {
    #[error("{catalog} request failed: {error}")]
    Http { catalog: SourceKind, error: reqwest::Error },

    #[error("{catalog} returned HTTP {status}")]
    Status { catalog: SourceKind, status: u16 },

    #[error("{catalog} response could not be parsed: {message}")]
    Parse { catalog: SourceKind, message: String },

    #[error(transparent)]
    Client(#[from] PaperhoundError),
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Common interface for all bibliographic source clients.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Run one query and return normalized candidates.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperRecord>, SourceQueryError>;
}

/// Candidates from every source, in source order, plus per-source failures.
#[derive(Debug, Default)]
pub struct SourceResults {
    pub records: Vec<PaperRecord>,
    pub errors: Vec<(SourceKind, SourceQueryError)>,
}

/// Query all sources concurrently. Output order follows `sources`, not
/// completion order; one failing source never hides the others.
pub async fn search_all(sources: &[Arc<dyn SourceClient>], query: &SearchQuery) -> SourceResults {
    let outcomes = join_all(sources.iter().map(|s| async move { (s.kind(), s.search(query).await) })).await;

    let mut results = SourceResults::default();
    for (kind, outcome) in outcomes {
        match outcome {
            Ok(records) => {
                info!(source = %kind, n = records.len(), "Papers retrieved");
                results.records.extend(records);
            }
            Err(e) => {
                warn!(source = %kind, error = %e, "Source query failed");
                results.errors.push((kind, e));
            }
        }
    }
    results
}
