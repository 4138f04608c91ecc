//! Data models for the retrieval-and-summarization pipeline.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref DOI_PREFIX: Regex =
        Regex::new(r"(?i)^(?:https?://(?:dx\.)?doi\.org/|doi:\s*)").unwrap();
}

// ── Sources ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Arxiv,
    BioRxiv,
    MedRxiv,
    PubMed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Arxiv   => "arxiv",
            SourceKind::BioRxiv => "biorxiv",
            SourceKind::MedRxiv => "medrxiv",
            SourceKind::PubMed  => "pubmed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "arxiv"   => Some(SourceKind::Arxiv),
            "biorxiv" => Some(SourceKind::BioRxiv),
            "medrxiv" => Some(SourceKind::MedRxiv),
            "pubmed"  => Some(SourceKind::PubMed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Paper records ─────────────────────────────────────────────────────────────

/// A candidate paper as normalized by a source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Source-specific ID (arXiv ID, PMID, bioRxiv DOI).
    pub id: String,
    pub doi: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub source: SourceKind,
    /// Landing page.
    pub url: Option<String>,
    pub published: Option<NaiveDate>,
    /// Opaque per-source metadata (PMCID, categories, provenance, …).
    #[serde(default)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// Key under which records are deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum IdentityKey {
    Doi(String),
    Title(String),
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKey::Doi(d) => write!(f, "doi:{d}"),
            IdentityKey::Title(t) => write!(f, "title:{t}"),
        }
    }
}

impl PaperRecord {
    pub fn new(source: SourceKind, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            doi: None,
            title: title.into(),
            authors: Vec::new(),
            abstract_text: None,
            source,
            url: None,
            published: None,
            raw: serde_json::Map::new(),
        }
    }

    /// Normalized DOI, else normalized title. `None` when both are blank.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        if let Some(doi) = self.doi.as_deref().and_then(normalize_doi) {
            return Some(IdentityKey::Doi(doi));
        }
        let title = normalize_title(&self.title);
        if title.is_empty() {
            None
        } else {
            Some(IdentityKey::Title(title))
        }
    }

    /// Human-readable identity for reports: `source:id`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }

    pub fn raw_str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(|v| v.as_str())
    }
}

/// Lower-case, strip resolver prefixes and surrounding whitespace.
pub fn normalize_doi(doi: &str) -> Option<String> {
    let trimmed = doi.trim();
    let stripped = DOI_PREFIX.replace(trimmed, "");
    let normalized = stripped.trim().to_lowercase();
    if normalized.is_empty() { None } else { Some(normalized) }
}

/// Lower-case and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    WHITESPACE.replace_all(title.trim(), " ").to_lowercase()
}

// ── Access resolution ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Pdf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Access {
    /// A checked open-access PDF. `mirrors` are further candidates in check order.
    Downloadable {
        url: String,
        format: ArtifactFormat,
        #[serde(default)]
        mirrors: Vec<String>,
    },
    /// Only a page the user can open manually.
    LinkOnly { url: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessResolution {
    pub paper: String,
    pub access: Access,
}

impl AccessResolution {
    pub fn is_downloadable(&self) -> bool {
        matches!(self.access, Access::Downloadable { .. })
    }

    /// Download candidates in preference order.
    pub fn candidate_urls(&self) -> Vec<&str> {
        match &self.access {
            Access::Downloadable { url, mirrors, .. } => {
                std::iter::once(url.as_str()).chain(mirrors.iter().map(|m| m.as_str())).collect()
            }
            _ => Vec::new(),
        }
    }
}

// ── Downloaded artifacts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedArtifact {
    pub paper: String,
    pub url: String,
    /// SHA-256 of the source URL; also the file stem in the cache.
    pub cache_key: String,
    pub path: PathBuf,
    /// SHA-256 of the file bytes.
    pub content_hash: String,
    pub size: u64,
    pub verified: bool,
    pub fetched_at: DateTime<Utc>,
}

// ── Extracted documents ───────────────────────────────────────────────────────

/// Section types inferred from headings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Abstract,
    Introduction,
    Methods,
    Results,
    Discussion,
    Conclusion,
    Acknowledgements,
    References,
    Other,
}

impl SectionKind {
    /// Infer section type from a heading string.
    pub fn from_heading(heading: &str) -> Self {
        let h = heading.to_lowercase();
        if h.contains("abstract")                                          { SectionKind::Abstract }
        else if h.contains("introduction") || h.contains("background")    { SectionKind::Introduction }
        else if h.contains("reference") || h.contains("bibliography")
            || h.contains("works cited") || h.contains("literature cited") { SectionKind::References }
        else if h.contains("method") || h.contains("material")            { SectionKind::Methods }
        else if h.contains("discussion")                                   { SectionKind::Discussion }
        else if h.contains("result")                                       { SectionKind::Results }
        else if h.contains("conclusion")                                   { SectionKind::Conclusion }
        else if h.contains("acknowledg")                                   { SectionKind::Acknowledgements }
        else                                                               { SectionKind::Other }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Abstract         => "abstract",
            SectionKind::Introduction     => "introduction",
            SectionKind::Methods          => "methods",
            SectionKind::Results          => "results",
            SectionKind::Discussion       => "discussion",
            SectionKind::Conclusion       => "conclusion",
            SectionKind::Acknowledgements => "acknowledgements",
            SectionKind::References       => "references",
            SectionKind::Other            => "other",
        }
    }

    /// Section a reader can ask for by name, e.g. on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "abstract"                 => Some(SectionKind::Abstract),
            "introduction" | "intro"   => Some(SectionKind::Introduction),
            "methods" | "method"       => Some(SectionKind::Methods),
            "results"                  => Some(SectionKind::Results),
            "discussion"               => Some(SectionKind::Discussion),
            "conclusion" | "conclusions" => Some(SectionKind::Conclusion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub heading: Option<String>,
    pub kind: SectionKind,
    pub body: String,
    /// Position in reading order, starting at 0.
    pub order: usize,
    /// Page the section starts on (1-based).
    pub page: Option<u32>,
}

impl Section {
    pub fn is_reference(&self) -> bool {
        self.kind == SectionKind::References
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub cache_key: String,
    pub title: Option<String>,
    pub page_count: usize,
    pub sections: Vec<Section>,
}

impl ExtractedDocument {
    pub fn body_text_len(&self) -> usize {
        self.sections.iter().map(|s| s.body.len()).sum()
    }
}

// ── Summaries ─────────────────────────────────────────────────────────────────

/// A model-sized span of the filtered document text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryChunk {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
    /// Byte offsets into the filtered text.
    pub start: usize,
    pub end: usize,
    /// `order` of the first and last section this chunk touches.
    pub first_section: usize,
    pub last_section: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_index: usize,
    /// `None` when the model failed or returned nothing for this chunk.
    pub summary: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub cache_key: String,
    pub model: String,
    pub chunk_summaries: Vec<ChunkSummary>,
    pub aggregate: String,
    pub second_pass: bool,
}
