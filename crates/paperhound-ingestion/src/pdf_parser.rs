//! lopdf-based text extraction with section detection.
//!
//! Text comes from lopdf's per-page extraction. Headings are recognised by
//! name (optionally numbered) or by being set noticeably larger than the
//! body font; font sizes are read from the page content streams.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use lopdf::content::Content;
use lopdf::{Document, Object};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::models::{DownloadedArtifact, ExtractedDocument, Section, SectionKind};

/// A line this much larger than the body font may be a heading.
const HEADING_SIZE_RATIO: f32 = 1.15;
const MAX_HEADING_WORDS: usize = 12;

lazy_static! {
    static ref KNOWN_HEADING: Regex = Regex::new(
        r"(?i)^(?:(?:\d+(?:\.\d+)*|[ivxlc]+)\.?\s+)?(?:abstract|introduction|background|materials\s+and\s+methods|methods|methodology|results(?:\s+and\s+discussion)?|discussion|conclusions?|references|bibliography|acknowledge?ments?)\s*:?$"
    )
    .unwrap();
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("artifact {0} has not been verified")]
    Unverified(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parse error: {0}")]
    Parse(String),

    #[error("no extractable text on any page")]
    NoTextLayer,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextExtractor;

impl TextExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract sections from a verified artifact. Parsing runs on the
    /// blocking pool.
    #[instrument(skip(self, artifact), fields(paper = %artifact.paper, key = %artifact.cache_key))]
    pub async fn extract(&self, artifact: &DownloadedArtifact) -> Result<ExtractedDocument, ExtractionError> {
        if !artifact.verified {
            return Err(ExtractionError::Unverified(artifact.cache_key.clone()));
        }
        let path = artifact.path.clone();
        let key = artifact.cache_key.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(&path)?;
            extract_from_bytes(&key, &bytes)
        })
        .await
        .map_err(|e| ExtractionError::Parse(format!("extraction task failed: {e}")))?
    }
}

/// Parse PDF bytes into an [`ExtractedDocument`].
pub fn extract_from_bytes(cache_key: &str, bytes: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
    let doc = Document::load_mem(bytes).map_err(|e| ExtractionError::Parse(e.to_string()))?;
    let pages = doc.get_pages();

    let mut page_texts: Vec<(u32, String)> = Vec::with_capacity(pages.len());
    for &page_num in pages.keys() {
        let text = doc.extract_text(&[page_num]).unwrap_or_else(|e| {
            warn!(page = page_num, error = %e, "Page text extraction failed");
            String::new()
        });
        page_texts.push((page_num, text));
    }

    if page_texts.iter().all(|(_, t)| t.trim().is_empty()) {
        return Err(ExtractionError::NoTextLayer);
    }

    let large_lines = large_font_lines(&doc);
    let sections = detect_sections(&page_texts, &large_lines);
    debug!(pages = page_texts.len(), sections = sections.len(), "Extracted");

    Ok(ExtractedDocument {
        cache_key: cache_key.to_string(),
        title: extract_title(&page_texts),
        page_count: page_texts.len(),
        sections,
    })
}

/// Is this line a section heading?
pub fn is_heading(line: &str, large_lines: &HashSet<String>) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    if KNOWN_HEADING.is_match(line) {
        return true;
    }
    large_lines.contains(&normalize_line(line)) && looks_like_heading(line)
}

/// Short, no sentence punctuation at the end, contains a letter.
fn looks_like_heading(line: &str) -> bool {
    let words = line.split_whitespace().count();
    words > 0
        && words <= MAX_HEADING_WORDS
        && !line.ends_with(['.', ',', ';'])
        && line.chars().any(char::is_alphabetic)
}

/// Split page text into sections at heading lines.
pub fn detect_sections(pages: &[(u32, String)], large_lines: &HashSet<String>) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut heading: Option<String> = None;
    let mut start_page: Option<u32> = pages.first().map(|(p, _)| *p);
    let mut body: Vec<&str> = Vec::new();

    for (page_num, text) in pages {
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if is_heading(trimmed, large_lines) {
                push_section(heading.take(), &mut body, start_page, &mut sections);
                heading = Some(trimmed.to_string());
                start_page = Some(*page_num);
            } else {
                body.push(trimmed);
            }
        }
    }
    push_section(heading, &mut body, start_page, &mut sections);
    sections
}

fn push_section(heading: Option<String>, body: &mut Vec<&str>, page: Option<u32>, sections: &mut Vec<Section>) {
    let text = body.join("\n").trim().to_string();
    body.clear();
    if heading.is_none() && text.is_empty() {
        return;
    }
    let kind = heading.as_deref().map(SectionKind::from_heading).unwrap_or(SectionKind::Other);
    let order = sections.len();
    sections.push(Section { heading, kind, body: text, order, page });
}

fn extract_title(pages: &[(u32, String)]) -> Option<String> {
    pages
        .first()?
        .1
        .lines()
        .map(str::trim)
        .find(|l| l.len() > 10 && !KNOWN_HEADING.is_match(l))
        .map(String::from)
}

fn normalize_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(f) => Some(*f as f32),
        _ => None,
    }
}

fn push_operand_text(out: &mut String, obj: &Object) {
    match obj {
        // Latin-1 is close enough to match lines against extracted text.
        Object::String(bytes, _) => out.extend(bytes.iter().map(|&b| b as char)),
        Object::Array(items) => items.iter().for_each(|i| push_operand_text(out, i)),
        _ => {}
    }
}

/// Lines (normalized) set at least [`HEADING_SIZE_RATIO`] times the body
/// font size. The body size is the size covering the most characters.
pub fn large_font_lines(doc: &Document) -> HashSet<String> {
    let mut runs: Vec<(String, f32)> = Vec::new();

    for page_id in doc.get_pages().values() {
        let Ok(data) = doc.get_page_content(*page_id) else { continue };
        let Ok(content) = Content::decode(&data) else { continue };

        let mut size = 0.0f32;
        let mut line = String::new();
        let mut line_size = 0.0f32;
        for op in &content.operations {
            match op.operator.as_str() {
                "Tf" => {
                    if let Some(s) = op.operands.get(1).and_then(number) {
                        size = s;
                    }
                }
                "Tj" | "TJ" | "'" | "\"" => {
                    if let Some(text_operand) = op.operands.last() {
                        push_operand_text(&mut line, text_operand);
                        line_size = line_size.max(size);
                    }
                }
                "ET" | "Td" | "TD" | "T*" => {
                    if !line.trim().is_empty() {
                        runs.push((normalize_line(&line), line_size));
                    }
                    line.clear();
                    line_size = 0.0;
                }
                _ => {}
            }
        }
        if !line.trim().is_empty() {
            runs.push((normalize_line(&line), line_size));
        }
    }

    let mut weight: HashMap<u32, usize> = HashMap::new();
    for (text, size) in &runs {
        *weight.entry((size * 10.0).round() as u32).or_default() += text.len();
    }
    let Some((&body_key, _)) = weight.iter().max_by_key(|(k, w)| (**w, **k)) else {
        return HashSet::new();
    };
    let body = body_key as f32 / 10.0;
    if body <= 0.0 {
        return HashSet::new();
    }

    runs.into_iter()
        .filter(|(_, size)| *size >= body * HEADING_SIZE_RATIO)
        .map(|(text, _)| text)
        .collect()
}
