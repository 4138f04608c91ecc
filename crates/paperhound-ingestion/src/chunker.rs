//! Sentence-aware chunking of extracted documents for the summarizer.
//!
//! Chunks are byte ranges of the filtered document text, so joining every
//! chunk in order gives back exactly the text that was chunked. Whitespace
//! after a sentence stays with that sentence.

use std::ops::Range;

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{ExtractedDocument, SummaryChunk};

lazy_static! {
    static ref SENTENCE_END: Regex = Regex::new(r#"[.!?]["')\]]*\s+|\n[ \t]*\n\s*"#).unwrap();
    static ref WORD: Regex = Regex::new(r"\S+").unwrap();
}

/// Separator placed between section bodies.
pub const SECTION_SEPARATOR: &str = "\n\n";

/// Rough token estimation: words / 0.75 (WordPiece averages ~1.3 tokens/word).
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 4).div_ceil(3)
}

/// Largest word count whose estimate fits in `max_tokens`.
fn words_for_tokens(max_tokens: usize) -> usize {
    (max_tokens * 3 / 4).max(1)
}

/// Cut `text` after the last word that still fits in `max_tokens`,
/// keeping the original spacing between the kept words.
pub fn clip_to_tokens(text: &str, max_tokens: usize) -> &str {
    let text = text.trim();
    if estimate_tokens(text) <= max_tokens {
        return text;
    }
    let keep = max_tokens * 3 / 4;
    if keep == 0 {
        return "";
    }
    match WORD.find_iter(text).nth(keep - 1) {
        Some(last) => &text[..last.end()],
        None => text,
    }
}

/// Document text the summarizer sees, with section start offsets.
#[derive(Debug, Clone, Default)]
pub struct FilteredText {
    pub text: String,
    /// `(byte offset, section order)`, ascending.
    pub sections: Vec<(usize, usize)>,
}

impl FilteredText {
    /// Section `order` covering `offset`. Separators belong to the
    /// section before them.
    pub fn section_at(&self, offset: usize) -> usize {
        let idx = self.sections.partition_point(|(start, _)| *start <= offset);
        self.sections.get(idx.saturating_sub(1)).map(|(_, order)| *order).unwrap_or(0)
    }
}

/// Join section bodies with a blank line, skipping references unless asked
/// and skipping empty bodies.
pub fn filtered_text(doc: &ExtractedDocument, include_references: bool) -> FilteredText {
    let mut out = FilteredText::default();
    for section in &doc.sections {
        if section.body.trim().is_empty() || (section.is_reference() && !include_references) {
            continue;
        }
        if !out.text.is_empty() {
            out.text.push_str(SECTION_SEPARATOR);
        }
        out.sections.push((out.text.len(), section.order));
        out.text.push_str(&section.body);
    }
    out
}

/// Sentence spans covering all of `text`.
fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        spans.push(start..m.end());
        start = m.end();
    }
    if start < text.len() {
        spans.push(start..text.len());
    }
    spans
}

/// Split `text` into ranges of at most `max_tokens` estimated tokens.
///
/// Sentences are packed greedily; a sentence too long on its own is cut
/// at word boundaries. Returns nothing when `text` has no words.
pub fn chunk_ranges(text: &str, max_tokens: usize) -> Vec<Range<usize>> {
    let max_words = words_for_tokens(max_tokens);
    let mut chunks: Vec<Range<usize>> = Vec::new();
    let mut cur_start = 0;
    let mut cur_words = 0;

    for span in sentence_spans(text) {
        let words: Vec<usize> = WORD.find_iter(&text[span.clone()]).map(|m| span.start + m.start()).collect();
        let n = words.len();

        if n > max_words {
            if cur_words > 0 {
                chunks.push(cur_start..span.start);
                cur_start = span.start;
            }
            let mut k = max_words;
            while k < n {
                chunks.push(cur_start..words[k]);
                cur_start = words[k];
                k += max_words;
            }
            cur_words = n - (k - max_words);
            continue;
        }

        if cur_words + n > max_words {
            chunks.push(cur_start..span.start);
            cur_start = span.start;
            cur_words = 0;
        }
        cur_words += n;
    }

    if cur_words > 0 {
        chunks.push(cur_start..text.len());
    } else if let Some(last) = chunks.last_mut() {
        last.end = text.len();
    }
    chunks
}

/// Chunk a document's filtered text.
pub fn chunk_document(doc: &ExtractedDocument, max_tokens: usize, include_references: bool) -> Vec<SummaryChunk> {
    let filtered = filtered_text(doc, include_references);
    build_chunks(&filtered, max_tokens)
}

/// Chunk free text that has no section structure.
pub fn chunk_plain(text: &str, max_tokens: usize) -> Vec<SummaryChunk> {
    let filtered = FilteredText { text: text.to_string(), sections: vec![(0, 0)] };
    build_chunks(&filtered, max_tokens)
}

fn build_chunks(filtered: &FilteredText, max_tokens: usize) -> Vec<SummaryChunk> {
    chunk_ranges(&filtered.text, max_tokens)
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let text = &filtered.text[range.clone()];
            let lead = text.len() - text.trim_start().len();
            let content_end = range.start + text.trim_end().len();
            SummaryChunk {
                index,
                text: text.to_string(),
                token_count: estimate_tokens(text),
                start: range.start,
                end: range.end,
                first_section: filtered.section_at(range.start + lead),
                last_section: filtered.section_at(content_end.saturating_sub(1).max(range.start)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Section, SectionKind};

    fn section(order: usize, kind: SectionKind, body: &str) -> Section {
        Section {
            heading: Some(kind.as_str().to_string()),
            kind,
            body: body.to_string(),
            order,
            page: Some(1),
        }
    }

    fn doc(sections: Vec<Section>) -> ExtractedDocument {
        ExtractedDocument { cache_key: "k".into(), title: None, page_count: 1, sections }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two three"), 4);
        assert_eq!(estimate_tokens("a b c d e f"), 8);
    }

    #[test]
    fn test_clip_to_tokens_keeps_whole_words() {
        assert_eq!(clip_to_tokens("  short text ", 10), "short text");
        let clipped = clip_to_tokens("alpha beta\ngamma delta epsilon zeta", 4);
        assert_eq!(clipped, "alpha beta\ngamma");
        assert!(estimate_tokens(clipped) <= 4);
        assert_eq!(clip_to_tokens("alpha beta", 1), "");
    }

    #[test]
    fn test_chunks_reassemble_exactly() {
        let text = "First sentence here. Second one!  Third? Fourth sentence\nwith a line break. Fifth.";
        let ranges = chunk_ranges(text, 16);
        let joined: String = ranges.iter().map(|r| &text[r.clone()]).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_chunks_respect_budget_and_sentences() {
        let text = "One two three four five six. Seven eight nine ten eleven twelve. Thirteen fourteen.";
        let ranges = chunk_ranges(text, 16); // 12 words
        assert_eq!(ranges.len(), 2);
        assert_eq!(&text[ranges[0].clone()], "One two three four five six. Seven eight nine ten eleven twelve. ");
        assert_eq!(&text[ranges[1].clone()], "Thirteen fourteen.");
        for r in &ranges {
            assert!(estimate_tokens(&text[r.clone()]) <= 16);
        }
    }

    #[test]
    fn test_oversize_sentence_split_at_words() {
        let words: Vec<String> = (0..30).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let ranges = chunk_ranges(&text, 16);
        assert_eq!(ranges.len(), 3);
        for r in &ranges {
            let piece = &text[r.clone()];
            assert!(estimate_tokens(piece) <= 16);
            assert!(!piece.starts_with(' '));
        }
        assert_eq!(&text[ranges[1].clone()], "w12 w13 w14 w15 w16 w17 w18 w19 w20 w21 w22 w23 ");
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_ranges("", 64).is_empty());
        assert!(chunk_ranges("   \n ", 64).is_empty());
    }

    #[test]
    fn test_references_excluded_by_default() {
        let d = doc(vec![
            section(0, SectionKind::Introduction, "Intro text."),
            section(1, SectionKind::Methods, ""),
            section(2, SectionKind::Results, "Results text."),
            section(3, SectionKind::References, "[1] Someone."),
        ]);
        let f = filtered_text(&d, false);
        assert_eq!(f.text, "Intro text.\n\nResults text.");
        assert_eq!(f.sections, vec![(0, 0), (13, 2)]);
        assert!(filtered_text(&d, true).text.ends_with("[1] Someone."));
    }

    #[test]
    fn test_chunks_track_sections() {
        let d = doc(vec![
            section(0, SectionKind::Introduction, "Alpha beta gamma delta."),
            section(1, SectionKind::Results, "Epsilon zeta eta theta."),
        ]);
        let chunks = chunk_document(&d, 16, false);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].first_section, chunks[0].last_section), (0, 1));

        let chunks = chunk_document(&d, 4, false); // 3 words per chunk
        assert_eq!(chunks.first().map(|c| c.first_section), Some(0));
        assert_eq!(chunks.last().map(|c| c.last_section), Some(1));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, filtered_text(&d, false).text);
    }
}
