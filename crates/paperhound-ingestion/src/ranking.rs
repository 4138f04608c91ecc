//! Topic relevance ranking for the aggregated result list.
//!
//! Score = cosine similarity between term-frequency vectors of the topic
//! keywords and of a record's title plus abstract.

use std::collections::HashMap;

use tracing::debug;

use crate::models::PaperRecord;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "by", "for", "from", "in", "is", "of", "on", "or", "the", "to", "with",
];

fn terms(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(&w.as_str()))
    {
        *tf.entry(word).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a.iter().filter_map(|(t, x)| b.get(t).map(|y| x * y)).sum();
    let norm_a: f64 = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn record_terms(record: &PaperRecord) -> HashMap<String, f64> {
    terms(&format!("{} {}", record.title, record.abstract_text.as_deref().unwrap_or("")))
}

/// Relevance of one record to the topic, in [0, 1].
pub fn relevance(record: &PaperRecord, keywords: &[String]) -> f64 {
    cosine_similarity(&terms(&keywords.join(" ")), &record_terms(record))
}

/// Best match first. The sort is stable, so equal scores keep their
/// incoming order; no keywords leaves the list untouched.
pub fn rank_by_relevance(records: Vec<PaperRecord>, keywords: &[String]) -> Vec<PaperRecord> {
    let query = terms(&keywords.join(" "));
    if query.is_empty() {
        return records;
    }
    let mut scored: Vec<(f64, PaperRecord)> = records
        .into_iter()
        .map(|r| (cosine_similarity(&query, &record_terms(&r)), r))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    debug!(records = scored.len(), top = scored.first().map(|(s, _)| *s), "Ranked by relevance");
    scored.into_iter().map(|(_, r)| r).collect()
}
