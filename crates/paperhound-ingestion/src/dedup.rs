//! Result aggregation: merge candidates from every source into one
//! deduplicated, order-preserving list.

use std::collections::HashMap;

use tracing::debug;

use crate::models::{IdentityKey, PaperRecord};

/// Provenance field added to a kept record when duplicates collapse into it.
pub const MERGED_SOURCES_KEY: &str = "merged_sources";

#[derive(Debug, Default)]
pub struct Aggregated {
    pub records: Vec<PaperRecord>,
    /// Records with neither a DOI nor a usable title.
    pub dropped: usize,
    /// Records collapsed into an earlier one.
    pub duplicates: usize,
}

/// Deduplicate by identity key. The first record seen for a key wins and
/// keeps its position; later ones only add their `source:id` label to the
/// winner's provenance. `limit` truncates after deduplication.
pub fn aggregate(candidates: Vec<PaperRecord>, limit: Option<usize>) -> Aggregated {
    let mut out = Aggregated::default();
    let mut seen: HashMap<IdentityKey, usize> = HashMap::new();

    for record in candidates {
        let Some(key) = record.identity_key() else {
            debug!(paper = %record.label(), "Dropping record without identity");
            out.dropped += 1;
            continue;
        };

        match seen.get(&key) {
            Some(&idx) => {
                let label = record.label();
                let kept = &mut out.records[idx];
                if label != kept.label() {
                    push_provenance(kept, label);
                }
                debug!(%key, "Duplicate collapsed");
                out.duplicates += 1;
            }
            None => {
                seen.insert(key, out.records.len());
                out.records.push(record);
            }
        }
    }

    if let Some(limit) = limit {
        out.records.truncate(limit);
    }
    out
}

fn push_provenance(kept: &mut PaperRecord, label: String) {
    let entry = kept
        .raw
        .entry(MERGED_SOURCES_KEY.to_string())
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let serde_json::Value::Array(list) = entry {
        let value = serde_json::Value::String(label);
        if !list.contains(&value) {
            list.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    fn rec(source: SourceKind, id: &str, title: &str, doi: Option<&str>) -> PaperRecord {
        let mut r = PaperRecord::new(source, id, title);
        r.doi = doi.map(String::from);
        r
    }

    #[test]
    fn test_doi_duplicates_collapse_first_wins() {
        let agg = aggregate(
            vec![
                rec(SourceKind::PubMed, "1", "Title A", Some("10.1/X")),
                rec(SourceKind::BioRxiv, "10.1/x", "Title A (preprint)", Some("https://doi.org/10.1/x")),
                rec(SourceKind::Arxiv, "2", "Title B", None),
            ],
            None,
        );
        assert_eq!(agg.records.len(), 2);
        assert_eq!(agg.duplicates, 1);
        assert_eq!(agg.records[0].source, SourceKind::PubMed);
        assert_eq!(agg.records[0].raw[MERGED_SOURCES_KEY], serde_json::json!(["biorxiv:10.1/x"]));
        assert_eq!(agg.records[1].id, "2");
    }

    #[test]
    fn test_title_key_when_no_doi() {
        let agg = aggregate(
            vec![
                rec(SourceKind::Arxiv, "1", "Protein  Folding", None),
                rec(SourceKind::BioRxiv, "b", "protein folding", None),
            ],
            None,
        );
        assert_eq!(agg.records.len(), 1);
        assert_eq!(agg.records[0].source, SourceKind::Arxiv);
    }

    #[test]
    fn test_records_without_identity_are_dropped() {
        let agg = aggregate(vec![rec(SourceKind::Arxiv, "1", "  ", None)], None);
        assert!(agg.records.is_empty());
        assert_eq!(agg.dropped, 1);
    }

    #[test]
    fn test_limit_applies_after_dedup() {
        let agg = aggregate(
            vec![
                rec(SourceKind::Arxiv, "1", "A", None),
                rec(SourceKind::Arxiv, "2", "A", None),
                rec(SourceKind::Arxiv, "3", "B", None),
                rec(SourceKind::Arxiv, "4", "C", None),
            ],
            Some(2),
        );
        let ids: Vec<_> = agg.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_provenance_not_repeated() {
        let agg = aggregate(
            vec![
                rec(SourceKind::PubMed, "1", "A", Some("10.1/a")),
                rec(SourceKind::BioRxiv, "b", "A", Some("10.1/a")),
                rec(SourceKind::BioRxiv, "b", "A", Some("10.1/a")),
            ],
            None,
        );
        assert_eq!(agg.records[0].raw[MERGED_SOURCES_KEY], serde_json::json!(["biorxiv:b"]));
        assert_eq!(agg.duplicates, 2);
    }
}
