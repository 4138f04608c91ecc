//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi
//!
//! PubMed's own field-tagged query is already strict, so no client-side
//! keyword filter is applied here.

use async_trait::async_trait;
use chrono::NaiveDate;
use paperhound_common::SandboxClient;
use quick_xml::events::Event;
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument, warn};

use super::{SearchMode, SearchQuery, SourceClient, SourceQueryError};
use crate::models::{PaperRecord, SourceKind};

const EUTILS_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

pub struct PubMedClient {
    client: SandboxClient,
    base: String,
    api_key: Option<SecretString>,
}

impl PubMedClient {
    pub fn new(client: SandboxClient, api_key: Option<SecretString>) -> Self {
        Self { client, base: EUTILS_URL.to_string(), api_key }
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn push_key(&self, params: &mut Vec<(&'static str, String)>) {
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.expose_secret().to_string()));
        }
    }

    /// Search PubMed and return a page of PMIDs.
    #[instrument(skip(self))]
    async fn esearch(&self, term: &str, retstart: usize, retmax: usize) -> Result<Vec<String>, SourceQueryError> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("term", term.to_string()),
            ("retstart", retstart.to_string()),
            ("retmax", retmax.to_string()),
            ("retmode", "json".to_string()),
            ("sort", "relevance".to_string()),
        ];
        self.push_key(&mut params);

        let resp = self.client
            .get(&format!("{}/esearch.fcgi", self.base))?
            .query(&params)
            .send()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::PubMed, error })?;
        if !resp.status().is_success() {
            return Err(SourceQueryError::Status { catalog: SourceKind::PubMed, status: resp.status().as_u16() });
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::PubMed, error })?;

        let ids = body["esearchresult"]["idlist"]
            .as_array()
            .ok_or_else(|| SourceQueryError::Parse {
                catalog: SourceKind::PubMed,
                message: "esearch response has no idlist".into(),
            })?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect::<Vec<_>>();

        debug!(n = ids.len(), "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    /// Fetch PubMed XML for a list of PMIDs and parse it.
    #[instrument(skip(self, pmids), fields(n = pmids.len()))]
    async fn efetch(&self, pmids: &[String]) -> Result<Vec<PaperRecord>, SourceQueryError> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("id", pmids.join(",")),
            ("retmode", "xml".to_string()),
        ];
        self.push_key(&mut params);

        let resp = self.client
            .get(&format!("{}/efetch.fcgi", self.base))?
            .query(&params)
            .send()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::PubMed, error })?;
        if !resp.status().is_success() {
            return Err(SourceQueryError::Status { catalog: SourceKind::PubMed, status: resp.status().as_u16() });
        }
        let xml = resp
            .text()
            .await
            .map_err(|error| SourceQueryError::Http { catalog: SourceKind::PubMed, error })?;

        parse_pubmed_xml(&xml)
    }
}

#[async_trait]
impl SourceClient for PubMedClient {
    fn kind(&self) -> SourceKind {
        SourceKind::PubMed
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperRecord>, SourceQueryError> {
        let Some(term) = build_pubmed_query(query) else {
            return Ok(Vec::new());
        };
        let pmids = self.esearch(&term, query.offset, query.max_results).await?;
        self.efetch(&pmids).await
    }
}

/// Build the esearch `term`.
///
/// One topic keyword is sent bare so PubMed's automatic term mapping
/// applies; several are each pinned to title/abstract and AND-ed.
pub fn build_pubmed_query(query: &SearchQuery) -> Option<String> {
    let keywords = query.keywords();
    let topic = match keywords.len() {
        0 => None,
        1 => Some(keywords[0].clone()),
        _ => Some(
            keywords
                .iter()
                .map(|k| format!("\"{k}\"[Title/Abstract]"))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    };
    let author = query
        .author
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| format!("\"{a}\"[Author]"));

    let base = match query.mode {
        SearchMode::Topic => topic?,
        SearchMode::Author => author?,
        SearchMode::Both => match (topic, author) {
            (Some(t), Some(a)) => format!("{t} AND {a}"),
            _ => return None,
        },
    };

    Some(match query.years {
        Some(r) if r.from == r.to => format!("{base} AND ({}[pdat])", r.from),
        Some(r) => format!("{base} AND ({}:{}[pdat])", r.from, r.to),
        None => base,
    })
}

/// Parse PubMed XML (efetch) into records.
///
/// Handles the `<PubmedArticleSet><PubmedArticle>` structure. Text is
/// accumulated across inline markup (`<i>`, `<sup>`) inside titles and
/// abstracts; IDs inside `<ReferenceList>` belong to cited works and are
/// ignored.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<PaperRecord>, SourceQueryError> {
    let mut papers = Vec::new();
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<PaperRecord> = None;
    let mut title = String::new();
    let mut abstract_parts: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut last_name = String::new();
    let mut fore_name = String::new();
    let mut id_type = String::new();
    let mut year: Option<i32> = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "PubmedArticle" => {
                        current = Some(PaperRecord::new(SourceKind::PubMed, "", ""));
                        title.clear();
                        abstract_parts.clear();
                        year = None;
                    }
                    "Author" => {
                        last_name.clear();
                        fore_name.clear();
                    }
                    "ArticleId" => {
                        id_type = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"IdType")
                            .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
                            .unwrap_or_default();
                    }
                    _ => {}
                }
                if !in_inline(&path) {
                    text.clear();
                }
                path.push(name);
            }
            Ok(Event::Text(ref e)) => {
                if current.is_some() {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                path.pop();
                if name == "PubmedArticle" {
                    if let Some(p) = current.take() {
                        finish_article(p, &mut title, &abstract_parts, year, &mut papers);
                    }
                    continue;
                }
                let Some(ref mut p) = current else {
                    continue;
                };
                if in_inline(&path) && !matches!(name.as_str(), "ArticleTitle" | "AbstractText") {
                    // Inline markup inside a title or abstract keeps accumulating.
                    continue;
                }
                let value = collapse(&std::mem::take(&mut text));
                let parent = path.last().map(String::as_str).unwrap_or("");
                match name.as_str() {
                    "PMID" if parent == "MedlineCitation" && p.id.is_empty() => p.id = value,
                    "ArticleTitle" => title = value,
                    "AbstractText" if !value.is_empty() => abstract_parts.push(value),
                    "LastName" => last_name = value,
                    "ForeName" => fore_name = value,
                    "CollectiveName" => last_name = value,
                    "Author" if parent == "AuthorList" => {
                        let full = format!("{fore_name} {last_name}").trim().to_string();
                        if !full.is_empty() {
                            p.authors.push(full);
                        }
                    }
                    "Title" if parent == "Journal" => {
                        p.raw.insert("journal".into(), value.into());
                    }
                    "Year" if parent == "PubDate" => year = value.parse().ok(),
                    "MedlineDate" if parent == "PubDate" && year.is_none() => {
                        year = value.get(..4).and_then(|y| y.parse().ok());
                    }
                    "ArticleId" if !path.iter().any(|n| n == "ReferenceList") => match id_type.as_str() {
                        "doi" if p.doi.is_none() => p.doi = Some(value),
                        "pmc" => {
                            p.raw.insert("pmcid".into(), value.into());
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceQueryError::Parse {
                    catalog: SourceKind::PubMed,
                    message: format!("at byte {}: {e}", reader.buffer_position()),
                });
            }
            _ => {}
        }
    }

    Ok(papers)
}

fn finish_article(
    mut p: PaperRecord,
    title: &mut String,
    abstract_parts: &[String],
    year: Option<i32>,
    papers: &mut Vec<PaperRecord>,
) {
    p.title = std::mem::take(title);
    if !abstract_parts.is_empty() {
        p.abstract_text = Some(abstract_parts.join("\n"));
    }
    p.published = year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
    if let Some(y) = year {
        p.raw.insert("year".into(), y.into());
    }
    p.url = Some(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", p.id));
    if p.id.is_empty() || p.title.is_empty() {
        warn!("Skipping PubMed article without PMID or title");
    } else {
        papers.push(p);
    }
}

/// Inside a title or abstract, where child elements are formatting.
fn in_inline(path: &[String]) -> bool {
    path.iter().any(|n| n == "ArticleTitle" || n == "AbstractText")
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::YearRange;

    const XML: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">12345678</PMID>
      <Article>
        <Journal><Title>Nature</Title><JournalIssue><PubDate><Year>2021</Year></PubDate></JournalIssue></Journal>
        <ArticleTitle>KRAS <i>G12D</i> in pancreatic cancer</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">First part.</AbstractText>
          <AbstractText Label="RESULTS">Second &amp; final.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Smith</LastName><ForeName>John</ForeName></Author>
          <Author><CollectiveName>KRAS Consortium</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections><PMID Version="1">999</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">12345678</ArticleId>
        <ArticleId IdType="doi">10.1038/s41586-021-0000-1</ArticleId>
        <ArticleId IdType="pmc">PMC7654321</ArticleId>
      </ArticleIdList>
      <ReferenceList>
        <Reference>
          <ArticleIdList><ArticleId IdType="doi">10.9999/cited</ArticleId></ArticleIdList>
        </Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_pubmed_xml() {
        let papers = parse_pubmed_xml(XML).unwrap();
        assert_eq!(papers.len(), 1);
        let p = &papers[0];
        assert_eq!(p.id, "12345678");
        assert_eq!(p.title, "KRAS G12D in pancreatic cancer");
        assert_eq!(p.abstract_text.as_deref(), Some("First part.\nSecond & final."));
        assert_eq!(p.authors, vec!["John Smith", "KRAS Consortium"]);
        assert_eq!(p.doi.as_deref(), Some("10.1038/s41586-021-0000-1"));
        assert_eq!(p.raw_str("pmcid"), Some("PMC7654321"));
        assert_eq!(p.raw_str("journal"), Some("Nature"));
        assert_eq!(p.published, NaiveDate::from_ymd_opt(2021, 1, 1));
        assert_eq!(p.url.as_deref(), Some("https://pubmed.ncbi.nlm.nih.gov/12345678/"));
    }

    #[test]
    fn test_build_query_single_and_multi_topic() {
        let q = SearchQuery::topic("CRISPR", 10);
        assert_eq!(build_pubmed_query(&q).as_deref(), Some("crispr"));
        let q = SearchQuery::topic("crispr, off-target", 10);
        assert_eq!(
            build_pubmed_query(&q).as_deref(),
            Some("\"crispr\"[Title/Abstract] AND \"off-target\"[Title/Abstract]")
        );
    }

    #[test]
    fn test_build_query_author_and_years() {
        let mut q = SearchQuery::topic("crispr", 10);
        q.author = Some("Doudna J".into());
        q.mode = SearchMode::Both;
        q.years = Some(YearRange { from: 2015, to: 2020 });
        assert_eq!(
            build_pubmed_query(&q).as_deref(),
            Some("crispr AND \"Doudna J\"[Author] AND (2015:2020[pdat])")
        );
        q.mode = SearchMode::Author;
        q.years = Some(YearRange::single(2019));
        assert_eq!(build_pubmed_query(&q).as_deref(), Some("\"Doudna J\"[Author] AND (2019[pdat])"));
    }

    #[test]
    fn test_build_query_missing_author_is_empty() {
        let mut q = SearchQuery::topic("crispr", 10);
        q.mode = SearchMode::Author;
        assert_eq!(build_pubmed_query(&q), None);
    }
}
