//! End-to-end pipeline.
//!
//! Entry points:
//!   1. `search`: query every enabled source and aggregate the candidates
//!   2. `summarize_abstracts`: short model summaries for the result listing
//!   3. `process_selection`: for each record the user picked, resolve open
//!      access, download, extract and summarize
//!
//! Papers are processed concurrently up to the configured worker count;
//! the stages of one paper run in order. A failing paper never stops the
//! others: its failure lands in the run report. Progress events go out on
//! an optional broadcast channel.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use paperhound_common::config::{PipelineConfig, ResultOrder, SourcesConfig};
use paperhound_common::SandboxClient;
use paperhound_llm::TextSummarizer;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dedup::{aggregate, Aggregated};
use crate::downloader::{DownloadError, Downloader};
use crate::models::{Access, AccessResolution, FinalSummary, PaperRecord, SectionKind, SourceKind};
use crate::pdf_parser::TextExtractor;
use crate::ranking::rank_by_relevance;
use crate::resolver::OpenAccessResolver;
use crate::sources::arxiv::ArxivClient;
use crate::sources::biorxiv::BioRxivClient;
use crate::sources::pubmed::PubMedClient;
use crate::sources::{search_all, SearchQuery, SourceClient, SourceQueryError};
use crate::summarizer::{SummarizationError, Summarizer};

// ── Sources ───────────────────────────────────────────────────────────────────

/// Source clients for the enabled catalogs, in query priority order.
/// `only` narrows the set further (e.g. from a command-line flag).
pub fn build_sources(
    config: &SourcesConfig,
    client: &SandboxClient,
    only: Option<&[SourceKind]>,
) -> Vec<Arc<dyn SourceClient>> {
    let wanted = |kind: SourceKind| only.map_or(true, |o| o.contains(&kind));
    let mut sources: Vec<Arc<dyn SourceClient>> = Vec::new();
    if config.pubmed && wanted(SourceKind::PubMed) {
        sources.push(Arc::new(PubMedClient::new(client.clone(), config.pubmed_api_key.clone())));
    }
    if config.arxiv && wanted(SourceKind::Arxiv) {
        sources.push(Arc::new(ArxivClient::new(client.clone())));
    }
    if config.biorxiv && wanted(SourceKind::BioRxiv) {
        sources.push(Arc::new(BioRxivClient::new_biorxiv(client.clone())));
    }
    if config.medrxiv && wanted(SourceKind::MedRxiv) {
        sources.push(Arc::new(BioRxivClient::new_medrxiv(client.clone())));
    }
    sources
}

/// Aggregated candidates plus the sources that failed.
#[derive(Debug)]
pub struct SearchOutcome {
    pub aggregated: Aggregated,
    pub source_errors: Vec<(SourceKind, SourceQueryError)>,
}

/// Query every source concurrently, then deduplicate in source order.
/// With [`ResultOrder::Relevance`] the deduplicated list is re-sorted by
/// topic match before `limit` applies.
#[instrument(skip(sources, query), fields(topic = %query.topic, sources = sources.len()))]
pub async fn search(
    sources: &[Arc<dyn SourceClient>],
    query: &SearchQuery,
    limit: Option<usize>,
    order: ResultOrder,
) -> SearchOutcome {
    let results = search_all(sources, query).await;
    let found = results.records.len();
    let mut aggregated = aggregate(results.records, None);
    if order == ResultOrder::Relevance && query.mode.uses_topic() {
        aggregated.records = rank_by_relevance(std::mem::take(&mut aggregated.records), &query.keywords());
    }
    if let Some(limit) = limit {
        aggregated.records.truncate(limit);
    }
    info!(
        found,
        kept = aggregated.records.len(),
        duplicates = aggregated.duplicates,
        dropped = aggregated.dropped,
        ?order,
        "Search complete"
    );
    SearchOutcome { aggregated, source_errors: results.errors }
}

/// Raw-metadata key holding a record's abstract summary.
pub const ABSTRACT_SUMMARY_KEY: &str = "abstract_summary";

/// Summarize the abstract of every record that has one and store the
/// result under [`ABSTRACT_SUMMARY_KEY`]. Records whose summary fails keep
/// their abstract only. Returns the number summarized.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn summarize_abstracts(
    records: &mut [PaperRecord],
    summarizer: &Summarizer,
    concurrency: usize,
    cancel: &CancellationToken,
) -> usize {
    let jobs: Vec<(usize, String)> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            let text = r.abstract_text.as_deref()?.trim();
            (!text.is_empty()).then(|| (i, text.to_string()))
        })
        .collect();

    let results: Vec<(usize, Result<String, SummarizationError>)> = stream::iter(jobs)
        .map(|(i, text)| async move { (i, summarizer.summarize_abstract(&text, cancel).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut done = 0;
    for (i, result) in results {
        match result {
            Ok(summary) => {
                records[i].raw.insert(ABSTRACT_SUMMARY_KEY.to_string(), summary.into());
                done += 1;
            }
            Err(e) => warn!(paper = %records[i].label(), error = %e, "Abstract summary failed"),
        }
    }
    info!(summarized = done, "Abstract summaries ready");
    done
}

// ── Run outcome ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolve,
    Download,
    Extract,
    Summarize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve   => "resolve",
            Stage::Download  => "download",
            Stage::Extract   => "extract",
            Stage::Summarize => "summarize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub paper: String,
    pub stage: Stage,
    /// Short error class, e.g. "transient", "no_text_layer".
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaperOutcome {
    Summarized { url: String, summary: FinalSummary },
    LinkOnly { url: String },
    Unavailable { reason: String },
    Failed { stage: Stage },
}

impl PaperOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PaperOutcome::Summarized { .. }  => "summarized",
            PaperOutcome::LinkOnly { .. }    => "link_only",
            PaperOutcome::Unavailable { .. } => "unavailable",
            PaperOutcome::Failed { .. }      => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperReport {
    pub record: PaperRecord,
    pub outcome: PaperOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// In selection order.
    pub papers: Vec<PaperReport>,
    pub failures: Vec<StageFailure>,
    /// Set when only one section of each paper was summarized.
    pub focus: Option<SectionKind>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn count(&self, label: &str) -> usize {
        self.papers.iter().filter(|p| p.outcome.label() == label).count()
    }
}

/// Progress event emitted during a run (cloneable for broadcast).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub run_id: Uuid,
    pub paper: String,
    pub stage: String,
    pub message: String,
    pub error: Option<String>,
}

// ── Processing ────────────────────────────────────────────────────────────────

/// Everything a run needs, built once and shared by the workers.
pub struct PipelineDeps {
    pub resolver: OpenAccessResolver,
    pub downloader: Downloader,
    pub extractor: TextExtractor,
    pub summarizer: Summarizer,
    pub workers: usize,
    /// Summarize only this section of each paper.
    pub focus: Option<SectionKind>,
}

impl PipelineDeps {
    pub fn from_config(
        config: &PipelineConfig,
        client: SandboxClient,
        model: Arc<dyn TextSummarizer>,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            resolver: OpenAccessResolver::new(&config.resolver, client.clone()),
            downloader: Downloader::from_config(&config.download, client)?,
            extractor: TextExtractor::new(),
            summarizer: Summarizer::new(model, config.summarizer.clone()),
            workers: config.download.workers.max(1),
            focus: None,
        })
    }
}

struct Emitter<'a> {
    run_id: Uuid,
    tx: Option<&'a broadcast::Sender<PipelineProgress>>,
}

impl Emitter<'_> {
    fn emit(&self, paper: &str, stage: &str, message: impl Into<String>, error: Option<String>) {
        if let Some(tx) = self.tx {
            let _ = tx.send(PipelineProgress {
                run_id: self.run_id,
                paper: paper.to_string(),
                stage: stage.to_string(),
                message: message.into(),
                error,
            });
        }
    }
}

/// Process the selected records. Never fails as a whole; per-paper problems
/// are reported in [`RunReport::failures`].
#[instrument(skip_all, fields(papers = records.len()))]
pub async fn process_selection(
    records: Vec<PaperRecord>,
    deps: &PipelineDeps,
    cancel: &CancellationToken,
    progress_tx: Option<broadcast::Sender<PipelineProgress>>,
) -> RunReport {
    let run_id = Uuid::new_v4();
    let t0 = Instant::now();
    let emitter = Emitter { run_id, tx: progress_tx.as_ref() };
    info!(%run_id, workers = deps.workers, "Starting run");

    let emitter_ref = &emitter;
    let mut results: Vec<(usize, PaperRecord, PaperOutcome, Option<StageFailure>)> =
        stream::iter(records.into_iter().enumerate())
            .map(|(i, record)| async move {
                let (outcome, failure) = process_paper(&record, deps, cancel, emitter_ref).await;
                (i, record, outcome, failure)
            })
            .buffer_unordered(deps.workers.max(1))
            .collect()
            .await;
    results.sort_by_key(|(i, ..)| *i);

    let mut report = RunReport {
        run_id,
        papers: Vec::new(),
        failures: Vec::new(),
        focus: deps.focus,
        duration_ms: 0,
    };
    for (_, record, outcome, failure) in results {
        report.failures.extend(failure);
        report.papers.push(PaperReport { record, outcome });
    }
    report.duration_ms = t0.elapsed().as_millis() as u64;

    info!(
        %run_id,
        summarized = report.count("summarized"),
        link_only = report.count("link_only"),
        unavailable = report.count("unavailable"),
        failed = report.failures.len(),
        duration_ms = report.duration_ms,
        "Run complete"
    );
    emitter.emit("", "complete", format!("{} paper(s) processed", report.papers.len()), None);
    report
}

async fn process_paper(
    record: &PaperRecord,
    deps: &PipelineDeps,
    cancel: &CancellationToken,
    emitter: &Emitter<'_>,
) -> (PaperOutcome, Option<StageFailure>) {
    let paper = record.label();
    let fail = |stage: Stage, kind: &str, message: String| {
        warn!(%paper, %stage, kind, error = %message, "Paper failed");
        emitter.emit(&paper, stage.as_str(), "failed", Some(message.clone()));
        (
            PaperOutcome::Failed { stage },
            Some(StageFailure { paper: paper.clone(), stage, kind: kind.to_string(), message }),
        )
    };

    if cancel.is_cancelled() {
        return fail(Stage::Resolve, "cancelled", "run cancelled".into());
    }

    // 1. Resolve
    emitter.emit(&paper, "resolve", "Resolving open access", None);
    let resolution: AccessResolution = deps.resolver.resolve(record, cancel).await;
    match &resolution.access {
        Access::Downloadable { .. } => {}
        Access::LinkOnly { url } => {
            emitter.emit(&paper, "resolve", format!("Link only: {url}"), None);
            return (PaperOutcome::LinkOnly { url: url.clone() }, None);
        }
        Access::Unavailable { reason } if cancel.is_cancelled() => {
            return fail(Stage::Resolve, "cancelled", reason.clone());
        }
        Access::Unavailable { reason } => {
            emitter.emit(&paper, "resolve", format!("Unavailable: {reason}"), None);
            return (PaperOutcome::Unavailable { reason: reason.clone() }, None);
        }
    }

    // 2. Download
    emitter.emit(&paper, "download", "Downloading PDF", None);
    let artifact = match deps.downloader.download_any(&resolution, cancel).await {
        Ok(a) => a,
        Err(e @ DownloadError::Cancelled) => return fail(Stage::Download, e.kind(), e.to_string()),
        Err(e) => {
            // The paper is still worth a link; the failure stays on record.
            let (outcome, failure) = fail(Stage::Download, e.kind(), e.to_string());
            let link = resolution
                .candidate_urls()
                .first()
                .map(|u| u.to_string())
                .or_else(|| deps.resolver.fallback_link(record, None));
            return match link {
                Some(url) => (PaperOutcome::LinkOnly { url }, failure),
                None => (outcome, failure),
            };
        }
    };

    // 3. Extract
    emitter.emit(&paper, "extract", "Extracting text", None);
    let document = match deps.extractor.extract(&artifact).await {
        Ok(d) => d,
        Err(e) => return fail(Stage::Extract, extraction_kind(&e), e.to_string()),
    };

    // 4. Summarize
    let summarized = match deps.focus {
        Some(kind) => {
            emitter.emit(&paper, "summarize", format!("Summarizing the {} section", kind.as_str()), None);
            deps.summarizer.summarize_section(&document, kind, cancel).await
        }
        None => {
            emitter.emit(&paper, "summarize", format!("Summarizing {} section(s)", document.sections.len()), None);
            deps.summarizer.summarize(&document, cancel).await
        }
    };
    match summarized {
        Ok(summary) => {
            emitter.emit(&paper, "summarize", "Summary ready", None);
            (PaperOutcome::Summarized { url: artifact.url, summary }, None)
        }
        Err(e) => fail(Stage::Summarize, summarization_kind(&e), e.to_string()),
    }
}

fn extraction_kind(e: &crate::pdf_parser::ExtractionError) -> &'static str {
    use crate::pdf_parser::ExtractionError::*;
    match e {
        Unverified(_) => "unverified",
        Io(_) => "io",
        Parse(_) => "parse",
        NoTextLayer => "no_text_layer",
    }
}

fn summarization_kind(e: &crate::summarizer::SummarizationError) -> &'static str {
    use crate::summarizer::SummarizationError::*;
    match e {
        EmptyInput => "empty_input",
        SectionMissing(_) => "section_missing",
        AllChunksFailed { .. } => "all_chunks_failed",
        Unreachable(_) => "unreachable",
        Cancelled => "cancelled",
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

/// Markdown rendering of a run: one entry per paper, then the failures.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::from("# Paper summaries\n");
    for (i, p) in report.papers.iter().enumerate() {
        let r = &p.record;
        out.push_str(&format!("\n## {}. {}\n\n", i + 1, r.title.trim()));
        if !r.authors.is_empty() {
            out.push_str(&format!("*{}*\n\n", r.authors.join(", ")));
        }
        let year = r.published.map(|d| format!(", {}", d.format("%Y"))).unwrap_or_default();
        out.push_str(&format!("Source: {}{}", r.source, year));
        if let Some(doi) = &r.doi {
            out.push_str(&format!(" · DOI: {doi}"));
        }
        out.push_str("\n\n");

        match &p.outcome {
            PaperOutcome::Summarized { url, summary } => {
                out.push_str(&format!("PDF: <{url}>\n\n"));
                if let Some(kind) = report.focus {
                    out.push_str(&format!("Summary of the {} section:\n\n", kind.as_str()));
                }
                out.push_str(&format!("{}\n", summary.aggregate.trim()));
            }
            PaperOutcome::LinkOnly { url } => {
                let label = r.label();
                let download_failed = report
                    .failures
                    .iter()
                    .any(|f| f.paper == label && f.stage == Stage::Download);
                if download_failed {
                    out.push_str(&format!("Download failed. Read it at <{url}>\n"));
                } else {
                    out.push_str(&format!("No open-access PDF. Read it at <{url}>\n"));
                }
            }
            PaperOutcome::Unavailable { reason } => {
                out.push_str(&format!("Not available: {reason}\n"));
            }
            PaperOutcome::Failed { stage } => {
                out.push_str(&format!("Failed during {stage}.\n"));
            }
        }
    }

    if !report.failures.is_empty() {
        out.push_str("\n## Failures\n\n");
        for f in &report.failures {
            out.push_str(&format!("- `{}` {} ({}): {}\n", f.paper, f.stage, f.kind, f.message));
        }
    }
    out
}
