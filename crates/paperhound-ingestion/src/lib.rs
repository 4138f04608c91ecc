//! paperhound-ingestion: Paper retrieval and summarization pipeline.
//! - Paper discovery (arXiv, bioRxiv, medRxiv, PubMed)
//! - Cross-source deduplication and optional relevance ranking
//! - Open-access resolution and PDF download with a local cache
//! - lopdf text extraction with section detection
//! - Chunked summarization behind a model trait

pub mod cache;
pub mod chunker;
pub mod dedup;
pub mod downloader;
pub mod models;
pub mod pdf_parser;
pub mod pipeline;
pub mod ranking;
pub mod resolver;
pub mod retry;
pub mod sources;
pub mod summarizer;

pub use dedup::{aggregate, Aggregated};
pub use downloader::{DownloadError, Downloader};
pub use models::{
    Access, AccessResolution, DownloadedArtifact, ExtractedDocument, FinalSummary, PaperRecord, SectionKind,
    SourceKind,
};
pub use pdf_parser::{ExtractionError, TextExtractor};
pub use pipeline::{
    process_selection, render_report, search, summarize_abstracts, PaperOutcome, PipelineDeps, RunReport,
};
pub use resolver::OpenAccessResolver;
pub use retry::RetryPolicy;
pub use sources::{SearchMode, SearchQuery, SourceClient, YearRange};
pub use summarizer::{SummarizationError, Summarizer};
