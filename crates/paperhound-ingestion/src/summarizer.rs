//! Chunked summarization of extracted documents.
//!
//! Every chunk is summarized on its own. The per-chunk summaries are joined
//! in chunk order; when that is still longer than the target the joined
//! text goes through the model one more time, re-chunked if it exceeds the
//! model's input budget.
//!
//! Two narrower entry points share that machinery: one section of a
//! document (`summarize_section`) and a single abstract for the result
//! listing (`summarize_abstract`).

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use paperhound_common::config::SummarizerConfig;
use paperhound_llm::{LlmError, TextSummarizer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunker::{chunk_document, chunk_plain, clip_to_tokens, estimate_tokens};
use crate::models::{ChunkSummary, ExtractedDocument, FinalSummary, SectionKind, SummaryChunk};

/// Output budget for an abstract summary.
pub const ABSTRACT_SUMMARY_TOKENS: usize = 150;

#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("document has no text to summarize")]
    EmptyInput,

    #[error("document has no {} section", .0.as_str())]
    SectionMissing(SectionKind),

    #[error("model produced no summary for any of {chunks} chunk(s): {last_error}")]
    AllChunksFailed { chunks: usize, last_error: String },

    #[error("summarization model unreachable: {0}")]
    Unreachable(String),

    #[error("summarization cancelled")]
    Cancelled,
}

/// Result of one model call on one chunk.
enum ChunkOutcome {
    Summary(String),
    Failed { message: String, unreachable: bool },
    Cancelled,
}

pub struct Summarizer {
    model: Arc<dyn TextSummarizer>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(model: Arc<dyn TextSummarizer>, config: SummarizerConfig) -> Self {
        Self { model, config }
    }

    /// Tokens per chunk: the configured budget, never more than the model takes.
    pub fn chunk_budget(&self) -> usize {
        self.config.max_input_tokens.min(self.model.max_input_tokens()).max(1)
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// The chunks `summarize` would send for `doc`.
    pub fn chunks(&self, doc: &ExtractedDocument) -> Vec<SummaryChunk> {
        chunk_document(doc, self.chunk_budget(), self.config.include_references)
    }

    #[instrument(skip(self, doc, cancel), fields(key = %doc.cache_key, model = %self.model.model_id()))]
    pub async fn summarize(
        &self,
        doc: &ExtractedDocument,
        cancel: &CancellationToken,
    ) -> Result<FinalSummary, SummarizationError> {
        let chunks = self.chunks(doc);
        if chunks.is_empty() {
            return Err(SummarizationError::EmptyInput);
        }
        debug!(chunks = chunks.len(), budget = self.chunk_budget(), "Document chunked");

        let outcomes = self.summarize_chunks(&chunks, self.config.chunk_summary_tokens, cancel).await?;

        let mut chunk_summaries = Vec::with_capacity(chunks.len());
        let mut kept: Vec<String> = Vec::new();
        let mut last_error = String::new();
        let mut all_unreachable = true;
        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            match outcome {
                ChunkOutcome::Summary(text) => {
                    all_unreachable = false;
                    kept.push(text.clone());
                    chunk_summaries.push(ChunkSummary { chunk_index: chunk.index, summary: Some(text), error: None });
                }
                ChunkOutcome::Failed { message, unreachable } => {
                    all_unreachable &= unreachable;
                    warn!(chunk = chunk.index, error = %message, "Chunk summary failed");
                    last_error = message.clone();
                    chunk_summaries.push(ChunkSummary { chunk_index: chunk.index, summary: None, error: Some(message) });
                }
                ChunkOutcome::Cancelled => return Err(SummarizationError::Cancelled),
            }
        }

        if kept.is_empty() {
            return Err(if all_unreachable {
                SummarizationError::Unreachable(last_error)
            } else {
                SummarizationError::AllChunksFailed { chunks: chunks.len(), last_error }
            });
        }

        let combined = kept.join("\n\n");
        let target = self.config.target_summary_tokens;
        let mut second_pass = false;
        let mut aggregate = combined.clone();

        if estimate_tokens(&combined) > target {
            match self.condense(&combined, target, cancel).await? {
                Some(condensed) => {
                    aggregate = condensed;
                    second_pass = true;
                }
                None => warn!("Second pass produced nothing, clipping first-pass summaries"),
            }
        }

        let aggregate = clip_to_tokens(&aggregate, target).to_string();
        info!(
            chunks = chunks.len(),
            failed = chunks.len() - kept.len(),
            second_pass,
            tokens = estimate_tokens(&aggregate),
            "Document summarized"
        );

        Ok(FinalSummary {
            cache_key: doc.cache_key.clone(),
            model: self.model.model_id().to_string(),
            chunk_summaries,
            aggregate,
            second_pass,
        })
    }

    /// Summarize only the sections of one kind, e.g. the methods.
    pub async fn summarize_section(
        &self,
        doc: &ExtractedDocument,
        kind: SectionKind,
        cancel: &CancellationToken,
    ) -> Result<FinalSummary, SummarizationError> {
        let sections: Vec<_> = doc.sections.iter().filter(|s| s.kind == kind).cloned().collect();
        if sections.is_empty() {
            return Err(SummarizationError::SectionMissing(kind));
        }
        debug!(section = kind.as_str(), parts = sections.len(), "Focused summary");
        let focused = ExtractedDocument { sections, ..doc.clone() };
        self.summarize(&focused, cancel).await
    }

    /// One model call on an abstract, clipped to the chunk budget.
    pub async fn summarize_abstract(&self, text: &str, cancel: &CancellationToken) -> Result<String, SummarizationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SummarizationError::EmptyInput);
        }
        if cancel.is_cancelled() {
            return Err(SummarizationError::Cancelled);
        }
        let input = clip_to_tokens(text, self.chunk_budget());
        match self.summarize_one(input, ABSTRACT_SUMMARY_TOKENS, cancel).await {
            ChunkOutcome::Summary(summary) => Ok(clip_to_tokens(&summary, ABSTRACT_SUMMARY_TOKENS).to_string()),
            ChunkOutcome::Failed { message, unreachable: true } => Err(SummarizationError::Unreachable(message)),
            ChunkOutcome::Failed { message, .. } => {
                Err(SummarizationError::AllChunksFailed { chunks: 1, last_error: message })
            }
            ChunkOutcome::Cancelled => Err(SummarizationError::Cancelled),
        }
    }

    /// One more pass over the joined chunk summaries. `None` when the model
    /// gave nothing usable.
    async fn condense(
        &self,
        combined: &str,
        target: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SummarizationError> {
        let pieces = chunk_plain(combined, self.chunk_budget());
        debug!(pieces = pieces.len(), "Second pass");
        let per_piece = if pieces.len() > 1 { (target / pieces.len()).max(1) } else { target };

        let outcomes = self.summarize_chunks(&pieces, per_piece, cancel).await?;
        let mut parts = Vec::new();
        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Summary(text) => parts.push(text),
                ChunkOutcome::Failed { message, .. } => debug!(error = %message, "Second-pass piece failed"),
                ChunkOutcome::Cancelled => return Err(SummarizationError::Cancelled),
            }
        }
        Ok(if parts.is_empty() { None } else { Some(parts.join("\n\n")) })
    }

    /// Summarize chunks with bounded concurrency; results stay in chunk order.
    async fn summarize_chunks(
        &self,
        chunks: &[SummaryChunk],
        max_output_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkOutcome>, SummarizationError> {
        if cancel.is_cancelled() {
            return Err(SummarizationError::Cancelled);
        }
        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks)
            .map(|chunk| self.summarize_one(&chunk.text, max_output_tokens, cancel))
            .buffered(self.config.chunk_concurrency.max(1))
            .collect()
            .await;
        if cancel.is_cancelled() {
            return Err(SummarizationError::Cancelled);
        }
        Ok(outcomes)
    }

    async fn summarize_one(&self, text: &str, max_output_tokens: usize, cancel: &CancellationToken) -> ChunkOutcome {
        let call = self.model.summarize(text, max_output_tokens);
        let result = tokio::select! {
            _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
            r = call => r,
        };
        match result {
            Ok(text) if !text.trim().is_empty() => ChunkOutcome::Summary(text.trim().to_string()),
            Ok(_) => ChunkOutcome::Failed { message: "model returned empty output".into(), unreachable: false },
            Err(e) => ChunkOutcome::Failed {
                unreachable: matches!(e, LlmError::Unavailable(_)),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Section, SectionKind};
    use paperhound_test_utils::FakeSummarizer;

    fn doc_with(body: &str) -> ExtractedDocument {
        ExtractedDocument {
            cache_key: "abc".into(),
            title: Some("T".into()),
            page_count: 1,
            sections: vec![Section {
                heading: None,
                kind: SectionKind::Other,
                body: body.to_string(),
                order: 0,
                page: Some(1),
            }],
        }
    }

    fn section(kind: SectionKind, heading: &str, body: &str, order: usize) -> Section {
        Section { heading: Some(heading.into()), kind, body: body.into(), order, page: Some(1) }
    }

    fn paper() -> ExtractedDocument {
        ExtractedDocument {
            cache_key: "paper".into(),
            title: Some("Sleep and the gut".into()),
            page_count: 3,
            sections: vec![
                section(SectionKind::Introduction, "Introduction", "Sleep shapes the microbiome.", 0),
                section(SectionKind::Methods, "Methods", "We sequenced stool from forty volunteers.", 1),
                section(SectionKind::Results, "Results", "Short sleepers lost diversity.", 2),
                section(SectionKind::Methods, "Materials", "Samples were frozen at minus eighty.", 3),
            ],
        }
    }

    fn config(max_input: usize, target: usize) -> SummarizerConfig {
        SummarizerConfig {
            max_input_tokens: max_input,
            target_summary_tokens: target,
            chunk_summary_tokens: 32,
            chunk_concurrency: 2,
            include_references: false,
        }
    }

    fn sentences(n: usize) -> String {
        (0..n).map(|i| format!("Sentence number {i} reports a finding.")).collect::<Vec<_>>().join(" ")
    }

    #[tokio::test]
    async fn test_single_chunk_no_second_pass() {
        let model = Arc::new(FakeSummarizer::new(512).with_output_words(5));
        let s = Summarizer::new(model.clone(), config(512, 64));
        let out = s.summarize(&doc_with("Short paper body. Two sentences."), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.chunk_summaries.len(), 1);
        assert!(!out.second_pass);
        assert_eq!(out.aggregate, "Short paper body. Two sentences.");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_capped_by_model() {
        let model = Arc::new(FakeSummarizer::new(64));
        let s = Summarizer::new(model, config(1024, 32));
        assert_eq!(s.chunk_budget(), 64);
    }

    #[tokio::test]
    async fn test_long_document_takes_second_pass() {
        let model = Arc::new(FakeSummarizer::new(64).with_output_words(20));
        let s = Summarizer::new(model.clone(), config(64, 16));
        let out = s.summarize(&doc_with(&sentences(60)), &CancellationToken::new()).await.unwrap();
        assert!(out.chunk_summaries.len() > 1);
        assert!(out.second_pass);
        assert!(estimate_tokens(&out.aggregate) <= 16);
        assert!(model.max_input_tokens_seen() <= 64);
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let model = Arc::new(FakeSummarizer::new(64).failing_when_contains("number 3 "));
        let s = Summarizer::new(model, config(64, 300));
        let out = s.summarize(&doc_with(&sentences(20)), &CancellationToken::new()).await.unwrap();
        let failed: Vec<_> = out.chunk_summaries.iter().filter(|c| c.summary.is_none()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.is_some());
        assert!(!out.aggregate.is_empty());
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_an_error() {
        let model = Arc::new(FakeSummarizer::new(64).failing_when_contains("Sentence"));
        let s = Summarizer::new(model, config(64, 16));
        let err = s.summarize(&doc_with(&sentences(10)), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SummarizationError::AllChunksFailed { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_model() {
        let model = Arc::new(FakeSummarizer::new(64).unreachable());
        let s = Summarizer::new(model, config(64, 16));
        let err = s.summarize(&doc_with("Some text."), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SummarizationError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_empty_document() {
        let model = Arc::new(FakeSummarizer::new(64));
        let s = Summarizer::new(model.clone(), config(64, 16));
        let err = s.summarize(&doc_with("   "), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SummarizationError::EmptyInput));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let model = Arc::new(FakeSummarizer::new(64));
        let s = Summarizer::new(model.clone(), config(64, 16));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = s.summarize(&doc_with("Some text."), &cancel).await.unwrap_err();
        assert!(matches!(err, SummarizationError::Cancelled));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_deterministic() {
        let body = sentences(40);
        let a = Summarizer::new(Arc::new(FakeSummarizer::new(64)), config(64, 24))
            .summarize(&doc_with(&body), &CancellationToken::new())
            .await
            .unwrap();
        let b = Summarizer::new(Arc::new(FakeSummarizer::new(64)), config(64, 24))
            .summarize(&doc_with(&body), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(a.aggregate, b.aggregate);
    }

    #[tokio::test]
    async fn test_section_summary_uses_only_that_section() {
        let model = Arc::new(FakeSummarizer::new(512));
        let s = Summarizer::new(model.clone(), config(512, 64));
        let out = s.summarize_section(&paper(), SectionKind::Methods, &CancellationToken::new()).await.unwrap();
        assert!(out.aggregate.contains("forty volunteers"));
        assert!(out.aggregate.contains("minus eighty"));
        assert!(!out.aggregate.contains("microbiome"));
        assert!(!out.aggregate.contains("diversity"));
        assert_eq!(out.cache_key, "paper");
    }

    #[tokio::test]
    async fn test_missing_section_is_reported() {
        let model = Arc::new(FakeSummarizer::new(512));
        let s = Summarizer::new(model.clone(), config(512, 64));
        let err = s.summarize_section(&paper(), SectionKind::Discussion, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SummarizationError::SectionMissing(SectionKind::Discussion)));
        assert_eq!(err.to_string(), "document has no discussion section");
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_abstract_summary_is_one_bounded_call() {
        let model = Arc::new(FakeSummarizer::new(64).with_output_words(400));
        let s = Summarizer::new(model.clone(), config(64, 32));
        let out = s.summarize_abstract(&sentences(50), &CancellationToken::new()).await.unwrap();
        assert_eq!(model.calls(), 1);
        assert!(model.max_input_tokens_seen() <= 64);
        assert!(estimate_tokens(&out) <= ABSTRACT_SUMMARY_TOKENS);
        assert!(out.starts_with("Sentence number 0"));
    }

    #[tokio::test]
    async fn test_abstract_summary_errors() {
        let model = Arc::new(FakeSummarizer::new(64));
        let s = Summarizer::new(model.clone(), config(64, 32));
        assert!(matches!(
            s.summarize_abstract("  ", &CancellationToken::new()).await,
            Err(SummarizationError::EmptyInput)
        ));
        let down = Summarizer::new(Arc::new(FakeSummarizer::new(64).unreachable()), config(64, 32));
        assert!(matches!(
            down.summarize_abstract("An abstract.", &CancellationToken::new()).await,
            Err(SummarizationError::Unreachable(_))
        ));
        assert_eq!(model.calls(), 0);
    }
}
