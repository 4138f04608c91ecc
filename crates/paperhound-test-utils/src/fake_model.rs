//! Deterministic summarization model for tests.
//!
//! The "summary" is the first words of the input, so outputs are stable and
//! easy to assert on. Failures can be scripted by substring.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use paperhound_llm::{LlmError, TextSummarizer};

pub struct FakeSummarizer {
    max_input_tokens: usize,
    output_words: usize,
    fail_when_contains: Option<String>,
    unreachable: bool,
    calls: AtomicUsize,
    max_seen: AtomicUsize,
}

impl FakeSummarizer {
    pub fn new(max_input_tokens: usize) -> Self {
        Self {
            max_input_tokens,
            output_words: usize::MAX,
            fail_when_contains: None,
            unreachable: false,
            calls: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }

    /// Return at most `n` words per call.
    pub fn with_output_words(mut self, n: usize) -> Self {
        self.output_words = n;
        self
    }

    /// Answer with an API error for any input containing `needle`.
    pub fn failing_when_contains(mut self, needle: &str) -> Self {
        self.fail_when_contains = Some(needle.to_string());
        self
    }

    /// Every call fails as if the server were down.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Largest input seen so far, in estimated tokens.
    pub fn max_input_tokens_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

fn estimate_tokens(text: &str) -> usize {
    (text.split_whitespace().count() * 4).div_ceil(3)
}

#[async_trait]
impl TextSummarizer for FakeSummarizer {
    async fn summarize(&self, text: &str, max_output_tokens: usize) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.max_seen.fetch_max(estimate_tokens(text), Ordering::SeqCst);

        if self.unreachable {
            return Err(LlmError::Unavailable("connection refused".into()));
        }
        if let Some(needle) = &self.fail_when_contains {
            if text.contains(needle.as_str()) {
                return Err(LlmError::ApiError { status: 500, message: "scripted failure".into() });
            }
        }
        let limit = self.output_words.min(max_output_tokens * 3 / 4);
        Ok(text.split_whitespace().take(limit).collect::<Vec<_>>().join(" "))
    }

    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    fn model_id(&self) -> &str {
        "fake-summarizer"
    }
}
