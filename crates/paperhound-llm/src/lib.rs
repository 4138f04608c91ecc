//! paperhound-llm: Summarization model abstraction.
//!
//! The pipeline only ever sees [`backend::TextSummarizer`]: text in, text out,
//! with a known input budget and no state between calls.

pub mod backend;

pub use backend::{build_summarizer, LlmError, TextSummarizer};
