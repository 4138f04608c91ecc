//! paperhound-test-utils: Shared helpers for paperhound tests.
//!
//! - [`MockServer`]: scripted HTTP server on 127.0.0.1 with per-path hit
//!   counters, for pointing source clients, the resolver and the downloader
//!   at canned responses
//! - [`PdfBuilder`]: small text PDFs built with lopdf
//! - [`FakeSummarizer`]: deterministic stand-in for the summarization model

pub mod fake_model;
pub mod mock_server;
pub mod pdf;

pub use fake_model::FakeSummarizer;
pub use mock_server::{MockResponse, MockServer};
pub use pdf::{paper_pdf, PdfBuilder};
