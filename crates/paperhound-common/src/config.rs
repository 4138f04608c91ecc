//! Pipeline configuration.
//!
//! Read from `paperhound.toml` (or the path in `PAPERHOUND_CONFIG`); YAML is
//! accepted when the file extension is `.yaml`/`.yml`. Every field has a
//! default so an empty file is a valid configuration.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PaperhoundError;

/// Smallest chunk budget the summarizer accepts.
pub const MIN_CHUNK_TOKENS: usize = 16;

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

// ── Sources ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub arxiv: bool,

    #[serde(default = "default_true")]
    pub biorxiv: bool,

    #[serde(default = "default_true")]
    pub medrxiv: bool,

    #[serde(default = "default_true")]
    pub pubmed: bool,

    /// Records requested from each source per query.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Records shown after aggregation.
    #[serde(default = "default_display_size")]
    pub display_size: usize,

    /// Order of the aggregated list.
    #[serde(default)]
    pub order: ResultOrder,

    /// Optional NCBI API key for higher rate limits.
    #[serde(default, skip_serializing)]
    pub pubmed_api_key: Option<SecretString>,
}

/// How the aggregated result list is ordered before the display limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrder {
    /// First-seen order, sources in priority order.
    #[default]
    SourcePriority,
    /// Best topic match first; ties keep first-seen order.
    Relevance,
}

fn default_true() -> bool { true }
fn default_fetch_size() -> usize { 100 }
fn default_display_size() -> usize { 30 }

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            arxiv: true,
            biorxiv: true,
            medrxiv: true,
            pubmed: true,
            fetch_size: default_fetch_size(),
            display_size: default_display_size(),
            order: ResultOrder::default(),
            pubmed_api_key: None,
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Attempts per PDF check, including the first.
    #[serde(default = "default_check_attempts")]
    pub check_attempts: u32,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_check_backoff")]
    pub initial_backoff_ms: u64,

    /// Contact email for Unpaywall. Unpaywall lookups are skipped when unset.
    #[serde(default)]
    pub unpaywall_email: Option<String>,

    /// Scrape landing pages for PDF links when no direct pattern matches.
    #[serde(default = "default_true")]
    pub scrape_landing_pages: bool,
}

fn default_check_attempts() -> u32 { 3 }
fn default_check_timeout() -> u64 { 20 }
fn default_check_backoff() -> u64 { 500 }

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            check_attempts: default_check_attempts(),
            check_timeout_secs: default_check_timeout(),
            initial_backoff_ms: default_check_backoff(),
            unpaywall_email: None,
            scrape_landing_pages: true,
        }
    }
}

// ── Download ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Attempts per download, including the first.
    #[serde(default = "default_download_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_download_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,

    /// Papers processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_cache_dir() -> PathBuf { PathBuf::from("./paperhound-cache") }
fn default_download_attempts() -> u32 { 4 }
fn default_download_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_download_timeout() -> u64 { 60 }
fn default_workers() -> usize { 4 }

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_attempts: default_download_attempts(),
            initial_backoff_ms: default_download_backoff(),
            max_backoff_ms: default_max_backoff(),
            timeout_secs: default_download_timeout(),
            workers: default_workers(),
        }
    }
}

// ── Summarizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Maximum tokens per chunk sent to the model.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    /// Upper bound on the final aggregate summary.
    #[serde(default = "default_target_tokens")]
    pub target_summary_tokens: usize,

    /// Output budget requested for each per-chunk summary.
    #[serde(default = "default_chunk_summary_tokens")]
    pub chunk_summary_tokens: usize,

    /// Concurrent model calls per document.
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    #[serde(default)]
    pub include_references: bool,
}

fn default_max_input_tokens() -> usize { 1024 }
fn default_target_tokens() -> usize { 350 }
fn default_chunk_summary_tokens() -> usize { 256 }
fn default_chunk_concurrency() -> usize { 1 }

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: default_max_input_tokens(),
            target_summary_tokens: default_target_tokens(),
            chunk_summary_tokens: default_chunk_summary_tokens(),
            chunk_concurrency: default_chunk_concurrency(),
            include_references: false,
        }
    }
}

// ── LLM backend ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai_compatible"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_backend() -> String { "ollama".to_string() }
fn default_base_url() -> String { "http://localhost:11434".to_string() }
fn default_model() -> String { "llama3:8b".to_string() }
fn default_llm_timeout() -> u64 { 120 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PipelineConfig {
    /// Load from `PAPERHOUND_CONFIG` or `./paperhound.toml`.
    /// A missing default file yields the default configuration.
    pub fn load() -> Result<Self, PaperhoundError> {
        match std::env::var("PAPERHOUND_CONFIG") {
            Ok(path) => Self::from_path(Path::new(&path)),
            Err(_) => {
                let path = Path::new("paperhound.toml");
                if path.exists() {
                    Self::from_path(path)
                } else {
                    let mut config = Self::default();
                    config.apply_env();
                    Ok(config)
                }
            }
        }
    }

    /// Load from a TOML or YAML file, chosen by extension.
    pub fn from_path(path: &Path) -> Result<Self, PaperhoundError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PaperhoundError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str::<Self>(&content)
                .map_err(|e| PaperhoundError::Config(format!("{}: {e}", path.display())))?,
            _ => toml::from_str::<Self>(&content)
                .map_err(|e| PaperhoundError::Config(format!("{}: {e}", path.display())))?,
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill secrets from the environment when the file leaves them unset.
    pub fn apply_env(&mut self) {
        if self.llm.api_key.is_none() {
            if let Ok(key) = std::env::var("PAPERHOUND_LLM_API_KEY") {
                if !key.is_empty() {
                    self.llm.api_key = Some(SecretString::from(key));
                }
            }
        }
        if self.sources.pubmed_api_key.is_none() {
            if let Ok(key) = std::env::var("NCBI_API_KEY") {
                if !key.is_empty() {
                    self.sources.pubmed_api_key = Some(SecretString::from(key));
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), PaperhoundError> {
        if self.enabled_sources().is_empty() {
            return Err(PaperhoundError::Config(
                "at least one of sources.pubmed/arxiv/biorxiv/medrxiv must be enabled".into(),
            ));
        }
        if self.resolver.check_attempts == 0 {
            return Err(PaperhoundError::Config("resolver.check_attempts must be at least 1".into()));
        }
        if self.download.max_attempts == 0 {
            return Err(PaperhoundError::Config("download.max_attempts must be at least 1".into()));
        }
        if self.download.workers == 0 {
            return Err(PaperhoundError::Config("download.workers must be at least 1".into()));
        }
        if self.summarizer.max_input_tokens < MIN_CHUNK_TOKENS {
            return Err(PaperhoundError::Config(format!(
                "summarizer.max_input_tokens must be at least {MIN_CHUNK_TOKENS}"
            )));
        }
        if self.summarizer.target_summary_tokens == 0
            || self.summarizer.target_summary_tokens > self.summarizer.max_input_tokens
        {
            return Err(PaperhoundError::Config(
                "summarizer.target_summary_tokens must be between 1 and max_input_tokens".into(),
            ));
        }
        if self.summarizer.chunk_concurrency == 0 {
            return Err(PaperhoundError::Config("summarizer.chunk_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Names of the enabled sources, in query priority order.
    pub fn enabled_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.sources.pubmed { sources.push("pubmed"); }
        if self.sources.arxiv { sources.push("arxiv"); }
        if self.sources.biorxiv { sources.push("biorxiv"); }
        if self.sources.medrxiv { sources.push("medrxiv"); }
        sources
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
