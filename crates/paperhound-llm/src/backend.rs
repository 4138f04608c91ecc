//! Summarization backends.
//!
//! Backends:
//!   ChatSummarizer (Ollama)           : local Ollama, native /api/chat
//!   ChatSummarizer (OpenAiCompatible) : any /v1/chat/completions endpoint
//!                                       (vLLM, LMStudio, OpenRouter, …)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paperhound_common::config::LlmConfig;
use paperhound_common::{PaperhoundError, SandboxClient};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("API error [{status}]: {message}")]
    ApiError { status: u16, message: String },
}

impl From<PaperhoundError> for LlmError {
    fn from(e: PaperhoundError) -> Self {
        LlmError::Unavailable(e.to_string())
    }
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A stateless text-to-text summarizer with a fixed input budget.
#[async_trait]
pub trait TextSummarizer: Send + Sync {
    /// Summarize `text` into at most roughly `max_output_tokens` tokens.
    async fn summarize(&self, text: &str, max_output_tokens: usize) -> Result<String, LlmError>;
    /// Largest input, in tokens, the model accepts.
    fn max_input_tokens(&self) -> usize;
    fn model_id(&self) -> &str;
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user"
    pub content: String,
}

const SYSTEM_PROMPT: &str = "You condense scientific text. Summarize the passage faithfully \
    in plain prose. Do not add facts that are not in the passage.";

fn parse_chat_response(json: &serde_json::Value) -> String {
    json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Ollama answers `{ "message": { "content": ... } }`.
fn parse_ollama_response(json: &serde_json::Value) -> String {
    json["message"]["content"].as_str().unwrap_or("").trim().to_string()
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    if status == 429 {
        return Err(LlmError::RateLimitExceeded);
    }
    let body: serde_json::Value = resp.json().await?;
    if status >= 400 {
        let msg = body["error"]["message"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .or_else(|| body["message"].as_str())
            .unwrap_or("unknown API error")
            .to_string();
        return Err(LlmError::ApiError { status, message: msg });
    }
    Ok(body)
}

// ── Chat-completions backend ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    OpenAiCompatible,
}

pub struct ChatSummarizer {
    kind: BackendKind,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    max_input_tokens: usize,
    client: SandboxClient,
}

impl ChatSummarizer {
    pub fn new(
        kind: BackendKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_input_tokens: usize,
        client: SandboxClient,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            max_input_tokens,
            client,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Route and request body for this backend.
    fn request(&self, text: &str, max_output_tokens: usize) -> (String, serde_json::Value) {
        let messages = [
            Message { role: "system".into(), content: SYSTEM_PROMPT.into() },
            Message { role: "user".into(), content: text.to_string() },
        ];
        match self.kind {
            BackendKind::Ollama => (
                format!("{}/api/chat", self.base_url),
                serde_json::json!({
                    "model":    &self.model,
                    "messages": messages,
                    "stream":   false,
                    "options":  { "num_predict": max_output_tokens, "temperature": 0.0 },
                }),
            ),
            BackendKind::OpenAiCompatible => (
                format!("{}/v1/chat/completions", self.base_url),
                serde_json::json!({
                    "model":       &self.model,
                    "messages":    messages,
                    "max_tokens":  max_output_tokens,
                    "temperature": 0.0,
                }),
            ),
        }
    }
}

#[async_trait]
impl TextSummarizer for ChatSummarizer {
    #[instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn summarize(&self, text: &str, max_output_tokens: usize) -> Result<String, LlmError> {
        let (url, body) = self.request(text, max_output_tokens);

        let mut req = self.client.post(&url)?.json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                LlmError::Unavailable(format!("{}: {e}", self.base_url))
            } else {
                LlmError::Http(e)
            }
        })?;
        let json = check_response_status(resp).await?;
        let content = match self.kind {
            BackendKind::Ollama => parse_ollama_response(&json),
            BackendKind::OpenAiCompatible => parse_chat_response(&json),
        };
        debug!(out_chars = content.len(), "model response");
        Ok(content)
    }

    fn max_input_tokens(&self) -> usize { self.max_input_tokens }
    fn model_id(&self) -> &str { &self.model }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Build the configured summarizer.
pub fn build_summarizer(
    config: &LlmConfig,
    max_input_tokens: usize,
) -> Result<Arc<dyn TextSummarizer>, LlmError> {
    let kind = match config.backend.as_str() {
        "ollama" => BackendKind::Ollama,
        "openai_compatible" | "openai" => BackendKind::OpenAiCompatible,
        other => return Err(LlmError::Unavailable(format!("unknown backend '{other}'"))),
    };

    let mut client = SandboxClient::with_timeout(Duration::from_secs(config.timeout_secs))?;
    if let Ok(parsed) = url::Url::parse(&config.base_url) {
        if let Some(host) = parsed.host_str() {
            client.allow_domain(host);
        }
    }

    let mut summarizer = ChatSummarizer::new(kind, &config.base_url, &config.model, max_input_tokens, client);
    if let Some(ref key) = config.api_key {
        summarizer = summarizer.with_api_key(key.clone());
    }
    Ok(Arc::new(summarizer))
}
