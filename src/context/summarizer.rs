//! Summarization backends used by the compactor
//!
//! - [`LLMSummarizer`]: OpenAI-compatible chat completions with retries
//! - [`ExtractiveSummarizer`]: keeps leading sentences, no network

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::token_estimator::estimate_by_chars;

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a list of text segments into at most `max_tokens`
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError>;
}

/// Configuration for the LLM summarizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Use the LLM summarizer during compaction
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First retry delay; doubles on each further attempt
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

/// LLM-based summarizer using an OpenAI-compatible API
pub struct LLMSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl LLMSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SummarizerError::InitializationError(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn build_prompt(&self, texts: &[String], max_tokens: usize) -> String {
        let combined = texts.join("\n\n---\n\n");
        format!(
            "Condense the following context for an AI agent. \
            Keep facts, decisions, identifiers and open items; drop filler. \
            Keep the result under {} tokens.\n\n{}",
            max_tokens, combined
        )
    }

    async fn attempt(&self, request: &ChatCompletionRequest) -> Result<String, SummarizerError> {
        let mut req = self.client.post(&self.config.endpoint).json(request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| SummarizerError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizerError::ApiError(format!("HTTP {}: {}", status, body)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SummarizerError::ApiError(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SummarizerError::ApiError("No choices in response".to_string()))?;

        if content.trim().is_empty() {
            return Err(SummarizerError::EmptySummary);
        }
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for LLMSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        debug!("Summarizing {} segments, target {} tokens", texts.len(), max_tokens);

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are a concise summarizer. Preserve key information.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: self.build_prompt(texts, max_tokens),
                },
            ],
            max_tokens: Some(max_tokens),
            temperature: Some(0.3),
        };

        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.config.retry_base_ms, attempt);
                debug!("Retry attempt {} for summarization in {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&request).await {
                Ok(summary) => return Ok(summary),
                Err(e) => {
                    debug!("Summarization attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        warn!("Summarization failed after {} attempts", attempts);
        Err(last_error.unwrap_or(SummarizerError::Unknown))
    }
}

/// Longest wait between summarization retries
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Exponential backoff before retry `attempt` (1-based), capped
fn backoff_delay(base_ms: u64, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

/// Local fallback: keeps whole leading sentences that fit the budget
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveSummarizer {
    chars_per_token: usize,
}

impl ExtractiveSummarizer {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(4)
    }
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        max_tokens: usize,
    ) -> Result<String, SummarizerError> {
        let mut summary = String::new();
        for sentence in texts.iter().flat_map(|t| sentences(t)) {
            let candidate = if summary.is_empty() {
                sentence.to_string()
            } else {
                format!("{} {}", summary, sentence)
            };
            if estimate_by_chars(&candidate, self.chars_per_token) > max_tokens {
                break;
            }
            summary = candidate;
        }

        if summary.is_empty() {
            return Err(SummarizerError::EmptySummary);
        }
        Ok(summary)
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Summary is empty")]
    EmptySummary,

    #[error("Unknown error")]
    Unknown,
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
