//! Tokenizer backends for the token accountant

use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Tokenizer backend failure
#[derive(Debug, Clone, Error)]
pub enum TokenizerError {
    #[error("Tokenizer unavailable: {0}")]
    Unavailable(String),

    #[error("Tokenization failed: {0}")]
    Encoding(String),
}

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Backend name, used in logs
    fn name(&self) -> &'static str;

    /// Count the tokens in the given text
    fn estimate(&self, text: &str) -> Result<usize, TokenizerError>;
}

/// Tiktoken-based estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self, TokenizerError> {
        let bpe = cl100k_base().map_err(|e| TokenizerError::Unavailable(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn name(&self) -> &'static str {
        "tiktoken-cl100k"
    }

    fn estimate(&self, text: &str) -> Result<usize, TokenizerError> {
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }
}

/// Character-based estimator (fallback, ~4 characters per token)
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    /// Infallible estimate
    pub fn count(&self, text: &str) -> usize {
        estimate_by_chars(text, self.chars_per_token)
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharEstimator {
    fn name(&self) -> &'static str {
        "char-estimate"
    }

    fn estimate(&self, text: &str) -> Result<usize, TokenizerError> {
        Ok(self.count(text))
    }
}

/// `max(1, chars / chars_per_token)`; empty text counts zero
pub(crate) fn estimate_by_chars(text: &str, chars_per_token: usize) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / chars_per_token.max(1)).max(1)
}
