//! Data models for context assembly

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Speaker role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Framework-agnostic prompt message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Invalid block construction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlockError {
    #[error("Token count must be non-negative, got {0}")]
    NegativeTokenCount(i64),

    #[error("Priority must be within [0.0, 1.0], got {0}")]
    PriorityOutOfRange(f64),
}

/// Immutable unit of candidate context
///
/// Every transformation returns a new block; the original stays intact so a
/// caller can always compare a compacted block against what was collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    content: String,
    role: Role,
    token_count: usize,
    priority: f64,
    source: String,
    compressible: bool,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl ContextBlock {
    /// Create a compressible block with empty metadata
    pub fn new(
        content: impl Into<String>,
        role: Role,
        token_count: usize,
        priority: f64,
        source: impl Into<String>,
    ) -> Result<Self, BlockError> {
        validate_priority(priority)?;
        Ok(Self {
            content: content.into(),
            role,
            token_count,
            priority,
            source: source.into(),
            compressible: true,
            metadata: HashMap::new(),
        })
    }

    /// Create a block from a signed token count, as received from untyped inputs
    pub fn try_from_signed(
        content: impl Into<String>,
        role: Role,
        token_count: i64,
        priority: f64,
        source: impl Into<String>,
    ) -> Result<Self, BlockError> {
        let tokens =
            usize::try_from(token_count).map_err(|_| BlockError::NegativeTokenCount(token_count))?;
        Self::new(content, role, tokens, priority, source)
    }

    /// Set whether the compactor may rewrite this block
    pub fn compressible(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }

    /// Return a copy with one metadata entry added or replaced
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    /// Return a copy with new content and its token count
    pub fn with_content(&self, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            content: content.into(),
            token_count,
            ..self.clone()
        }
    }

    /// Return a copy with a different priority
    pub fn with_priority(&self, priority: f64) -> Result<Self, BlockError> {
        validate_priority(priority)?;
        Ok(Self {
            priority,
            ..self.clone()
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_compressible(&self) -> bool {
        self.compressible
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

fn validate_priority(priority: f64) -> Result<(), BlockError> {
    if !(0.0..=1.0).contains(&priority) {
        return Err(BlockError::PriorityOutOfRange(priority));
    }
    Ok(())
}

/// Sum of token counts over a block list
pub fn total_tokens(blocks: &[ContextBlock]) -> usize {
    blocks.iter().map(ContextBlock::token_count).sum()
}
