//! Context sources: pluggable providers of candidate blocks
//!
//! Every source packs greedily: candidates are taken in the source's natural
//! order (recency, scope weight, retrieval score) and collection stops at the
//! first candidate that would overflow the budget. This is not a knapsack
//! optimum; a smaller candidate further down is never considered once one has
//! overflowed, which keeps the highest-ranked material and the cost linear.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::accountant::TokenAccountant;
use super::models::{BlockError, ContextBlock, Role};
use crate::providers::ProviderError;

pub mod conversation;
pub mod definitions;
pub mod knowledge;
pub mod memory;
pub mod scope;

pub use conversation::{AgentOutputSource, RecentWindowSource, SystemPromptSource, UserInputSource};
pub use definitions::{SkillDefinitionSource, ToolDefinitionSource};
pub use knowledge::KnowledgeSource;
pub use memory::{PersistentMemorySource, WorkingMemorySource};
pub use scope::{ContextScope, InheritedScopeSource, ScopedContext, SharedPoolSource};

/// Canonical source names, used as allocation keys
pub mod names {
    pub const USER_INPUT: &str = "user_input";
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const AGENT_OUTPUT: &str = "agent_output";
    pub const RECENT_WINDOW: &str = "recent_window";
    pub const WORKING_MEMORY: &str = "working_memory";
    pub const PERSISTENT_MEMORY: &str = "persistent_memory";
    pub const KNOWLEDGE: &str = "knowledge";
    pub const TOOLS: &str = "tools";
    pub const SKILLS: &str = "skills";
    pub const INHERITED_SCOPE: &str = "inherited_scope";
    pub const SHARED_POOL: &str = "shared_pool";
}

/// Failure of a single source; contained by the collector
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid block: {0}")]
    Block(#[from] BlockError),

    #[error("Source failed: {0}")]
    Failed(String),
}

/// Provider of candidate context blocks
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Allocation key of this source
    fn name(&self) -> &str;

    /// Produce blocks whose token counts sum to at most `token_budget`
    async fn collect(
        &self,
        query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError>;
}

/// A block-to-be, before token counting
pub(crate) struct Candidate {
    pub content: String,
    pub role: Role,
    pub priority: f64,
    pub metadata: Vec<(&'static str, Value)>,
}

impl Candidate {
    pub fn new(content: impl Into<String>, role: Role, priority: f64) -> Self {
        Self {
            content: content.into(),
            role,
            priority: priority.clamp(0.0, 1.0),
            metadata: Vec::new(),
        }
    }

    pub fn meta(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.metadata.push((key, value.into()));
        self
    }
}

/// Take candidates in order until the next one would overflow `budget`
pub(crate) fn pack_greedy(
    source: &str,
    candidates: impl IntoIterator<Item = Candidate>,
    budget: usize,
    accountant: &TokenAccountant,
    compressible: bool,
) -> Result<Vec<ContextBlock>, SourceError> {
    let mut blocks = Vec::new();
    let mut used = 0;

    for candidate in candidates {
        let tokens = accountant.count_framed(&candidate.content);
        if used + tokens > budget {
            break;
        }
        used += tokens;

        let mut block = ContextBlock::new(
            candidate.content,
            candidate.role,
            tokens,
            candidate.priority,
            source,
        )?
        .compressible(compressible);
        for (key, value) in candidate.metadata {
            block = block.with_metadata(key, value);
        }
        blocks.push(block);
    }

    Ok(blocks)
}

/// Linear decay from `start` (rank 0) to `end` (rank n-1)
pub(crate) fn decay(start: f64, end: f64, rank: usize, n: usize) -> f64 {
    if n <= 1 {
        return start;
    }
    start - (start - end) * rank as f64 / (n - 1) as f64
}

/// Await a collaborator call, bounded by an optional timeout
pub(crate) async fn call_collaborator<T, F>(
    timeout: Option<Duration>,
    call: F,
) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| SourceError::Timeout(limit))?
            .map_err(SourceError::from),
        None => call.await.map_err(SourceError::from),
    }
}
