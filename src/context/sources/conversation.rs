//! Conversation sources: user input, system prompt, agent output, recent window

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{decay, names, pack_greedy, Candidate, ContextSource, SourceError};
use crate::context::accountant::TokenAccountant;
use crate::context::models::{ContextBlock, Message, Role};

/// The current user request, always emitted as one block
///
/// The block is returned even if it alone exceeds the allocation; an
/// oversized request is resolved by the compactor, never by this source.
#[derive(Debug, Default)]
pub struct UserInputSource;

impl UserInputSource {
    pub const PRIORITY: f64 = 1.0;

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContextSource for UserInputSource {
    fn name(&self) -> &str {
        names::USER_INPUT
    }

    async fn collect(
        &self,
        query: &str,
        _token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let tokens = accountant.count_framed(query);
        let block = ContextBlock::new(query, Role::User, tokens, Self::PRIORITY, names::USER_INPUT)?
            .compressible(false);
        Ok(vec![block])
    }
}

/// Fixed system instructions contributed as context
#[derive(Debug, Clone)]
pub struct SystemPromptSource {
    prompt: String,
}

impl SystemPromptSource {
    pub const PRIORITY: f64 = 0.95;

    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl ContextSource for SystemPromptSource {
    fn name(&self) -> &str {
        names::SYSTEM_PROMPT
    }

    async fn collect(
        &self,
        _query: &str,
        _token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        if self.prompt.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = accountant.count_framed(&self.prompt);
        let block = ContextBlock::new(
            self.prompt.clone(),
            Role::System,
            tokens,
            Self::PRIORITY,
            names::SYSTEM_PROMPT,
        )?
        .compressible(false);
        Ok(vec![block])
    }
}

/// Outputs the agent produced earlier in the current turn
///
/// Outputs are appended chronologically; blocks come out most recent first
/// with priority decaying from 0.9 to 0.6.
pub struct AgentOutputSource {
    outputs: Arc<RwLock<Vec<String>>>,
}

impl AgentOutputSource {
    pub const NEWEST_PRIORITY: f64 = 0.9;
    pub const OLDEST_PRIORITY: f64 = 0.6;

    pub fn new(outputs: Arc<RwLock<Vec<String>>>) -> Self {
        Self { outputs }
    }

    pub async fn push(&self, output: impl Into<String>) {
        self.outputs.write().await.push(output.into());
    }

    /// Forget this turn's outputs
    pub async fn reset(&self) {
        self.outputs.write().await.clear();
    }
}

#[async_trait]
impl ContextSource for AgentOutputSource {
    fn name(&self) -> &str {
        names::AGENT_OUTPUT
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let outputs = self.outputs.read().await.clone();
        let n = outputs.len();
        let candidates = outputs.into_iter().rev().enumerate().map(|(rank, output)| {
            Candidate::new(
                output,
                Role::Assistant,
                decay(Self::NEWEST_PRIORITY, Self::OLDEST_PRIORITY, rank, n),
            )
            .meta("recency_rank", rank)
        });
        pack_greedy(names::AGENT_OUTPUT, candidates, token_budget, accountant, true)
    }
}

/// The last messages of the conversation (L1)
///
/// Scans newest to oldest so the budget keeps the latest turns, then restores
/// chronological order. Priority decays from 1.0 (newest) to 0.5.
pub struct RecentWindowSource {
    history: Arc<RwLock<Vec<Message>>>,
    window_size: usize,
}

impl RecentWindowSource {
    pub const NEWEST_PRIORITY: f64 = 1.0;
    pub const OLDEST_PRIORITY: f64 = 0.5;

    pub fn new(history: Arc<RwLock<Vec<Message>>>, window_size: usize) -> Self {
        Self {
            history,
            window_size,
        }
    }
}

#[async_trait]
impl ContextSource for RecentWindowSource {
    fn name(&self) -> &str {
        names::RECENT_WINDOW
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let window: Vec<Message> = {
            let history = self.history.read().await;
            let start = history.len().saturating_sub(self.window_size);
            history[start..].to_vec()
        };

        let n = window.len();
        let candidates = window.into_iter().rev().enumerate().map(|(rank, message)| {
            Candidate::new(
                message.content,
                message.role,
                decay(Self::NEWEST_PRIORITY, Self::OLDEST_PRIORITY, rank, n),
            )
            .meta("recency_rank", rank)
        });

        let mut blocks =
            pack_greedy(names::RECENT_WINDOW, candidates, token_budget, accountant, true)?;
        blocks.reverse();
        debug!("Recent window kept {} of {} messages", blocks.len(), n);
        Ok(blocks)
    }
}
