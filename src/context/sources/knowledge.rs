//! Knowledge retrieval (RAG) source

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{call_collaborator, names, pack_greedy, Candidate, ContextSource, SourceError};
use crate::context::accountant::TokenAccountant;
use crate::context::models::{ContextBlock, Role};
use crate::providers::KnowledgeBaseProvider;

/// Retrieved knowledge, highest relevance first
///
/// Hits below `max(threshold, min_relevance)` are discarded.
pub struct KnowledgeSource {
    provider: Arc<dyn KnowledgeBaseProvider>,
    limit: usize,
    threshold: f64,
    timeout: Option<Duration>,
}

impl KnowledgeSource {
    pub fn new(provider: Arc<dyn KnowledgeBaseProvider>, limit: usize) -> Self {
        Self {
            provider,
            limit,
            threshold: 0.0,
            timeout: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ContextSource for KnowledgeSource {
    fn name(&self) -> &str {
        names::KNOWLEDGE
    }

    async fn collect(
        &self,
        query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let mut hits =
            call_collaborator(self.timeout, self.provider.query(query, self.limit)).await?;

        let floor = self.threshold.max(min_relevance);
        hits.retain(|hit| hit.relevance >= floor);
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        let candidates = hits.into_iter().map(|hit| {
            Candidate::new(hit.content, Role::System, hit.relevance)
                .meta("document_id", hit.id)
                .meta("origin", hit.source)
                .meta("relevance", hit.relevance)
        });
        pack_greedy(names::KNOWLEDGE, candidates, token_budget, accountant, true)
    }
}
