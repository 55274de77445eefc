//! Memory sources: working memory (L2) and persistent memory (L3)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{call_collaborator, names, pack_greedy, Candidate, ContextSource, SourceError};
use crate::context::accountant::TokenAccountant;
use crate::context::models::{ContextBlock, Role};
use crate::context::working_memory::WorkingMemory;
use crate::providers::MemoryStore;

/// Notes from the task's working memory, most recently used first
pub struct WorkingMemorySource {
    memory: Arc<RwLock<WorkingMemory>>,
}

impl WorkingMemorySource {
    pub fn new(memory: Arc<RwLock<WorkingMemory>>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl ContextSource for WorkingMemorySource {
    fn name(&self) -> &str {
        names::WORKING_MEMORY
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let entries = self.memory.read().await.snapshot();
        let candidates = entries
            .into_iter()
            .filter(|entry| entry.importance >= min_relevance)
            .map(|entry| {
                Candidate::new(entry.content, Role::System, entry.importance).meta("key", entry.key)
            });
        pack_greedy(names::WORKING_MEMORY, candidates, token_budget, accountant, true)
    }
}

/// Long-term memories retrieved from an external store by text query
pub struct PersistentMemorySource {
    store: Arc<dyn MemoryStore>,
    limit: usize,
    user_id: Option<String>,
    session_id: Option<String>,
    timeout: Option<Duration>,
}

impl PersistentMemorySource {
    pub fn new(store: Arc<dyn MemoryStore>, limit: usize) -> Self {
        Self {
            store,
            limit,
            user_id: None,
            session_id: None,
            timeout: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ContextSource for PersistentMemorySource {
    fn name(&self) -> &str {
        names::PERSISTENT_MEMORY
    }

    async fn collect(
        &self,
        query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let records = call_collaborator(
            self.timeout,
            self.store.query_by_text(
                query,
                self.limit,
                self.user_id.as_deref(),
                self.session_id.as_deref(),
            ),
        )
        .await?;

        let total = records.len();
        let candidates: Vec<Candidate> = records
            .into_iter()
            .map(|record| (record.importance.clamp(0.0, 1.0), record))
            .filter(|(importance, _)| *importance >= min_relevance)
            .map(|(importance, record)| {
                Candidate::new(record.content, Role::System, importance)
                    .meta("memory_id", record.id)
                    .meta("tags", record.tags)
            })
            .collect();
        debug!(
            "Persistent memory: {} of {} records above relevance {}",
            candidates.len(),
            total,
            min_relevance
        );

        pack_greedy(names::PERSISTENT_MEMORY, candidates, token_budget, accountant, true)
    }
}
