//! Multi-agent scope sources: inherited context and the shared pool

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{decay, names, pack_greedy, Candidate, ContextSource, SourceError};
use crate::context::accountant::TokenAccountant;
use crate::context::models::{ContextBlock, Role};
use crate::pool::SharedMemoryPool;

/// Visibility of context handed down from a parent agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    Shared,
    Inherited,
    Global,
}

impl ContextScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextScope::Shared => "shared",
            ContextScope::Inherited => "inherited",
            ContextScope::Global => "global",
        }
    }

    /// Priority of items in this scope
    pub fn weight(self) -> f64 {
        match self {
            ContextScope::Shared => 1.0,
            ContextScope::Inherited => 0.9,
            ContextScope::Global => 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedContext {
    pub scope: ContextScope,
    pub key: String,
    pub content: String,
}

impl ScopedContext {
    pub fn new(scope: ContextScope, key: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
            content: content.into(),
        }
    }
}

/// Context inherited from a parent agent, heaviest scope first
pub struct InheritedScopeSource {
    items: Arc<RwLock<Vec<ScopedContext>>>,
}

impl InheritedScopeSource {
    pub fn new(items: Arc<RwLock<Vec<ScopedContext>>>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl ContextSource for InheritedScopeSource {
    fn name(&self) -> &str {
        names::INHERITED_SCOPE
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let mut items = self.items.read().await.clone();
        // stable: equal scopes keep insertion order
        items.sort_by(|a, b| b.scope.weight().total_cmp(&a.scope.weight()));

        let candidates = items.into_iter().map(|item| {
            Candidate::new(item.content, Role::System, item.scope.weight())
                .meta("key", item.key)
                .meta("scope", item.scope.as_str())
        });
        pack_greedy(names::INHERITED_SCOPE, candidates, token_budget, accountant, true)
    }
}

/// Recently updated shared pool entries
///
/// Priority decays from 0.95 (most recent) to 0.55.
pub struct SharedPoolSource {
    pool: Arc<SharedMemoryPool>,
    prefix: Option<String>,
    limit: usize,
}

impl SharedPoolSource {
    pub const NEWEST_PRIORITY: f64 = 0.95;
    pub const OLDEST_PRIORITY: f64 = 0.55;

    pub fn new(pool: Arc<SharedMemoryPool>, prefix: Option<String>, limit: usize) -> Self {
        Self {
            pool,
            prefix,
            limit,
        }
    }
}

#[async_trait]
impl ContextSource for SharedPoolSource {
    fn name(&self) -> &str {
        names::SHARED_POOL
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let entries = self.pool.list_entries(self.prefix.as_deref(), self.limit);
        let n = entries.len();

        let candidates = entries.iter().enumerate().map(|(rank, entry)| {
            Candidate::new(
                format!("{}: {}", entry.key, entry.content),
                Role::System,
                decay(Self::NEWEST_PRIORITY, Self::OLDEST_PRIORITY, rank, n),
            )
            .meta("key", entry.key.clone())
            .meta("version", entry.version)
            .meta("updated_by", entry.updated_by.clone())
        });
        pack_greedy(names::SHARED_POOL, candidates, token_budget, accountant, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inherited_scope_sorted_by_weight() {
        let items = Arc::new(RwLock::new(vec![
            ScopedContext::new(ContextScope::Global, "g", "global rules"),
            ScopedContext::new(ContextScope::Inherited, "i1", "parent goal"),
            ScopedContext::new(ContextScope::Shared, "s", "shared plan"),
            ScopedContext::new(ContextScope::Inherited, "i2", "parent notes"),
        ]));
        let source = InheritedScopeSource::new(items);
        let accountant = TokenAccountant::estimating(100);

        let blocks = source.collect("q", 1000, &accountant, 0.0).await.unwrap();
        let keys: Vec<_> = blocks.iter().map(|b| b.metadata()["key"].clone()).collect();
        assert_eq!(keys, vec!["s", "i1", "i2", "g"]);
        assert_eq!(blocks[0].priority(), 1.0);
        assert_eq!(blocks[3].priority(), 0.7);
        assert_eq!(blocks[1].metadata()["scope"], "inherited");
        assert!(blocks.iter().all(|b| b.is_compressible()));
    }

    #[tokio::test]
    async fn test_shared_pool_most_recent_first() {
        let pool = Arc::new(SharedMemoryPool::new());
        pool.write("plan/a", "draft", "agent-a", None, None).await.unwrap();
        pool.write("plan/b", "todo", "agent-b", None, None).await.unwrap();
        pool.write("misc", "ignored", "agent-c", None, None).await.unwrap();
        pool.write("plan/a", "final", "agent-c", None, None).await.unwrap();

        let source = SharedPoolSource::new(pool, Some("plan/".to_string()), 10);
        let accountant = TokenAccountant::estimating(100);
        let blocks = source.collect("q", 1000, &accountant, 0.0).await.unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content(), "plan/a: final");
        assert_eq!(blocks[0].metadata()["version"], 2);
        assert_eq!(blocks[0].metadata()["updated_by"], "agent-c");
        assert!((blocks[0].priority() - 0.95).abs() < 1e-9);
        assert!((blocks[1].priority() - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shared_pool_empty() {
        let source = SharedPoolSource::new(Arc::new(SharedMemoryPool::new()), None, 10);
        let accountant = TokenAccountant::estimating(100);
        assert!(source.collect("q", 1000, &accountant, 0.0).await.unwrap().is_empty());
    }
}
