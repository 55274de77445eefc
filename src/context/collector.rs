//! Concurrent fan-out collection over registered sources

use futures::future::join_all;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::accountant::TokenAccountant;
use super::models::{total_tokens, ContextBlock};
use super::sources::{ContextSource, SourceError};
use super::token_budget::BudgetAllocation;
use crate::metrics::METRICS;

/// A source that failed during one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

/// Blocks plus the sources that failed to produce any
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    pub blocks: Vec<ContextBlock>,
    pub failed: Vec<SourceFailure>,
}

/// Runs every active source concurrently and merges the results
///
/// All sources are joined before returning; nothing is spawned. A source
/// that errors or panics is logged and left out without affecting siblings.
pub struct ContextCollector {
    accountant: Arc<TokenAccountant>,
    sources: IndexMap<String, Arc<dyn ContextSource>>,
}

impl ContextCollector {
    pub fn new(accountant: Arc<TokenAccountant>) -> Self {
        Self {
            accountant,
            sources: IndexMap::new(),
        }
    }

    /// Register a source under its name; a later registration replaces it
    pub fn register(&mut self, source: Arc<dyn ContextSource>) -> &mut Self {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), source).is_some() {
            warn!("Context source {} registered twice, keeping the latest", name);
        }
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.register(source);
        self
    }

    /// Registered source names, in registration order
    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn accountant(&self) -> &Arc<TokenAccountant> {
        &self.accountant
    }

    /// Collect from every source with a positive allocation
    pub async fn collect(
        &self,
        query: &str,
        allocation: &BudgetAllocation,
        min_relevance: f64,
    ) -> Vec<ContextBlock> {
        self.collect_with_report(query, allocation, min_relevance)
            .await
            .blocks
    }

    pub async fn collect_with_report(
        &self,
        query: &str,
        allocation: &BudgetAllocation,
        min_relevance: f64,
    ) -> CollectionReport {
        let plan = self
            .sources
            .iter()
            .filter_map(|(name, source)| {
                let budget = allocation.get(name);
                (budget > 0).then(|| (Arc::clone(source), budget))
            })
            .collect();
        self.run(query, plan, min_relevance).await
    }

    /// Collect from an explicit source → budget map; unknown names are skipped
    pub async fn collect_from_specific(
        &self,
        query: &str,
        budgets: &IndexMap<String, usize>,
        min_relevance: f64,
    ) -> Vec<ContextBlock> {
        for name in budgets.keys().filter(|name| !self.sources.contains_key(*name)) {
            warn!("Unknown context source requested: {}", name);
        }

        let plan = self
            .sources
            .iter()
            .filter_map(|(name, source)| {
                let budget = budgets.get(name).copied().unwrap_or(0);
                (budget > 0).then(|| (Arc::clone(source), budget))
            })
            .collect();
        self.run(query, plan, min_relevance).await.blocks
    }

    async fn run(
        &self,
        query: &str,
        plan: Vec<(Arc<dyn ContextSource>, usize)>,
        min_relevance: f64,
    ) -> CollectionReport {
        let accountant = self.accountant.as_ref();
        let tasks = plan.iter().map(|(source, budget)| async move {
            let collect = source.collect(query, *budget, accountant, min_relevance);
            let outcome = AssertUnwindSafe(collect)
                .catch_unwind()
                .await;
            (source.name(), *budget, outcome)
        });

        let mut report = CollectionReport::default();
        for (name, budget, outcome) in join_all(tasks).await {
            let error = match outcome {
                Ok(Ok(blocks)) => {
                    debug!(
                        "Source {} returned {} blocks ({} tokens, budget {})",
                        name,
                        blocks.len(),
                        total_tokens(&blocks),
                        budget
                    );
                    report.blocks.extend(blocks);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(panic) => SourceError::Failed(format!("panicked: {}", panic_message(&*panic))),
            };

            warn!("Context source {} failed: {}", name, error);
            METRICS.record_source_failure(name);
            report.failed.push(SourceFailure {
                source: name.to_string(),
                error: error.to_string(),
            });
        }

        // stable: equal priorities keep registration order
        report
            .blocks
            .sort_by(|a, b| b.priority().total_cmp(&a.priority()));
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::Role;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Barrier;

    struct Fixed {
        name: &'static str,
        items: Vec<(&'static str, f64)>,
    }

    #[async_trait]
    impl ContextSource for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn collect(
            &self,
            _query: &str,
            _token_budget: usize,
            accountant: &TokenAccountant,
            _min_relevance: f64,
        ) -> Result<Vec<ContextBlock>, SourceError> {
            self.items
                .iter()
                .map(|(content, priority)| {
                    ContextBlock::new(
                        *content,
                        Role::System,
                        accountant.count_framed(content),
                        *priority,
                        self.name,
                    )
                    .map_err(SourceError::from)
                })
                .collect()
        }
    }

    struct Failing;

    #[async_trait]
    impl ContextSource for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn collect(
            &self,
            _query: &str,
            _token_budget: usize,
            _accountant: &TokenAccountant,
            _min_relevance: f64,
        ) -> Result<Vec<ContextBlock>, SourceError> {
            Err(SourceError::Failed("backend offline".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ContextSource for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn collect(
            &self,
            _query: &str,
            _token_budget: usize,
            _accountant: &TokenAccountant,
            _min_relevance: f64,
        ) -> Result<Vec<ContextBlock>, SourceError> {
            panic!("index out of bounds");
        }
    }

    struct Rendezvous {
        name: &'static str,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl ContextSource for Rendezvous {
        fn name(&self) -> &str {
            self.name
        }

        async fn collect(
            &self,
            _query: &str,
            _token_budget: usize,
            _accountant: &TokenAccountant,
            _min_relevance: f64,
        ) -> Result<Vec<ContextBlock>, SourceError> {
            self.barrier.wait().await;
            Ok(Vec::new())
        }
    }

    fn collector() -> ContextCollector {
        ContextCollector::new(Arc::new(TokenAccountant::estimating(100)))
    }

    fn allocation(names: &[&str], tokens: usize) -> BudgetAllocation {
        names.iter().map(|n| (n.to_string(), tokens)).collect()
    }

    #[tokio::test]
    async fn test_merges_and_sorts_by_priority() {
        let collector = collector()
            .with_source(Arc::new(Fixed {
                name: "a",
                items: vec![("a-low", 0.2), ("a-high", 0.9)],
            }))
            .with_source(Arc::new(Fixed { name: "b", items: vec![("b-mid", 0.5)] }));

        let blocks = collector.collect("q", &allocation(&["a", "b"], 100), 0.0).await;
        let contents: Vec<_> = blocks.iter().map(|b| b.content()).collect();
        assert_eq!(contents, vec!["a-high", "b-mid", "a-low"]);
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let collector = collector()
            .with_source(Arc::new(Fixed { name: "first", items: vec![("1", 0.5)] }))
            .with_source(Arc::new(Fixed { name: "second", items: vec![("2", 0.5)] }))
            .with_source(Arc::new(Fixed { name: "third", items: vec![("3", 0.5)] }));

        let blocks = collector
            .collect("q", &allocation(&["third", "second", "first"], 100), 0.0)
            .await;
        let contents: Vec<_> = blocks.iter().map(|b| b.content()).collect();
        assert_eq!(contents, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let collector = collector()
            .with_source(Arc::new(Failing))
            .with_source(Arc::new(Panicking))
            .with_source(Arc::new(Fixed { name: "ok", items: vec![("survivor", 0.7)] }));

        let report = collector
            .collect_with_report("q", &allocation(&["failing", "panicking", "ok"], 100), 0.0)
            .await;

        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].content(), "survivor");
        let failed: Vec<_> = report.failed.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(failed, vec!["failing", "panicking"]);
        assert!(report.failed[1].error.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_zero_or_missing_allocation_skips_source() {
        let collector = collector()
            .with_source(Arc::new(Fixed { name: "a", items: vec![("a", 0.5)] }))
            .with_source(Arc::new(Fixed { name: "b", items: vec![("b", 0.5)] }))
            .with_source(Arc::new(Fixed { name: "c", items: vec![("c", 0.5)] }));

        let alloc: BudgetAllocation = vec![("a".to_string(), 100), ("b".to_string(), 0)]
            .into_iter()
            .collect();

        let blocks = collector.collect("q", &alloc, 0.0).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source(), "a");
    }

    #[tokio::test]
    async fn test_collect_from_specific_skips_unknown() {
        let collector = collector()
            .with_source(Arc::new(Fixed { name: "a", items: vec![("a", 0.5)] }))
            .with_source(Arc::new(Fixed { name: "b", items: vec![("b", 0.6)] }));

        let mut budgets = IndexMap::new();
        budgets.insert("b".to_string(), 50);
        budgets.insert("nope".to_string(), 50);

        let blocks = collector.collect_from_specific("q", &budgets, 0.0).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content(), "b");
    }

    #[tokio::test]
    async fn test_sources_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let collector = collector()
            .with_source(Arc::new(Rendezvous { name: "left", barrier: barrier.clone() }))
            .with_source(Arc::new(Rendezvous { name: "right", barrier }));

        // sequential execution would never pass the barrier
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            collector.collect_with_report("q", &allocation(&["left", "right"], 10), 0.0),
        )
        .await
        .unwrap();
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_source_names_in_registration_order() {
        let mut collector = collector();
        collector.register(Arc::new(Fixed { name: "z", items: vec![] }));
        collector.register(Arc::new(Fixed { name: "a", items: vec![] }));
        assert_eq!(collector.source_names(), vec!["z", "a"]);
    }
}
