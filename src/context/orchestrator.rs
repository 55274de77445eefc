//! Context build pipeline
//!
//! One build walks a fixed sequence of phases:
//! Budgeting → Allocating → Collecting → Compacting → Emitting → Done.
//! `build_context_stream` reports each phase as a [`BuildEvent`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::accountant::TokenAccountant;
use super::collector::{ContextCollector, SourceFailure};
use super::compactor::{CompactionReport, ContextCompactor};
use super::models::{total_tokens, Message};
use super::token_budget::{BudgetAllocation, BudgetPolicy, TokenBudget};
use crate::metrics::METRICS;

/// Stage of a context build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Budgeting,
    Allocating,
    Collecting,
    Compacting,
    Emitting,
    Done,
}

impl BuildPhase {
    /// Phase that follows this one; `Done` is terminal
    pub fn next(self) -> BuildPhase {
        match self {
            BuildPhase::Budgeting => BuildPhase::Allocating,
            BuildPhase::Allocating => BuildPhase::Collecting,
            BuildPhase::Collecting => BuildPhase::Compacting,
            BuildPhase::Compacting => BuildPhase::Emitting,
            BuildPhase::Emitting | BuildPhase::Done => BuildPhase::Done,
        }
    }
}

/// Progress notification from a streamed build
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    BudgetCreated {
        budget: TokenBudget,
    },
    Allocated {
        allocation: BudgetAllocation,
    },
    Collected {
        blocks: usize,
        tokens: usize,
        failed: Vec<SourceFailure>,
    },
    Compacted {
        report: CompactionReport,
    },
    Emitted {
        messages: usize,
        tokens: usize,
    },
    Completed {
        messages: Vec<Message>,
        report: BuildReport,
    },
}

impl BuildEvent {
    /// Phase that produced this event
    pub fn phase(&self) -> BuildPhase {
        match self {
            BuildEvent::BudgetCreated { .. } => BuildPhase::Budgeting,
            BuildEvent::Allocated { .. } => BuildPhase::Allocating,
            BuildEvent::Collected { .. } => BuildPhase::Collecting,
            BuildEvent::Compacted { .. } => BuildPhase::Compacting,
            BuildEvent::Emitted { .. } => BuildPhase::Emitting,
            BuildEvent::Completed { .. } => BuildPhase::Done,
        }
    }
}

/// Diagnostics for one build
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: Uuid,
    pub budget: TokenBudget,
    pub allocation: BudgetAllocation,
    pub collected_tokens: usize,
    /// Tokens of the emitted context blocks, excluding the system prompt
    pub final_tokens: usize,
    pub failed_sources: Vec<SourceFailure>,
    /// Present only when the collected blocks exceeded the budget
    pub compaction: Option<CompactionReport>,
    pub duration_ms: u64,
}

/// Read-only view of how a build would split the window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetInfo {
    pub total: usize,
    pub reserved_output: usize,
    pub system_prompt: usize,
    pub available: usize,
    pub allocation: BudgetAllocation,
}

/// Budget → collect → compact → emit
pub struct ContextOrchestrator {
    policy: Arc<dyn BudgetPolicy>,
    collector: ContextCollector,
    compactor: ContextCompactor,
    accountant: Arc<TokenAccountant>,
}

impl ContextOrchestrator {
    pub fn new(
        policy: Arc<dyn BudgetPolicy>,
        collector: ContextCollector,
        compactor: ContextCompactor,
        accountant: Arc<TokenAccountant>,
    ) -> Self {
        Self {
            policy,
            collector,
            compactor,
            accountant,
        }
    }

    pub fn collector(&self) -> &ContextCollector {
        &self.collector
    }

    pub fn accountant(&self) -> &Arc<TokenAccountant> {
        &self.accountant
    }

    /// Assemble the prompt for `query`
    pub async fn build_context(
        &self,
        query: &str,
        system_prompt: &str,
        min_relevance: f64,
    ) -> Vec<Message> {
        self.run(query, system_prompt, min_relevance, None).await.0
    }

    /// Assemble the prompt and return the build diagnostics with it
    pub async fn build_context_with_report(
        &self,
        query: &str,
        system_prompt: &str,
        min_relevance: f64,
    ) -> (Vec<Message>, BuildReport) {
        self.run(query, system_prompt, min_relevance, None).await
    }

    /// Run a build in the background, reporting each phase on the returned channel
    ///
    /// The last event is always [`BuildEvent::Completed`] unless the receiver
    /// is dropped first.
    pub fn build_context_stream(
        self: Arc<Self>,
        query: String,
        system_prompt: String,
        min_relevance: f64,
    ) -> mpsc::Receiver<BuildEvent> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let (messages, report) = self
                .run(&query, &system_prompt, min_relevance, Some(&tx))
                .await;
            emit(Some(&tx), BuildEvent::Completed { messages, report }).await;
        });
        rx
    }

    /// Budget and allocation a build would use, without collecting
    pub fn get_budget_info(&self, system_prompt: &str) -> BudgetInfo {
        let budget = self.policy.create_budget(system_prompt);
        let allocation = self
            .policy
            .allocate_for_sources(&budget, &self.collector.source_names());
        BudgetInfo {
            total: budget.total,
            reserved_output: budget.reserved_output,
            system_prompt: budget.system_prompt,
            available: budget.available(),
            allocation,
        }
    }

    async fn run(
        &self,
        query: &str,
        system_prompt: &str,
        min_relevance: f64,
        events: Option<&mpsc::Sender<BuildEvent>>,
    ) -> (Vec<Message>, BuildReport) {
        let build_id = Uuid::new_v4();
        let started = Instant::now();
        let mut phase = BuildPhase::Budgeting;
        debug!(%build_id, ?phase, "Context build started");

        let budget = self.policy.create_budget(system_prompt);
        emit(events, BuildEvent::BudgetCreated { budget }).await;

        phase = advance(phase, build_id);
        debug!(%build_id, available = budget.available());
        let allocation = self
            .policy
            .allocate_for_sources(&budget, &self.collector.source_names());
        emit(
            events,
            BuildEvent::Allocated {
                allocation: allocation.clone(),
            },
        )
        .await;

        phase = advance(phase, build_id);
        debug!(%build_id, sources = allocation.len());
        let collection = self
            .collector
            .collect_with_report(query, &allocation, min_relevance)
            .await;
        let collected_tokens = total_tokens(&collection.blocks);
        emit(
            events,
            BuildEvent::Collected {
                blocks: collection.blocks.len(),
                tokens: collected_tokens,
                failed: collection.failed.clone(),
            },
        )
        .await;

        phase = advance(phase, build_id);
        let available = budget.available();
        let (blocks, compaction) = if collected_tokens > available {
            debug!(%build_id, collected_tokens, available, "Over budget");
            let (blocks, report) = self
                .compactor
                .compact_with_report(&collection.blocks, available)
                .await;
            emit(
                events,
                BuildEvent::Compacted {
                    report: report.clone(),
                },
            )
            .await;
            (blocks, Some(report))
        } else {
            (collection.blocks, None)
        };

        phase = advance(phase, build_id);
        let mut messages = Vec::with_capacity(blocks.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(Message::system(system_prompt));
        }
        messages.extend(blocks.iter().map(|block| block.to_message()));
        let final_tokens = total_tokens(&blocks);
        emit(
            events,
            BuildEvent::Emitted {
                messages: messages.len(),
                tokens: final_tokens,
            },
        )
        .await;

        phase = advance(phase, build_id);
        let elapsed = started.elapsed();
        METRICS.record_build(
            elapsed.as_secs_f64(),
            final_tokens + budget.system_prompt,
            compaction.is_some(),
        );
        info!(
            %build_id,
            ?phase,
            messages = messages.len(),
            collected_tokens,
            final_tokens,
            available,
            failed_sources = collection.failed.len(),
            compacted = compaction.is_some(),
            "Context build finished"
        );

        let report = BuildReport {
            build_id,
            budget,
            allocation,
            collected_tokens,
            final_tokens,
            failed_sources: collection.failed,
            compaction,
            duration_ms: elapsed.as_millis() as u64,
        };
        (messages, report)
    }
}

fn advance(phase: BuildPhase, build_id: Uuid) -> BuildPhase {
    let next = phase.next();
    debug!(%build_id, from = ?phase, to = ?next, "Build phase");
    next
}

async fn emit(events: Option<&mpsc::Sender<BuildEvent>>, event: BuildEvent) {
    if let Some(tx) = events {
        if tx.send(event).await.is_err() {
            debug!("Build event receiver dropped");
        }
    }
}
