//! Context budgeting, collection and compaction
//!
//! A build runs as: create budget → allocate per source → collect
//! concurrently → compact if over budget → emit messages.

pub mod accountant;
pub mod adaptive_manager;
pub mod collector;
pub mod compactor;
pub mod models;
pub mod orchestrator;
pub mod sources;
pub mod summarizer;
pub mod token_budget;
pub mod token_estimator;
pub mod working_memory;

pub use accountant::{CacheStats, TokenAccountant};
pub use adaptive_manager::{AdaptiveBudgetManager, TaskPhase};
pub use collector::{CollectionReport, ContextCollector, SourceFailure};
pub use compactor::{get_compaction_level, CompactionLevel, CompactionReport, ContextCompactor};
pub use models::{total_tokens, BlockError, ContextBlock, Message, Role};
pub use orchestrator::{BudgetInfo, BuildEvent, BuildPhase, BuildReport, ContextOrchestrator};
pub use sources::{ContextSource, SourceError};
pub use summarizer::{
    ExtractiveSummarizer, LLMSummarizer, Summarizer, SummarizerConfig, SummarizerError,
};
pub use token_budget::{BudgetAllocation, BudgetError, BudgetManager, BudgetPolicy, TokenBudget};
pub use token_estimator::{CharEstimator, TiktokenEstimator, TokenEstimator, TokenizerError};
pub use working_memory::{WorkingMemory, WorkingMemoryEntry};
