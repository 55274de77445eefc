//! Context budgeting and compaction engine for LLM agents
//!
//! Turns an unbounded set of candidate context (conversation, memories,
//! retrieved knowledge, tool and skill definitions, shared agent state) into a
//! token-bounded, priority-ordered prompt:
//!
//! - [`context::TokenAccountant`] counts tokens with a bounded cache
//! - [`context::ContextSource`] implementations produce [`context::ContextBlock`]s
//! - [`context::BudgetManager`] splits the model window across sources
//! - [`context::ContextCollector`] fans out to sources concurrently
//! - [`context::ContextCompactor`] fits the merged blocks into the budget
//! - [`context::ContextOrchestrator`] ties it together in `build_context`
//! - [`pool::SharedMemoryPool`] is a versioned key/value store shared by agents

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod providers;

pub use error::{ContextError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::{
        AdaptiveBudgetManager, BudgetAllocation, BudgetManager, BudgetPolicy, CompactionLevel,
        CompactionReport, ContextBlock, ContextCollector, ContextCompactor, ContextOrchestrator,
        ContextSource, Message, Role, TaskPhase, TokenAccountant, TokenBudget,
    };
    pub use crate::error::{ContextError, Result};
    pub use crate::pool::{PoolEntry, PoolError, SharedMemoryPool};
}
