//! Shared memory pool for cross-agent state
//!
//! A key/value store written by several agents at once:
//! - Last writer wins by default
//! - Optimistic concurrency through `expected_version`
//! - Whole-entry replacement, so readers never see partial writes
//! - Best-effort change notifications to an event bus

pub mod models;
pub mod store;

pub use models::{PoolEntry, PoolError};
pub use store::SharedMemoryPool;
