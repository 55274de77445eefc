//! Crate-level error type

use thiserror::Error;

use crate::context::models::BlockError;
use crate::pool::PoolError;

/// Errors surfaced to callers of the engine
///
/// Most failures inside a build (source errors, summarizer errors, tokenizer
/// errors) are contained and never reach this type.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid context block: {0}")]
    Block(#[from] BlockError),

    #[error("Shared pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;
