//! Engine configuration
//!
//! Loaded from an optional TOML file and `CONTEXT_ENGINE__<SECTION>__<KEY>`
//! environment variables (after `.env` is read).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::sources::names;
use crate::context::summarizer::SummarizerConfig;
use crate::error::{ContextError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `path` (if it exists) and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CONTEXT_ENGINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no environment overlay)
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check bounds that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.engine.model_context_window == 0 {
            return Err(ContextError::Configuration(
                "engine.model_context_window must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.engine.output_reserve_ratio) {
            return Err(ContextError::Configuration(format!(
                "engine.output_reserve_ratio must be within [0, 1), got {}",
                self.engine.output_reserve_ratio
            )));
        }
        if self.budget.early_threshold >= self.budget.late_threshold {
            return Err(ContextError::Configuration(format!(
                "budget.early_threshold ({}) must be below budget.late_threshold ({})",
                self.budget.early_threshold, self.budget.late_threshold
            )));
        }
        if !(self.budget.default_share > 0.0) {
            return Err(ContextError::Configuration(
                "budget.default_share must be positive".to_string(),
            ));
        }
        // Ratio tables are not validated here: a bad table is recovered at
        // allocation time by falling back to the built-in defaults.
        Ok(())
    }
}

/// Model window and accounting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model context window in tokens
    #[serde(default = "default_context_window")]
    pub model_context_window: usize,

    /// Share of the window reserved for the completion
    #[serde(default = "default_output_reserve_ratio")]
    pub output_reserve_ratio: f64,

    /// Per-message framing cost in tokens
    #[serde(default = "default_message_overhead")]
    pub message_overhead: usize,

    /// Maximum cached token counts
    #[serde(default = "default_token_cache_capacity")]
    pub token_cache_capacity: usize,

    /// Use the tiktoken backend (estimation otherwise)
    #[serde(default = "default_use_tiktoken")]
    pub use_tiktoken: bool,
}

fn default_context_window() -> usize {
    128_000
}

fn default_output_reserve_ratio() -> f64 {
    0.25
}

fn default_message_overhead() -> usize {
    3
}

fn default_token_cache_capacity() -> usize {
    10_000
}

fn default_use_tiktoken() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_context_window: default_context_window(),
            output_reserve_ratio: default_output_reserve_ratio(),
            message_overhead: default_message_overhead(),
            token_cache_capacity: default_token_cache_capacity(),
            use_tiktoken: default_use_tiktoken(),
        }
    }
}

/// Allocation ratios and phase thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Ratio table used outside of phase-aware allocation (and in MIDDLE)
    #[serde(default = "default_ratios")]
    pub ratios: IndexMap<String, f64>,

    /// Ratio granted to sources absent from the table
    #[serde(default = "default_share")]
    pub default_share: f64,

    /// Progress below this is EARLY
    #[serde(default = "default_early_threshold")]
    pub early_threshold: f64,

    /// Progress at or above this is LATE
    #[serde(default = "default_late_threshold")]
    pub late_threshold: f64,

    #[serde(default = "default_early_ratios")]
    pub early_ratios: IndexMap<String, f64>,

    #[serde(default = "default_late_ratios")]
    pub late_ratios: IndexMap<String, f64>,
}

/// Built-in ratio table
pub fn default_ratios() -> IndexMap<String, f64> {
    ratio_table(&[
        (names::USER_INPUT, 0.10),
        (names::RECENT_WINDOW, 0.25),
        (names::AGENT_OUTPUT, 0.10),
        (names::WORKING_MEMORY, 0.10),
        (names::PERSISTENT_MEMORY, 0.10),
        (names::KNOWLEDGE, 0.15),
        (names::TOOLS, 0.05),
        (names::SKILLS, 0.05),
        (names::INHERITED_SCOPE, 0.05),
        (names::SHARED_POOL, 0.05),
    ])
}

/// EARLY: recency and the user's request dominate
pub fn default_early_ratios() -> IndexMap<String, f64> {
    ratio_table(&[
        (names::USER_INPUT, 0.15),
        (names::RECENT_WINDOW, 0.30),
        (names::AGENT_OUTPUT, 0.10),
        (names::WORKING_MEMORY, 0.10),
        (names::PERSISTENT_MEMORY, 0.08),
        (names::KNOWLEDGE, 0.12),
        (names::TOOLS, 0.05),
        (names::SKILLS, 0.05),
        (names::INHERITED_SCOPE, 0.025),
        (names::SHARED_POOL, 0.025),
    ])
}

/// LATE: inherited and shared context gain weight
pub fn default_late_ratios() -> IndexMap<String, f64> {
    ratio_table(&[
        (names::USER_INPUT, 0.10),
        (names::RECENT_WINDOW, 0.20),
        (names::AGENT_OUTPUT, 0.10),
        (names::WORKING_MEMORY, 0.10),
        (names::PERSISTENT_MEMORY, 0.08),
        (names::KNOWLEDGE, 0.12),
        (names::TOOLS, 0.05),
        (names::SKILLS, 0.05),
        (names::INHERITED_SCOPE, 0.10),
        (names::SHARED_POOL, 0.10),
    ])
}

fn ratio_table(entries: &[(&str, f64)]) -> IndexMap<String, f64> {
    entries
        .iter()
        .map(|(name, ratio)| (name.to_string(), *ratio))
        .collect()
}

fn default_share() -> f64 {
    0.05
}

fn default_early_threshold() -> f64 {
    0.3
}

fn default_late_threshold() -> f64 {
    0.7
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ratios: default_ratios(),
            default_share: default_share(),
            early_threshold: default_early_threshold(),
            late_threshold: default_late_threshold(),
            early_ratios: default_early_ratios(),
            late_ratios: default_late_ratios(),
        }
    }
}

/// Per-source limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Messages considered by the recent window
    #[serde(default = "default_recent_window_size")]
    pub recent_window_size: usize,

    /// Working memory arena capacity
    #[serde(default = "default_working_memory_capacity")]
    pub working_memory_capacity: usize,

    /// Records requested from the memory store
    #[serde(default = "default_persistent_memory_limit")]
    pub persistent_memory_limit: usize,

    /// Hits requested from the knowledge base
    #[serde(default = "default_knowledge_limit")]
    pub knowledge_limit: usize,

    /// Minimum retrieval relevance for knowledge hits
    #[serde(default)]
    pub knowledge_threshold: f64,

    /// Key prefix read by the shared pool source
    #[serde(default)]
    pub shared_pool_prefix: Option<String>,

    /// Entries read by the shared pool source
    #[serde(default = "default_shared_pool_limit")]
    pub shared_pool_limit: usize,

    /// Timeout for external collaborator calls, in milliseconds
    #[serde(default)]
    pub collaborator_timeout_ms: Option<u64>,
}

fn default_recent_window_size() -> usize {
    20
}

fn default_working_memory_capacity() -> usize {
    64
}

fn default_persistent_memory_limit() -> usize {
    20
}

fn default_knowledge_limit() -> usize {
    10
}

fn default_shared_pool_limit() -> usize {
    50
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            recent_window_size: default_recent_window_size(),
            working_memory_capacity: default_working_memory_capacity(),
            persistent_memory_limit: default_persistent_memory_limit(),
            knowledge_limit: default_knowledge_limit(),
            knowledge_threshold: 0.0,
            shared_pool_prefix: None,
            shared_pool_limit: default_shared_pool_limit(),
            collaborator_timeout_ms: None,
        }
    }
}

impl SourcesConfig {
    /// Timeout for sources that call external collaborators
    pub fn collaborator_timeout(&self) -> Option<Duration> {
        self.collaborator_timeout_ms.map(Duration::from_millis)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.model_context_window, 128_000);
        assert_eq!(config.engine.output_reserve_ratio, 0.25);
        assert_eq!(config.engine.message_overhead, 3);
    }

    #[test]
    fn test_ratio_tables_sum_to_one() {
        for table in [default_ratios(), default_early_ratios(), default_late_ratios()] {
            let sum: f64 = table.values().sum();
            assert!((sum - 1.0).abs() < 1e-9, "table sums to {}", sum);
        }
    }

    #[test]
    fn test_phase_tables_shift_weight() {
        let early = default_early_ratios();
        let late = default_late_ratios();
        let base = default_ratios();
        assert!(early[names::RECENT_WINDOW] > base[names::RECENT_WINDOW]);
        assert!(early[names::USER_INPUT] > base[names::USER_INPUT]);
        assert!(late[names::INHERITED_SCOPE] > base[names::INHERITED_SCOPE]);
        assert!(late[names::SHARED_POOL] > base[names::SHARED_POOL]);
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let raw = r#"
            [engine]
            model_context_window = 8000
            use_tiktoken = false

            [sources]
            knowledge_limit = 4
            collaborator_timeout_ms = 250

            [logging]
            level = "debug"
            json = true
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.engine.model_context_window, 8000);
        assert!(!config.engine.use_tiktoken);
        assert_eq!(config.engine.output_reserve_ratio, 0.25);
        assert_eq!(config.sources.knowledge_limit, 4);
        assert_eq!(config.sources.recent_window_size, 20);
        assert_eq!(
            config.sources.collaborator_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_reserve_ratio_rejected() {
        let mut config = Config::default();
        config.engine.output_reserve_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.budget.early_threshold = 0.8;
        assert!(config.validate().is_err());
    }
}
