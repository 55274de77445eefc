//! Token budget creation and per-source allocation
//!
//! The model window is split as:
//! - Reserved output: `floor(window × output_reserve_ratio)`
//! - System prompt: framed cost of the system message
//! - Available: the rest, distributed over sources by a ratio table

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::accountant::TokenAccountant;
use super::models::Message;
use crate::config::{default_ratios, BudgetConfig, Config, EngineConfig};

/// Token budget for one context build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub total: usize,
    pub reserved_output: usize,
    pub system_prompt: usize,
}

impl TokenBudget {
    pub fn new(total: usize, reserved_output: usize, system_prompt: usize) -> Self {
        Self {
            total,
            reserved_output,
            system_prompt,
        }
    }

    /// Tokens left for sources, never negative
    pub fn available(&self) -> usize {
        self.total
            .saturating_sub(self.reserved_output)
            .saturating_sub(self.system_prompt)
    }

    /// Tokens already committed before collection
    pub fn used(&self) -> usize {
        self.system_prompt
    }
}

/// Tokens granted per source, in allocation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BudgetAllocation {
    tokens: IndexMap<String, usize>,
}

impl BudgetAllocation {
    /// Tokens granted to `source` (0 when absent)
    pub fn get(&self, source: &str) -> usize {
        self.tokens.get(source).copied().unwrap_or(0)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.tokens.contains_key(source)
    }

    pub fn total(&self) -> usize {
        self.tokens.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.tokens.iter().map(|(name, tokens)| (name.as_str(), *tokens))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn as_map(&self) -> &IndexMap<String, usize> {
        &self.tokens
    }
}

impl FromIterator<(String, usize)> for BudgetAllocation {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

/// Budget policy errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("Invalid ratio table: {0}")]
    InvalidRatios(String),
}

/// Strategy for creating budgets and splitting them across sources
pub trait BudgetPolicy: Send + Sync {
    fn create_budget(&self, system_prompt: &str) -> TokenBudget;

    /// Split `available` over the whole active ratio table
    fn allocate(&self, budget: &TokenBudget) -> BudgetAllocation;

    /// Split `available` over `names` only; every name gets at least 1 token
    fn allocate_for_sources(&self, budget: &TokenBudget, names: &[String]) -> BudgetAllocation;
}

/// Reject tables with negative or non-finite ratios, or a zero sum
pub fn validate_ratios(table: &IndexMap<String, f64>) -> Result<(), BudgetError> {
    if let Some((name, ratio)) = table.iter().find(|(_, r)| !r.is_finite() || **r < 0.0) {
        return Err(BudgetError::InvalidRatios(format!(
            "ratio for '{}' is {}",
            name, ratio
        )));
    }
    if table.values().sum::<f64>() <= 0.0 {
        return Err(BudgetError::InvalidRatios("ratios sum to zero".to_string()));
    }
    Ok(())
}

fn usable_table(table: &IndexMap<String, f64>) -> IndexMap<String, f64> {
    match validate_ratios(table) {
        Ok(()) => table.clone(),
        Err(e) => {
            warn!("{}; falling back to default ratios", e);
            default_ratios()
        }
    }
}

fn split(available: usize, shares: IndexMap<String, f64>, at_least_one: bool) -> BudgetAllocation {
    let sum: f64 = shares.values().sum();
    shares
        .into_iter()
        .map(|(name, ratio)| {
            let tokens = if sum > 0.0 {
                (available as f64 * ratio / sum).floor() as usize
            } else {
                0
            };
            let tokens = if at_least_one { tokens.max(1) } else { tokens };
            (name, tokens)
        })
        .collect()
}

/// Distribute `available` over a normalized ratio table
pub fn distribute(table: &IndexMap<String, f64>, available: usize) -> BudgetAllocation {
    split(available, usable_table(table), false)
}

/// Distribute `available` over `names` (deduplicated, order kept)
///
/// Names missing from the table weigh `default_share`.
pub fn distribute_for(
    table: &IndexMap<String, f64>,
    default_share: f64,
    available: usize,
    names: &[String],
) -> BudgetAllocation {
    let table = usable_table(table);
    let default_share = if default_share.is_finite() && default_share > 0.0 {
        default_share
    } else {
        BudgetConfig::default().default_share
    };

    let mut shares: IndexMap<String, f64> = IndexMap::with_capacity(names.len());
    for name in names {
        if !shares.contains_key(name) {
            let ratio = table.get(name).copied().unwrap_or(default_share);
            shares.insert(name.clone(), ratio);
        }
    }
    split(available, shares, true)
}

/// Budget for the configured model window
pub(crate) fn window_budget(
    engine: &EngineConfig,
    accountant: &TokenAccountant,
    system_prompt: &str,
) -> TokenBudget {
    let total = engine.model_context_window;
    let reserved_output = (total as f64 * engine.output_reserve_ratio).floor() as usize;
    let system_tokens = if system_prompt.is_empty() {
        0
    } else {
        accountant.count_message(&Message::system(system_prompt))
    };
    let budget = TokenBudget::new(total, reserved_output, system_tokens);
    debug!(
        "Created budget: total={}, reserved={}, system={}, available={}",
        budget.total,
        budget.reserved_output,
        budget.system_prompt,
        budget.available()
    );
    budget
}

/// Static ratio-table budget policy
pub struct BudgetManager {
    engine: EngineConfig,
    budget: BudgetConfig,
    accountant: Arc<TokenAccountant>,
}

impl BudgetManager {
    pub fn new(
        engine: EngineConfig,
        budget: BudgetConfig,
        accountant: Arc<TokenAccountant>,
    ) -> Self {
        Self {
            engine,
            budget,
            accountant,
        }
    }

    pub fn from_config(config: &Config, accountant: Arc<TokenAccountant>) -> Self {
        Self::new(config.engine.clone(), config.budget.clone(), accountant)
    }

    pub fn ratios(&self) -> &IndexMap<String, f64> {
        &self.budget.ratios
    }
}

impl BudgetPolicy for BudgetManager {
    fn create_budget(&self, system_prompt: &str) -> TokenBudget {
        window_budget(&self.engine, &self.accountant, system_prompt)
    }

    fn allocate(&self, budget: &TokenBudget) -> BudgetAllocation {
        distribute(&self.budget.ratios, budget.available())
    }

    fn allocate_for_sources(&self, budget: &TokenBudget, names: &[String]) -> BudgetAllocation {
        let allocation = distribute_for(
            &self.budget.ratios,
            self.budget.default_share,
            budget.available(),
            names,
        );
        debug!(
            "Allocated {} tokens across {} sources",
            allocation.total(),
            allocation.len()
        );
        allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::sources::names;

    fn manager(window: usize) -> BudgetManager {
        let engine = EngineConfig {
            model_context_window: window,
            ..EngineConfig::default()
        };
        BudgetManager::new(
            engine,
            BudgetConfig::default(),
            Arc::new(TokenAccountant::estimating(100)),
        )
    }

    fn owned(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_budget_arithmetic() {
        let budget = TokenBudget::new(10_000, 2_500, 500);
        assert_eq!(budget.available(), 7_000);
        assert_eq!(budget.used(), 500);
    }

    #[test]
    fn test_available_saturates() {
        let budget = TokenBudget::new(100, 80, 50);
        assert_eq!(budget.available(), 0);
    }

    #[test]
    fn test_create_budget_reserves_output_and_prompt() {
        let manager = manager(10_000);
        let budget = manager.create_budget("");
        assert_eq!(budget.reserved_output, 2_500);
        assert_eq!(budget.system_prompt, 0);
        assert_eq!(budget.available(), 7_500);

        // 16 chars -> 4 tokens + 3 framing
        let budget = manager.create_budget("You are helpful.");
        assert_eq!(budget.system_prompt, 7);
        assert_eq!(budget.available(), 7_493);
    }

    #[test]
    fn test_allocate_follows_ratio_table() {
        let manager = manager(10_000);
        let budget = TokenBudget::new(10_000, 0, 0);
        let allocation = manager.allocate(&budget);

        assert_eq!(allocation.get(names::RECENT_WINDOW), 2_500);
        assert_eq!(allocation.get(names::KNOWLEDGE), 1_500);
        assert!(allocation.total() <= 10_000);
        assert_eq!(allocation.iter().next().map(|(n, _)| n), Some(names::USER_INPUT));
    }

    #[test]
    fn test_allocate_for_sources_renormalizes() {
        let manager = manager(10_000);
        let budget = TokenBudget::new(10_000, 0, 0);
        let allocation = manager.allocate_for_sources(
            &budget,
            &owned(&[names::RECENT_WINDOW, names::KNOWLEDGE, names::RECENT_WINDOW]),
        );

        assert_eq!(allocation.len(), 2);
        assert_eq!(allocation.get(names::RECENT_WINDOW), 6_250);
        assert_eq!(allocation.get(names::KNOWLEDGE), 3_750);
    }

    #[test]
    fn test_unknown_source_gets_default_share() {
        let manager = manager(10_000);
        let budget = TokenBudget::new(10_000, 0, 0);
        let allocation =
            manager.allocate_for_sources(&budget, &owned(&[names::TOOLS, "custom_source"]));
        assert_eq!(allocation.get("custom_source"), allocation.get(names::TOOLS));
        assert_eq!(allocation.get("custom_source"), 5_000);
    }

    #[test]
    fn test_allocate_for_sources_never_zero() {
        let manager = manager(10_000);
        let requested = owned(&[
            names::USER_INPUT,
            names::RECENT_WINDOW,
            names::TOOLS,
            names::SHARED_POOL,
            "custom",
        ]);
        for available in [0, 1, 3, 17, 1_000] {
            let budget = TokenBudget::new(available, 0, 0);
            let allocation = manager.allocate_for_sources(&budget, &requested);
            assert_eq!(allocation.len(), requested.len());
            assert!(allocation.iter().all(|(_, tokens)| tokens >= 1));
        }
    }

    #[test]
    fn test_invalid_table_falls_back_to_defaults() {
        let mut zero = IndexMap::new();
        zero.insert(names::KNOWLEDGE.to_string(), 0.0);
        let allocation = distribute(&zero, 10_000);
        assert_eq!(allocation.get(names::RECENT_WINDOW), 2_500);

        let mut negative = IndexMap::new();
        negative.insert(names::KNOWLEDGE.to_string(), -0.5);
        negative.insert(names::TOOLS.to_string(), 1.5);
        assert!(validate_ratios(&negative).is_err());
        let allocation = distribute(&negative, 10_000);
        assert_eq!(allocation.len(), default_ratios().len());

        let mut nan = IndexMap::new();
        nan.insert(names::TOOLS.to_string(), f64::NAN);
        assert!(matches!(validate_ratios(&nan), Err(BudgetError::InvalidRatios(_))));
    }

    #[test]
    fn test_unnormalized_table_is_normalized() {
        let mut table = IndexMap::new();
        table.insert("a".to_string(), 2.0);
        table.insert("b".to_string(), 6.0);
        let allocation = distribute(&table, 1_000);
        assert_eq!(allocation.get("a"), 250);
        assert_eq!(allocation.get("b"), 750);
    }
}
