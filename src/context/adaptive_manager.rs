//! Phase-aware budget allocation
//!
//! Task progress selects the active ratio table:
//! - EARLY favors recency and the user's request
//! - MIDDLE uses the base table
//! - LATE shifts weight toward inherited and shared context

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::accountant::TokenAccountant;
use super::token_budget::{
    distribute, distribute_for, window_budget, BudgetAllocation, BudgetPolicy, TokenBudget,
};
use crate::config::{BudgetConfig, Config, EngineConfig};

/// Coarse stage of a multi-step task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Early,
    Middle,
    Late,
}

impl TaskPhase {
    pub const EARLY_THRESHOLD: f64 = 0.3;
    pub const LATE_THRESHOLD: f64 = 0.7;

    /// Phase for `current_step` out of `max_step` using the default thresholds
    pub fn from_progress(current_step: i64, max_step: i64) -> Self {
        Self::from_progress_with(
            current_step,
            max_step,
            Self::EARLY_THRESHOLD,
            Self::LATE_THRESHOLD,
        )
    }

    /// Phase with explicit thresholds; an unknown horizon (`max_step <= 0`) is MIDDLE
    pub fn from_progress_with(current_step: i64, max_step: i64, early: f64, late: f64) -> Self {
        if max_step <= 0 {
            return TaskPhase::Middle;
        }
        let progress = current_step as f64 / max_step as f64;
        if progress < early {
            TaskPhase::Early
        } else if progress >= late {
            TaskPhase::Late
        } else {
            TaskPhase::Middle
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Early => "early",
            TaskPhase::Middle => "middle",
            TaskPhase::Late => "late",
        }
    }
}

impl Default for TaskPhase {
    fn default() -> Self {
        TaskPhase::Middle
    }
}

/// Budget policy whose ratio table follows the task phase
pub struct AdaptiveBudgetManager {
    engine: EngineConfig,
    budget: BudgetConfig,
    accountant: Arc<TokenAccountant>,
    phase: RwLock<TaskPhase>,
}

impl AdaptiveBudgetManager {
    pub fn new(
        engine: EngineConfig,
        budget: BudgetConfig,
        accountant: Arc<TokenAccountant>,
    ) -> Self {
        Self {
            engine,
            budget,
            accountant,
            phase: RwLock::new(TaskPhase::default()),
        }
    }

    pub fn from_config(config: &Config, accountant: Arc<TokenAccountant>) -> Self {
        Self::new(config.engine.clone(), config.budget.clone(), accountant)
    }

    /// Recompute the phase from task progress and activate its table
    pub fn update_phase(&self, current_step: i64, max_step: i64) -> TaskPhase {
        let next = TaskPhase::from_progress_with(
            current_step,
            max_step,
            self.budget.early_threshold,
            self.budget.late_threshold,
        );
        self.set_phase(next);
        next
    }

    pub fn set_phase(&self, phase: TaskPhase) {
        let mut current = self.phase.write().unwrap_or_else(|e| e.into_inner());
        if *current != phase {
            info!("Task phase {} -> {}", current.as_str(), phase.as_str());
            *current = phase;
        }
    }

    pub fn phase(&self) -> TaskPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Ratio table for the current phase
    pub fn active_ratios(&self) -> &IndexMap<String, f64> {
        match self.phase() {
            TaskPhase::Early => &self.budget.early_ratios,
            TaskPhase::Middle => &self.budget.ratios,
            TaskPhase::Late => &self.budget.late_ratios,
        }
    }
}

impl BudgetPolicy for AdaptiveBudgetManager {
    fn create_budget(&self, system_prompt: &str) -> TokenBudget {
        window_budget(&self.engine, &self.accountant, system_prompt)
    }

    fn allocate(&self, budget: &TokenBudget) -> BudgetAllocation {
        distribute(self.active_ratios(), budget.available())
    }

    fn allocate_for_sources(&self, budget: &TokenBudget, names: &[String]) -> BudgetAllocation {
        distribute_for(
            self.active_ratios(),
            self.budget.default_share,
            budget.available(),
            names,
        )
    }
}
