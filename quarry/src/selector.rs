//! Model selection policy.
//!
//! Order of preference: the user's preferred model, then the task's primary,
//! then its fallbacks, then the cheapest available model. Selection never
//! fails: when nothing survives the entitlement and cost filters, the
//! configured baseline model is returned.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{self, ComplexityBucket};
use crate::types::{SubscriptionTier, TaskType};

pub const DEFAULT_BASELINE_MODEL: &str = "gpt-3.5-turbo";

/// Token volume assumed when estimating cost before a call is made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Default for TokenEstimate {
    fn default() -> Self {
        Self {
            input_tokens: 1000,
            output_tokens: 2000,
        }
    }
}

/// Pre-call cost estimate for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub model: String,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Everything that constrains which models may be picked for a request.
#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    pub tier: SubscriptionTier,
    /// Organization allow-list. Empty means unrestricted.
    pub org_allowed_models: Vec<String>,
    pub preferred_model: Option<String>,
    /// Per-call cost ceiling in dollars; models whose estimate exceeds it
    /// are excluded.
    pub max_cost: Option<f64>,
    pub token_estimate: TokenEstimate,
}

impl SelectionConstraints {
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        Self {
            tier,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    baseline: String,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(DEFAULT_BASELINE_MODEL.to_string())
    }
}

impl ModelSelector {
    pub fn new(baseline: String) -> Self {
        Self { baseline }
    }

    /// Pick a model for a task. Never fails.
    pub fn select_for_task(&self, task: TaskType, constraints: &SelectionConstraints) -> String {
        if let Some(preferred) = &constraints.preferred_model {
            if self.usable(preferred, constraints) {
                debug!(%task, model = %preferred, "using preferred model");
                return preferred.clone();
            }
        }

        let matrix = catalog::task_models(task);
        if self.usable(matrix.primary, constraints) {
            return matrix.primary.to_string();
        }
        for fallback in matrix.fallbacks {
            if self.usable(fallback, constraints) {
                debug!(%task, model = %fallback, "primary unavailable, using fallback");
                return fallback.to_string();
            }
        }

        self.cheapest_available(constraints).unwrap_or_else(|| {
            debug!(%task, baseline = %self.baseline, "no model available, using baseline");
            self.baseline.clone()
        })
    }

    /// Pick a model by complexity score (1-10). Buckets fall through to
    /// cheaper tiers when empty. Never fails.
    pub fn select_for_complexity(
        &self,
        score: u8,
        constraints: &SelectionConstraints,
    ) -> String {
        let mut bucket = Some(ComplexityBucket::for_score(score));
        while let Some(current) = bucket {
            for candidate in current.candidates() {
                if self.usable(candidate, constraints) {
                    return candidate.to_string();
                }
            }
            bucket = current.downgrade();
        }

        self.cheapest_available(constraints)
            .unwrap_or_else(|| self.baseline.clone())
    }

    /// Estimated cost for running the given token volume through a model.
    /// Unknown models have no price entry.
    pub fn estimate_cost(&self, model: &str, estimate: TokenEstimate) -> Option<CostEstimate> {
        let info = catalog::model_info(model)?;
        let input_cost = estimate.input_tokens as f64 / 1000.0 * info.input_cost_per_1k;
        let output_cost = estimate.output_tokens as f64 / 1000.0 * info.output_cost_per_1k;
        Some(CostEstimate {
            model: model.to_string(),
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        })
    }

    /// Models the requester may use: tier unlocks intersected with the org
    /// allow-list (empty allow-list = unrestricted).
    pub fn available_models(&self, constraints: &SelectionConstraints) -> Vec<&'static str> {
        catalog::tier_models(constraints.tier)
            .iter()
            .copied()
            .filter(|m| {
                constraints.org_allowed_models.is_empty()
                    || constraints.org_allowed_models.iter().any(|a| a == m)
            })
            .collect()
    }

    fn usable(&self, model: &str, constraints: &SelectionConstraints) -> bool {
        self.available_models(constraints).contains(&model) && self.within_budget(model, constraints)
    }

    fn within_budget(&self, model: &str, constraints: &SelectionConstraints) -> bool {
        match constraints.max_cost {
            None => true,
            Some(ceiling) => match self.estimate_cost(model, constraints.token_estimate) {
                Some(estimate) => estimate.total_cost <= ceiling,
                None => false,
            },
        }
    }

    fn cheapest_available(&self, constraints: &SelectionConstraints) -> Option<String> {
        self.available_models(constraints)
            .into_iter()
            .filter(|m| self.within_budget(m, constraints))
            .filter_map(|m| self.estimate_cost(m, constraints.token_estimate))
            .min_by(|a, b| a.total_cost.total_cmp(&b.total_cost))
            .map(|e| e.model)
    }
}
