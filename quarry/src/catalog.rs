//! Static model metadata: pricing, context windows, vendor routing,
//! subscription-tier unlocks, the task matrix, and complexity buckets.
//!
//! All selection policy data lives here so `selector` stays pure logic.

use serde::{Deserialize, Serialize};

use crate::types::{SubscriptionTier, TaskType};

/// Which vendor adapter serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    /// Third-party models served through an OpenAI-compatible gateway.
    Gateway,
}

/// Static description of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: &'static str,
    pub vendor: Vendor,
    pub context_length: u32,
    /// Dollars per 1000 input tokens.
    pub input_cost_per_1k: f64,
    /// Dollars per 1000 output tokens.
    pub output_cost_per_1k: f64,
    pub supports_functions: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
}

pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        name: "gpt-4-turbo",
        vendor: Vendor::OpenAi,
        context_length: 128_000,
        input_cost_per_1k: 0.01,
        output_cost_per_1k: 0.03,
        supports_functions: true,
        supports_vision: true,
        supports_streaming: true,
    },
    ModelInfo {
        name: "gpt-4",
        vendor: Vendor::OpenAi,
        context_length: 8_192,
        input_cost_per_1k: 0.03,
        output_cost_per_1k: 0.06,
        supports_functions: true,
        supports_vision: false,
        supports_streaming: true,
    },
    ModelInfo {
        name: "gpt-3.5-turbo",
        vendor: Vendor::OpenAi,
        context_length: 16_385,
        input_cost_per_1k: 0.0005,
        output_cost_per_1k: 0.0015,
        supports_functions: true,
        supports_vision: false,
        supports_streaming: true,
    },
    ModelInfo {
        name: "claude-3-opus",
        vendor: Vendor::Anthropic,
        context_length: 200_000,
        input_cost_per_1k: 0.015,
        output_cost_per_1k: 0.075,
        supports_functions: false,
        supports_vision: true,
        supports_streaming: true,
    },
    ModelInfo {
        name: "claude-3-sonnet",
        vendor: Vendor::Anthropic,
        context_length: 200_000,
        input_cost_per_1k: 0.003,
        output_cost_per_1k: 0.015,
        supports_functions: false,
        supports_vision: true,
        supports_streaming: true,
    },
    ModelInfo {
        name: "claude-3-haiku",
        vendor: Vendor::Anthropic,
        context_length: 200_000,
        input_cost_per_1k: 0.00025,
        output_cost_per_1k: 0.00125,
        supports_functions: false,
        supports_vision: true,
        supports_streaming: true,
    },
    ModelInfo {
        name: "gemini-pro",
        vendor: Vendor::Gateway,
        context_length: 32_768,
        input_cost_per_1k: 0.00125,
        output_cost_per_1k: 0.00375,
        supports_functions: true,
        supports_vision: false,
        supports_streaming: true,
    },
    ModelInfo {
        name: "gemini-ultra",
        vendor: Vendor::Gateway,
        context_length: 32_768,
        input_cost_per_1k: 0.007,
        output_cost_per_1k: 0.021,
        supports_functions: true,
        supports_vision: true,
        supports_streaming: true,
    },
    ModelInfo {
        name: "command-r-plus",
        vendor: Vendor::Gateway,
        context_length: 128_000,
        input_cost_per_1k: 0.003,
        output_cost_per_1k: 0.015,
        supports_functions: true,
        supports_vision: false,
        supports_streaming: true,
    },
    ModelInfo {
        name: "mixtral-8x7b",
        vendor: Vendor::Gateway,
        context_length: 32_768,
        input_cost_per_1k: 0.0007,
        output_cost_per_1k: 0.0007,
        supports_functions: false,
        supports_vision: false,
        supports_streaming: false,
    },
    ModelInfo {
        name: "llama3-8b",
        vendor: Vendor::Gateway,
        context_length: 8_192,
        input_cost_per_1k: 0.0002,
        output_cost_per_1k: 0.0002,
        supports_functions: false,
        supports_vision: false,
        supports_streaming: false,
    },
    ModelInfo {
        name: "llama3-70b",
        vendor: Vendor::Gateway,
        context_length: 8_192,
        input_cost_per_1k: 0.0009,
        output_cost_per_1k: 0.0009,
        supports_functions: false,
        supports_vision: false,
        supports_streaming: false,
    },
];

pub fn model_info(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.name == name)
}

/// Vendor routing by model name. Unknown names fall back to the
/// OpenAI-compatible gateway, which serves most third-party models.
pub fn vendor_for_model(name: &str) -> Vendor {
    match model_info(name) {
        Some(info) => info.vendor,
        None if name.starts_with("claude") => Vendor::Anthropic,
        None if name.starts_with("gpt") => Vendor::OpenAi,
        None => Vendor::Gateway,
    }
}

/// Preferred models per task: one primary, ordered fallbacks.
pub struct TaskModels {
    pub primary: &'static str,
    pub fallbacks: &'static [&'static str],
}

pub fn task_models(task: TaskType) -> TaskModels {
    match task {
        TaskType::IntentAnalysis => TaskModels {
            primary: "claude-3-sonnet",
            fallbacks: &["gpt-4", "claude-3-haiku"],
        },
        TaskType::CodeGeneration => TaskModels {
            primary: "claude-3-opus",
            fallbacks: &["gpt-4-turbo", "claude-3-sonnet"],
        },
        TaskType::SqlGeneration => TaskModels {
            primary: "gpt-4",
            fallbacks: &["claude-3-sonnet", "gpt-3.5-turbo"],
        },
        TaskType::DataExploration => TaskModels {
            primary: "claude-3-sonnet",
            fallbacks: &["gpt-4", "gemini-pro"],
        },
        TaskType::ResultInterpretation => TaskModels {
            primary: "claude-3-opus",
            fallbacks: &["gpt-4", "claude-3-sonnet"],
        },
        TaskType::Visualization => TaskModels {
            primary: "gpt-4-turbo",
            fallbacks: &["claude-3-sonnet", "gemini-pro"],
        },
        TaskType::MachineLearning => TaskModels {
            primary: "claude-3-opus",
            fallbacks: &["gpt-4", "gemini-ultra"],
        },
    }
}

/// Models unlocked by each subscription tier.
pub fn tier_models(tier: SubscriptionTier) -> &'static [&'static str] {
    const FREE: &[&str] = &["gpt-3.5-turbo", "mixtral-8x7b", "llama3-8b"];
    const PROFESSIONAL: &[&str] = &[
        "gpt-3.5-turbo",
        "mixtral-8x7b",
        "llama3-8b",
        "gpt-4",
        "claude-3-sonnet",
        "llama3-70b",
    ];
    const FULL: &[&str] = &[
        "gpt-3.5-turbo",
        "mixtral-8x7b",
        "llama3-8b",
        "gpt-4",
        "gpt-4-turbo",
        "claude-3-sonnet",
        "claude-3-opus",
        "claude-3-haiku",
        "gemini-pro",
        "gemini-ultra",
        "command-r-plus",
        "llama3-70b",
    ];
    match tier {
        SubscriptionTier::Free => FREE,
        SubscriptionTier::Professional => PROFESSIONAL,
        SubscriptionTier::Enterprise | SubscriptionTier::Custom => FULL,
    }
}

/// Cost/quality buckets keyed by complexity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityBucket {
    Economical,
    Balanced,
    Powerful,
}

impl ComplexityBucket {
    /// Complexity 1-3 economical, 4-6 balanced, 7-10 powerful. Scores are
    /// clamped upstream, but anything above 6 lands in powerful anyway.
    pub fn for_score(score: u8) -> Self {
        match score {
            0..=3 => ComplexityBucket::Economical,
            4..=6 => ComplexityBucket::Balanced,
            _ => ComplexityBucket::Powerful,
        }
    }

    /// Ordered candidates for this bucket.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            ComplexityBucket::Economical => {
                &["gpt-3.5-turbo", "claude-3-haiku", "mixtral-8x7b", "llama3-8b"]
            }
            ComplexityBucket::Balanced => {
                &["claude-3-sonnet", "gpt-4", "gemini-pro", "llama3-70b"]
            }
            ComplexityBucket::Powerful => &[
                "claude-3-opus",
                "gpt-4-turbo",
                "gemini-ultra",
                "command-r-plus",
            ],
        }
    }

    /// When a bucket has no available model, fall through to the next
    /// cheaper one.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ComplexityBucket::Powerful => Some(ComplexityBucket::Balanced),
            ComplexityBucket::Balanced => Some(ComplexityBucket::Economical),
            ComplexityBucket::Economical => None,
        }
    }
}
