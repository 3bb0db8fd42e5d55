//! Analysis request lifecycle: the status enum, the central transition
//! table, and the request record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    DatasetId, OrgId, RequestId, SubscriptionTier, TaskType, TechnicalLevel, Usage, UserId,
    WorkerId,
};

mod step;

pub use step::{ExecutionStep, ResourceUsage, StepResult, StepStatus};

/// The lifecycle status of an analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Waiting to be picked up by a worker.
    Pending,
    /// Intent analysis in progress (also the claimed state).
    Analyzing,
    /// Requirements extraction, planning and per-step code generation.
    GeneratingCode,
    /// Plan steps running in the sandbox.
    Executing,
    /// Final interpretation of collected results.
    InterpretingResults,
    /// Finished with a result.
    Completed,
    /// Finished with an error, or canceled. Retryable.
    Failed,
    /// The query was too ambiguous; waiting on the user. Retryable.
    RequiresClarification,
}

impl AnalysisStatus {
    /// The complete set of legal transitions. Everything not listed here is
    /// rejected with `Error::StateTransition`.
    ///
    /// `Analyzing -> Completed` exists solely for the cache-hit fast path:
    /// a claimed request whose result is already cached completes without
    /// fabricating intermediate states.
    pub fn allowed_transitions(self) -> &'static [AnalysisStatus] {
        use AnalysisStatus::*;
        match self {
            Pending => &[Analyzing, RequiresClarification],
            Analyzing => &[GeneratingCode, Completed, Failed, RequiresClarification],
            GeneratingCode => &[Executing, Failed, RequiresClarification],
            Executing => &[InterpretingResults, Failed, RequiresClarification],
            InterpretingResults => &[Completed, Failed, RequiresClarification],
            Failed => &[Pending],
            RequiresClarification => &[Pending],
            Completed => &[],
        }
    }

    pub fn can_transition_to(self, to: AnalysisStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Completed is the only state with no outgoing transitions; failed and
    /// requires_clarification can be retried.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed
                | AnalysisStatus::Failed
                | AnalysisStatus::RequiresClarification
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Analyzing
                | AnalysisStatus::GeneratingCode
                | AnalysisStatus::Executing
                | AnalysisStatus::InterpretingResults
        )
    }

    /// Cancellation is only honored while the request can still be stopped
    /// cheaply, before sandbox execution begins.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Analyzing | AnalysisStatus::GeneratingCode
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Failed | AnalysisStatus::RequiresClarification
        )
    }

    /// Fixed status-to-percent mapping reported by `get_status`.
    pub fn progress_percent(self) -> u8 {
        match self {
            AnalysisStatus::Pending => 0,
            AnalysisStatus::Analyzing | AnalysisStatus::RequiresClarification => 20,
            AnalysisStatus::GeneratingCode => 40,
            AnalysisStatus::Executing => 60,
            AnalysisStatus::InterpretingResults => 80,
            AnalysisStatus::Completed | AnalysisStatus::Failed => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::GeneratingCode => "generating_code",
            AnalysisStatus::Executing => "executing",
            AnalysisStatus::InterpretingResults => "interpreting_results",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::RequiresClarification => "requires_clarification",
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked, and what they are entitled to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: UserId,
    pub org_id: OrgId,
    pub subscription_tier: SubscriptionTier,
    pub technical_level: TechnicalLevel,
}

/// Structured output of the intent-analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub main_objective: String,
    #[serde(default)]
    pub required_analysis_types: Vec<String>,
    #[serde(default)]
    pub identified_entities: Vec<String>,
    pub complexity_score: u8,
    #[serde(default)]
    pub estimated_steps: u32,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_needed: Option<String>,
    #[serde(default)]
    pub suggested_approach: Option<String>,
}

impl IntentAnalysis {
    /// Complexity is meaningful only in [1, 10]; model output outside that
    /// range is clamped rather than rejected.
    pub fn clamped_complexity(&self) -> u8 {
        self.complexity_score.clamp(1, 10)
    }
}

/// Structured output of the requirements stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataRequirements {
    #[serde(default)]
    pub tables_needed: Vec<String>,
    #[serde(default)]
    pub columns_needed: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<String>,
}

/// One model choice made during the pipeline, kept for audit and cost
/// accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub task: TaskType,
    pub model: String,
}

/// Condensed output of one completed step, embedded in the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub sequence: u32,
    pub step_type: crate::types::StepType,
    pub description: String,
    pub stdout: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// The final payload of a completed analysis. Serialized as-is into the
/// result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub interpretation: String,
    pub step_outputs: Vec<StepOutput>,
    /// Tabular data extracted from step outputs, when present. The cache
    /// reads `data.rows` to pick an expiration tier.
    #[serde(default)]
    pub data: serde_json::Value,
    pub models_used: Vec<String>,
    pub total_cost: f64,
    pub execution_time_ms: u64,
}

/// An analysis request as stored. All mutation goes through the orchestrator
/// and storage layer, which validate transitions against
/// `AnalysisStatus::allowed_transitions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: RequestId,
    pub query: String,
    pub dataset_id: DatasetId,
    pub status: AnalysisStatus,
    pub requester: Requester,
    pub preferred_model: Option<String>,
    /// Per-call cost ceiling applied during model selection.
    pub max_cost: Option<f64>,
    pub skip_cache: bool,
    pub intent: Option<IntentAnalysis>,
    pub requirements: Option<DataRequirements>,
    pub final_result: Option<FinalResult>,
    pub error_message: Option<String>,
    /// Accumulated across every AI call, preserved on failure and retry.
    pub usage: Usage,
    pub model_selections: Vec<ModelSelection>,
    pub served_from_cache: bool,
    pub claimed_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_execution_time_ms: Option<u64>,
}

impl AnalysisRequest {
    pub fn new(query: String, dataset_id: DatasetId, requester: Requester) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            query,
            dataset_id,
            status: AnalysisStatus::Pending,
            requester,
            preferred_model: None,
            max_cost: None,
            skip_cache: false,
            intent: None,
            requirements: None,
            final_result: None,
            error_message: None,
            usage: Usage::default(),
            model_selections: Vec::new(),
            served_from_cache: false,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            total_execution_time_ms: None,
        }
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    pub fn record_selection(&mut self, task: TaskType, model: &str) {
        self.model_selections.push(ModelSelection {
            task,
            model: model.to_string(),
        });
    }

    /// Rough completion estimate shown to users: 30 seconds per complexity
    /// point, 60 seconds before intent analysis has run.
    pub fn estimated_completion_secs(&self) -> u64 {
        match &self.intent {
            Some(intent) => 30 * intent.clamped_complexity() as u64,
            None => 60,
        }
    }
}
