use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for an analysis request.
///
/// Uses a short, readable format like "qry_abc123yz" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    ///
    /// Takes the first 8 hex characters of the UUID and formats as "qry_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("qry_{}", &hex[..8])
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<RequestId> for Uuid {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A unique identifier for an execution step within a request's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = format!("{:032x}", self.0.as_u128());
        write!(f, "stp_{}", &hex[..8])
    }
}

/// Identifies a worker in the pool. Used when claiming pending requests so
/// concurrent workers never process the same request twice.
pub type WorkerId = Uuid;

/// Opaque identifiers owned by the surrounding platform.
pub type UserId = Uuid;
pub type OrgId = Uuid;
pub type DatasetId = Uuid;

/// The kind of AI work being requested, used to pick a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IntentAnalysis,
    CodeGeneration,
    SqlGeneration,
    DataExploration,
    ResultInterpretation,
    Visualization,
    MachineLearning,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::IntentAnalysis => "intent_analysis",
            TaskType::CodeGeneration => "code_generation",
            TaskType::SqlGeneration => "sql_generation",
            TaskType::DataExploration => "data_exploration",
            TaskType::ResultInterpretation => "result_interpretation",
            TaskType::Visualization => "visualization",
            TaskType::MachineLearning => "machine_learning",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of work a plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    DataExploration,
    DataCleaning,
    StatisticalAnalysis,
    Visualization,
    MachineLearning,
    FeatureEngineering,
    ModelEvaluation,
    CustomComputation,
}

impl StepType {
    /// Map a step type to the model-selection task it needs.
    pub fn task(&self) -> TaskType {
        match self {
            StepType::MachineLearning | StepType::ModelEvaluation => TaskType::MachineLearning,
            StepType::Visualization => TaskType::Visualization,
            StepType::DataExploration | StepType::DataCleaning | StepType::FeatureEngineering => {
                TaskType::DataExploration
            }
            StepType::StatisticalAnalysis | StepType::CustomComputation => {
                TaskType::CodeGeneration
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::DataExploration => "data_exploration",
            StepType::DataCleaning => "data_cleaning",
            StepType::StatisticalAnalysis => "statistical_analysis",
            StepType::Visualization => "visualization",
            StepType::MachineLearning => "machine_learning",
            StepType::FeatureEngineering => "feature_engineering",
            StepType::ModelEvaluation => "model_evaluation",
            StepType::CustomComputation => "custom_computation",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Languages the sandbox is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    R,
    Sql,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::R => "r",
            Language::Sql => "sql",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "r" => Ok(Language::R),
            "sql" => Ok(Language::Sql),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

/// Subscription tier of the requesting user. Gates which models are
/// available for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Professional,
    Enterprise,
    Custom,
}

/// How technical the requesting user is. Shapes the tone of the final
/// interpretation, not which models run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
    Expert,
}

impl TechnicalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechnicalLevel::Beginner => "beginner",
            TechnicalLevel::Intermediate => "intermediate",
            TechnicalLevel::Advanced => "advanced",
            TechnicalLevel::Expert => "expert",
        }
    }
}

/// Token counts and dollar cost accumulated across AI calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_short_format() {
        let id = RequestId::new();
        let short = id.to_short_string();
        assert!(short.starts_with("qry_"));
        assert_eq!(short.len(), 12);
    }

    #[test]
    fn step_type_maps_to_selection_task() {
        assert_eq!(StepType::MachineLearning.task(), TaskType::MachineLearning);
        assert_eq!(StepType::ModelEvaluation.task(), TaskType::MachineLearning);
        assert_eq!(StepType::Visualization.task(), TaskType::Visualization);
        assert_eq!(StepType::DataCleaning.task(), TaskType::DataExploration);
        assert_eq!(
            StepType::StatisticalAnalysis.task(),
            TaskType::CodeGeneration
        );
    }

    #[test]
    fn language_parses_case_insensitively() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("SQL".parse::<Language>().unwrap(), Language::Sql);
        assert!("julia".parse::<Language>().is_err());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 100,
            output_tokens: 50,
            cost: 0.01,
        });
        total.add(&Usage {
            input_tokens: 200,
            output_tokens: 100,
            cost: 0.02,
        });
        assert_eq!(total.input_tokens, 300);
        assert_eq!(total.output_tokens, 150);
        assert_eq!(total.total_tokens(), 450);
        assert!((total.cost - 0.03).abs() < 1e-9);
    }
}
