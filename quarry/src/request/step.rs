//! Execution steps: the units of a plan, run strictly in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Language, RequestId, StepId, StepType};

/// The lifecycle of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Generating,
    Validating,
    Executing,
    Completed,
    Failed,
    Timeout,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Generating => "generating",
            StepStatus::Validating => "validating",
            StepStatus::Executing => "executing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource accounting reported by the sandbox for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
    pub execution_time_ms: u64,
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub stdout: String,
    /// True when stdout exceeded the sandbox output cap and was cut.
    pub truncated: bool,
    /// Structured data parsed from stdout when it was valid JSON, otherwise
    /// Null.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// One step of an analysis plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: StepId,
    pub request_id: RequestId,
    /// Position in the plan; steps run strictly in ascending order.
    pub sequence: u32,
    pub step_type: StepType,
    pub language: Language,
    pub description: String,
    pub code: Option<String>,
    pub status: StepStatus,
    pub result: Option<StepResult>,
    pub error_message: Option<String>,
    pub resource_usage: Option<ResourceUsage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    pub fn new(
        request_id: RequestId,
        sequence: u32,
        step_type: StepType,
        language: Language,
        description: String,
    ) -> Self {
        Self {
            id: StepId::new(),
            request_id,
            sequence,
            step_type,
            language,
            description,
            code: None,
            status: StepStatus::Pending,
            result: None,
            error_message: None,
            resource_usage: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Marks the step as actively executing. `started_at` is always set
    /// before the sandbox is invoked.
    pub fn mark_executing(&mut self) {
        self.status = StepStatus::Executing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: StepResult, usage: ResourceUsage) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.resource_usage = Some(usage);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error_message = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self, error: String) {
        self.status = StepStatus::Timeout;
        self.error_message = Some(error);
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step() -> ExecutionStep {
        ExecutionStep::new(
            RequestId::new(),
            0,
            StepType::DataExploration,
            Language::Python,
            "Profile the dataset".to_string(),
        )
    }

    #[test]
    fn executing_sets_started_at() {
        let mut step = sample_step();
        assert!(step.started_at.is_none());
        step.mark_executing();
        assert_eq!(step.status, StepStatus::Executing);
        assert!(step.started_at.is_some());
    }

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Timeout.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Executing.is_terminal());
    }

    #[test]
    fn completion_records_result_and_usage() {
        let mut step = sample_step();
        step.mark_executing();
        step.mark_completed(
            StepResult {
                stdout: r#"{"rows": []}"#.to_string(),
                truncated: false,
                data: serde_json::json!({"rows": []}),
                artifacts: vec!["histogram.png".to_string()],
            },
            ResourceUsage {
                cpu_time_ms: 120,
                memory_mb: 64,
                execution_time_ms: 340,
            },
        );
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.duration().is_some());
        assert_eq!(step.result.as_ref().unwrap().artifacts.len(), 1);
    }
}
