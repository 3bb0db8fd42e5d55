use crate::request::AnalysisStatus;
use crate::types::{DatasetId, RequestId};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the orchestration pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input rejected before any work started (bad query length, unknown
    /// dataset, malformed plan, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The query is too ambiguous to analyze; the user must refine it.
    /// Non-fatal: the request parks in `requires_clarification`.
    #[error("clarification needed: {0}")]
    ClarificationNeeded(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// A pipeline stage failed. Wraps the underlying error with the stage
    /// name so `error_message` reads "stage: cause".
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A plan step failed. Wraps the underlying error with the step's
    /// 1-based position so `error_message` names the failing step.
    #[error("step {step}: {source}")]
    Step {
        step: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("request {id} cannot move from {from} to {to}")]
    StateTransition {
        id: RequestId,
        from: AnalysisStatus,
        to: AnalysisStatus,
    },

    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("dataset not found: {0}")]
    DatasetNotFound(DatasetId),

    #[error("request {0} was canceled")]
    Canceled(RequestId),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Tag this error with the pipeline stage it came from. Cancellations
    /// and clarification requests pass through untagged: they are outcomes,
    /// not stage failures.
    pub fn with_stage(self, stage: &'static str) -> Error {
        match self {
            Error::Canceled(_) | Error::ClarificationNeeded(_) | Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Tag this error with the 1-based plan step it came from. Same
    /// pass-through rules as `with_stage`.
    pub fn with_step(self, step: u32) -> Error {
        match self {
            Error::Canceled(_)
            | Error::ClarificationNeeded(_)
            | Error::Stage { .. }
            | Error::Step { .. } => self,
            other => Error::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// A message safe to show to end users, without leaking internal
    /// implementation details.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::ClarificationNeeded(msg) => msg.clone(),
            Error::Provider(e) => e.user_message(),
            Error::Sandbox(e) => e.user_message(),
            Error::Stage { source, .. } => source.user_message(),
            Error::Step { step, source } => format!("Step {step}: {}", source.user_message()),
            Error::StateTransition { from, .. } => {
                format!("Cannot perform this action while the analysis is {from}")
            }
            Error::RequestNotFound(_) => "Analysis request not found".to_string(),
            Error::DatasetNotFound(_) => "Dataset not found".to_string(),
            Error::Canceled(_) => "Analysis was canceled".to_string(),
            Error::Json(_) | Error::Internal(_) => {
                "An internal error occurred. Please try again.".to_string()
            }
        }
    }

    /// Clarification requests are surfaced as a status, not a failure.
    pub fn is_clarification(&self) -> bool {
        matches!(self, Error::ClarificationNeeded(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }
}

/// Errors from AI model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by {provider}")]
    RateLimit { provider: String },

    #[error("authentication failed for {provider}")]
    Authentication { provider: String },

    #[error("provider {provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("model {model} is not available on {provider}")]
    ModelUnavailable { provider: String, model: String },

    #[error("provider {provider} returned an error: {message}")]
    Api { provider: String, message: String },

    #[error("provider returned malformed output: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::RateLimit { .. } => {
                "The AI service is busy. Please try again shortly.".to_string()
            }
            ProviderError::Authentication { .. } => {
                "The AI service rejected our credentials.".to_string()
            }
            ProviderError::Timeout { .. } => "The AI service took too long to respond.".to_string(),
            ProviderError::ModelUnavailable { model, .. } => {
                format!("The model {model} is currently unavailable.")
            }
            ProviderError::Api { .. }
            | ProviderError::MalformedResponse(_)
            | ProviderError::Http(_)
            | ProviderError::Json(_) => "The AI service returned an error.".to_string(),
        }
    }
}

/// Errors from sandboxed code execution.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("execution exceeded resource limits: {0}")]
    ResourceExceeded(String),

    #[error("execution failed with exit code {exit_code}: {stderr}")]
    Runtime { exit_code: i32, stderr: String },

    #[error("failed to start sandbox: {0}")]
    Spawn(String),
}

impl SandboxError {
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::Timeout { seconds } => {
                format!("The analysis step ran longer than {seconds} seconds and was stopped.")
            }
            SandboxError::ResourceExceeded(_) => {
                "The analysis step used too many resources and was stopped.".to_string()
            }
            SandboxError::Runtime { .. } => "The generated code failed to run.".to_string(),
            SandboxError::Spawn(_) => "The execution environment is unavailable.".to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout { .. })
    }
}

/// Cache failures are logged and swallowed at the orchestrator boundary; a
/// broken cache must never fail an analysis. Kept as a separate type so it
/// cannot leak into `Error` via `?`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("result too large to cache: {size} bytes (cap {cap})")]
    EntryTooLarge { size: usize, cap: usize },

    #[error("result not cacheable: {0}")]
    NotCacheable(String),

    #[error("failed to serialize cache payload: {0}")]
    Serialization(#[from] serde_json::Error),
}
