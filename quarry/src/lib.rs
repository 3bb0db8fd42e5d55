//! Orchestration core for natural-language data analysis.
//!
//! A submitted question is decomposed into a plan, executed as generated
//! code in an isolated sandbox, interpreted, and cached per
//! (query, dataset). See `AnalysisOrchestrator` for the entry points and
//! `WorkerPool` for background processing.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connectors;
pub mod errors;
pub mod notify;
pub mod orchestrator;
pub mod providers;
pub mod request;
pub mod sandbox;
pub mod selector;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod validator;
pub mod worker;

pub use cache::{CacheConfig, CacheStatistics, ResultCache};
pub use errors::{CacheError, Error, ProviderError, Result, SandboxError};
pub use orchestrator::{
    AnalysisOrchestrator, OrgPolicy, PipelineConfig, StatusReport, SubmitAnalysis,
};
pub use request::{AnalysisRequest, AnalysisStatus, ExecutionStep, StepStatus};
pub use selector::{ModelSelector, SelectionConstraints};
pub use storage::{InMemoryStorage, Storage};
pub use types::{Language, RequestId, StepType, SubscriptionTier, TaskType, TechnicalLevel};
pub use worker::{WorkerConfig, WorkerPool};
