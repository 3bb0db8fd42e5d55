//! The analysis orchestrator: submission, the five-stage pipeline,
//! cancellation, retry, and status reporting.
//!
//! Stage order is fixed: intent -> requirements -> plan -> execution ->
//! interpretation. Any stage error fails the whole request (fail fast, no
//! partial results); a clarification request parks it instead. Usage and
//! model-selection records are persisted after every AI call, so cost
//! accounting survives failures.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStatistics, ResultCache};
use crate::connectors::DatasetRegistry;
use crate::errors::{Error, Result};
use crate::notify::{AnalysisEvent, Notifier};
use crate::providers::{extract_code, CompletionOptions, ProviderRegistry};
use crate::request::{
    AnalysisRequest, AnalysisStatus, DataRequirements, ExecutionStep, FinalResult, IntentAnalysis,
    Requester, StepOutput, StepStatus,
};
use crate::sandbox::{SandboxExecutor, SandboxRun};
use crate::selector::{ModelSelector, SelectionConstraints};
use crate::storage::Storage;
use crate::types::{DatasetId, Language, OrgId, RequestId, StepType, TaskType};
use crate::validator::CodeValidator;

mod prompts;

/// Sample rows handed to the requirements prompt.
const SAMPLE_ROW_LIMIT: usize = 5;

/// Tunables for the pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub min_query_chars: usize,
    pub max_query_chars: usize,
    pub max_plan_steps: usize,
    /// Wall-clock budget for one sandbox execution.
    #[serde(with = "humantime_serde")]
    pub step_timeout: std::time::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_query_chars: 10,
            max_query_chars: 5000,
            max_plan_steps: 10,
            step_timeout: std::time::Duration::from_secs(60),
        }
    }
}

/// Per-organization policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgPolicy {
    /// Model allow-list. Empty means unrestricted.
    pub allowed_models: Vec<String>,
    /// Set false to bypass the result cache for this organization.
    pub cache_disabled: bool,
}

/// A new analysis submission.
#[derive(Debug, Clone)]
pub struct SubmitAnalysis {
    pub query: String,
    pub dataset_id: DatasetId,
    pub requester: Requester,
    pub preferred_model: Option<String>,
    pub max_cost: Option<f64>,
    pub skip_cache: bool,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub request_id: RequestId,
    pub status: AnalysisStatus,
    pub progress_percent: u8,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub estimated_completion_secs: u64,
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub sequence: u32,
    pub step_type: StepType,
    pub status: StepStatus,
    pub description: String,
    /// First 500 characters of stdout, when the step produced any.
    pub output_preview: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanSpec {
    steps: Vec<PlanStepSpec>,
}

#[derive(Debug, Deserialize)]
struct PlanStepSpec {
    step_type: StepType,
    language: Language,
    description: String,
}

pub struct AnalysisOrchestrator<S: Storage> {
    storage: Arc<S>,
    providers: ProviderRegistry,
    selector: ModelSelector,
    sandbox: Arc<dyn SandboxExecutor>,
    cache: Arc<ResultCache>,
    datasets: Arc<DatasetRegistry>,
    notifier: Arc<dyn Notifier>,
    validator: CodeValidator,
    config: PipelineConfig,
    org_policies: DashMap<OrgId, OrgPolicy>,
}

impl<S: Storage> AnalysisOrchestrator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<S>,
        providers: ProviderRegistry,
        selector: ModelSelector,
        sandbox: Arc<dyn SandboxExecutor>,
        cache: Arc<ResultCache>,
        datasets: Arc<DatasetRegistry>,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            providers,
            selector,
            sandbox,
            cache,
            datasets,
            notifier,
            validator: CodeValidator::new(),
            config,
            org_policies: DashMap::new(),
        }
    }

    pub fn set_org_policy(&self, org_id: OrgId, policy: OrgPolicy) {
        self.org_policies.insert(org_id, policy);
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Validate and persist a new request in `pending`.
    #[instrument(skip(self, submission), fields(dataset_id = %submission.dataset_id))]
    pub async fn submit(&self, submission: SubmitAnalysis) -> Result<AnalysisRequest> {
        let query_chars = submission.query.trim().chars().count();
        if query_chars < self.config.min_query_chars {
            return Err(Error::Validation(format!(
                "query must be at least {} characters",
                self.config.min_query_chars
            )));
        }
        if query_chars > self.config.max_query_chars {
            return Err(Error::Validation(format!(
                "query must be at most {} characters",
                self.config.max_query_chars
            )));
        }
        // The dataset must exist before we accept work against it.
        self.datasets.get(submission.dataset_id)?;

        let mut request = AnalysisRequest::new(
            submission.query,
            submission.dataset_id,
            submission.requester,
        );
        request.preferred_model = submission.preferred_model;
        request.max_cost = submission.max_cost;
        request.skip_cache = submission.skip_cache;

        self.storage.insert_request(request.clone()).await?;
        info!(request_id = %request.id, "analysis request submitted");
        Ok(request)
    }

    /// Run the full pipeline for a request in `pending` (or already claimed
    /// in `analyzing`). Stage failures are recorded on the request and
    /// returned as the final status; only infrastructure errors propagate.
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn run(&self, id: RequestId) -> Result<AnalysisStatus> {
        let mut request = self.storage.get_request(id).await?;
        match request.status {
            AnalysisStatus::Pending => {
                request = self.storage.transition(id, AnalysisStatus::Analyzing).await?;
            }
            AnalysisStatus::Analyzing => {}
            other => {
                return Err(Error::StateTransition {
                    id,
                    from: other,
                    to: AnalysisStatus::Analyzing,
                });
            }
        }

        // The cache is consulted exactly once, before any AI call.
        if self.cache_enabled_for(&request) {
            if let Some(payload) =
                self.cache
                    .lookup(&request.query, request.dataset_id, request.requester.org_id)
            {
                match serde_json::from_value::<FinalResult>(payload) {
                    Ok(result) => return self.complete_from_cache(request, result).await,
                    Err(e) => {
                        warn!(request_id = %id, error = %e, "discarding undecodable cache entry")
                    }
                }
            }
        }

        match self.run_pipeline(&mut request).await {
            Ok(()) => {
                self.notifier
                    .notify(
                        request.requester.user_id,
                        AnalysisEvent::completed(request.id, &request.query),
                    )
                    .await;
                Ok(AnalysisStatus::Completed)
            }
            Err(e) if e.is_canceled() => {
                // A cancel landed mid-run; the stored record already says
                // failed and must not be overwritten.
                info!(request_id = %id, "run stopped by cancellation");
                Ok(AnalysisStatus::Failed)
            }
            Err(e) if e.is_clarification() => {
                self.park_for_clarification(&mut request, &e).await?;
                Ok(AnalysisStatus::RequiresClarification)
            }
            Err(e) => {
                self.record_failure(&mut request, &e).await?;
                self.notifier
                    .notify(
                        request.requester.user_id,
                        AnalysisEvent::failed(request.id, &request.query, &e.user_message()),
                    )
                    .await;
                Ok(AnalysisStatus::Failed)
            }
        }
    }

    /// Cancel a request. Honored only while it is analyzing or generating
    /// code.
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        let request = self.storage.get_request(id).await?;
        if !request.status.is_cancelable() {
            return Err(Error::StateTransition {
                id,
                from: request.status,
                to: AnalysisStatus::Failed,
            });
        }

        let mut updated = self.storage.transition(id, AnalysisStatus::Failed).await?;
        updated.error_message = Some("canceled by user".to_string());
        self.storage.update_request(&updated).await?;
        info!(request_id = %id, "analysis canceled");
        Ok(())
    }

    /// Re-queue a failed or clarification-parked request. Steps and the old
    /// error are cleared; accumulated usage is kept for accounting.
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn retry(&self, id: RequestId) -> Result<AnalysisRequest> {
        let request = self.storage.get_request(id).await?;
        if !request.status.is_retryable() {
            return Err(Error::StateTransition {
                id,
                from: request.status,
                to: AnalysisStatus::Pending,
            });
        }

        self.storage.delete_steps(id).await?;
        let mut updated = self.storage.transition(id, AnalysisStatus::Pending).await?;
        updated.error_message = None;
        updated.final_result = None;
        updated.served_from_cache = false;
        updated.claimed_by = None;
        updated.completed_at = None;
        updated.total_execution_time_ms = None;
        self.storage.update_request(&updated).await?;
        info!(request_id = %id, "analysis re-queued");
        Ok(updated)
    }

    pub async fn get_status(&self, id: RequestId) -> Result<StatusReport> {
        let request = self.storage.get_request(id).await?;
        let steps = self.storage.steps_for_request(id).await?;

        let current_step = steps
            .iter()
            .find(|s| !s.status.is_terminal())
            .map(|s| s.description.clone());

        let summaries = steps
            .into_iter()
            .map(|s| {
                let preview = s
                    .result
                    .as_ref()
                    .map(|r| r.stdout.chars().take(500).collect::<String>());
                StepSummary {
                    sequence: s.sequence,
                    step_type: s.step_type,
                    status: s.status,
                    description: s.description,
                    output_preview: preview,
                }
            })
            .collect();

        Ok(StatusReport {
            request_id: id,
            status: request.status,
            progress_percent: request.status.progress_percent(),
            current_step,
            error_message: request.error_message.clone(),
            estimated_completion_secs: request.estimated_completion_secs(),
            steps: summaries,
        })
    }

    pub fn invalidate_dataset_cache(&self, dataset_id: DatasetId) -> usize {
        self.cache.invalidate_dataset(dataset_id)
    }

    pub fn cache_statistics(&self, org_id: OrgId) -> CacheStatistics {
        self.cache.statistics(org_id)
    }

    /// Delete expired cache entries. Called by the worker pool on a timer.
    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep()
    }

    // ---- pipeline stages ----

    async fn run_pipeline(&self, request: &mut AnalysisRequest) -> Result<()> {
        let started = Instant::now();
        let constraints = self.constraints_for(request);
        let dataset = self.datasets.get(request.dataset_id)?;

        // Stage 1: intent analysis.
        let intent = self
            .analyze_intent(request, &dataset, &constraints)
            .await
            .map_err(|e| e.with_stage("intent analysis"))?;
        if intent.needs_clarification {
            let question = intent
                .clarification_needed
                .clone()
                .unwrap_or_else(|| "The question is ambiguous; please refine it.".to_string());
            return Err(Error::ClarificationNeeded(question));
        }

        self.advance(request, AnalysisStatus::GeneratingCode).await?;

        // Stage 2: data requirements.
        let schema = self.datasets.schema(request.dataset_id).await?;
        let schema_text = schema.render();
        let sample_rows = self
            .datasets
            .sample(request.dataset_id, SAMPLE_ROW_LIMIT)
            .await?;
        self.extract_requirements(request, &constraints, &schema_text, &sample_rows)
            .await
            .map_err(|e| e.with_stage("requirements analysis"))?;

        // Stage 3: plan.
        let steps = self
            .build_plan(request, &constraints)
            .await
            .map_err(|e| e.with_stage("planning"))?;

        self.advance(request, AnalysisStatus::Executing).await?;

        // Stage 4: sequential execution, fail fast.
        let mounts = self.datasets.mounts(request.dataset_id)?;
        let mut outputs: Vec<StepOutput> = Vec::with_capacity(steps.len());
        for mut step in steps {
            self.ensure_active(request.id).await?;
            let output = self
                .execute_step(request, &mut step, &schema_text, &constraints, &mounts, &outputs)
                .await
                .map_err(|e| e.with_step(step.sequence + 1).with_stage("executing plan"))?;
            outputs.push(output);
        }

        self.advance(request, AnalysisStatus::InterpretingResults)
            .await?;

        // Stage 5: interpretation.
        let interpretation = self
            .interpret_results(request, &constraints, &outputs)
            .await
            .map_err(|e| e.with_stage("interpreting results"))?;

        // Assemble and persist the final result. The newest step that
        // printed structured output supplies the tabular data.
        let data = outputs
            .iter()
            .rev()
            .find_map(|o| {
                let parsed = structured_output(o);
                (!parsed.is_null()).then_some(parsed)
            })
            .unwrap_or(serde_json::Value::Null);

        let mut models_used: Vec<String> = Vec::new();
        for selection in &request.model_selections {
            if !models_used.contains(&selection.model) {
                models_used.push(selection.model.clone());
            }
        }

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let result = FinalResult {
            interpretation,
            step_outputs: outputs,
            data,
            models_used,
            total_cost: request.usage.cost,
            execution_time_ms,
        };

        request.final_result = Some(result.clone());
        request.total_execution_time_ms = Some(execution_time_ms);
        request.completed_at = Some(Utc::now());
        request.status = AnalysisStatus::Completed;
        self.checkpoint(request).await?;

        // Best effort: a cache failure never fails the analysis.
        if self.cache_enabled_for(request) {
            match serde_json::to_value(&result) {
                Ok(payload) => {
                    if let Err(e) = self.cache.store(
                        &request.query,
                        request.dataset_id,
                        request.requester.org_id,
                        &payload,
                    ) {
                        warn!(request_id = %request.id, error = %e, "failed to cache result");
                    }
                }
                Err(e) => warn!(request_id = %request.id, error = %e, "failed to serialize result for cache"),
            }
        }

        info!(request_id = %request.id, execution_time_ms, "analysis completed");
        Ok(())
    }

    async fn analyze_intent(
        &self,
        request: &mut AnalysisRequest,
        dataset: &crate::connectors::Dataset,
        constraints: &SelectionConstraints,
    ) -> Result<IntentAnalysis> {
        let model = self
            .selector
            .select_for_task(TaskType::IntentAnalysis, constraints);
        request.record_selection(TaskType::IntentAnalysis, &model);

        let prompt = prompts::intent_prompt(&request.query, dataset);
        let options = CompletionOptions::new(&model).json().with_temperature(0.3);
        let completion = self
            .providers
            .for_model(&model)
            .generate_completion(&prompt, &options)
            .await?;
        request.record_usage(&completion.usage);

        let mut intent: IntentAnalysis = parse_json(&completion.content)?;
        intent.complexity_score = intent.clamped_complexity();
        request.intent = Some(intent.clone());
        self.checkpoint(request).await?;
        debug!(request_id = %request.id, complexity = intent.complexity_score, "intent analyzed");
        Ok(intent)
    }

    async fn extract_requirements(
        &self,
        request: &mut AnalysisRequest,
        constraints: &SelectionConstraints,
        schema_text: &str,
        sample_rows: &[serde_json::Value],
    ) -> Result<DataRequirements> {
        let model = self
            .selector
            .select_for_task(TaskType::DataExploration, constraints);
        request.record_selection(TaskType::DataExploration, &model);

        let intent = request
            .intent
            .clone()
            .ok_or_else(|| Error::Validation("requirements stage ran before intent".to_string()))?;
        let prompt = prompts::requirements_prompt(&request.query, &intent, schema_text, sample_rows);
        let options = CompletionOptions::new(&model).json().with_temperature(0.3);
        let completion = self
            .providers
            .for_model(&model)
            .generate_completion(&prompt, &options)
            .await?;
        request.record_usage(&completion.usage);

        let requirements: DataRequirements = parse_json(&completion.content)?;
        request.requirements = Some(requirements.clone());
        self.checkpoint(request).await?;
        Ok(requirements)
    }

    async fn build_plan(
        &self,
        request: &mut AnalysisRequest,
        constraints: &SelectionConstraints,
    ) -> Result<Vec<ExecutionStep>> {
        let intent = request
            .intent
            .clone()
            .ok_or_else(|| Error::Validation("planning stage ran before intent".to_string()))?;
        let requirements = request.requirements.clone().unwrap_or_default();

        let model = self
            .selector
            .select_for_complexity(intent.clamped_complexity(), constraints);
        request.record_selection(TaskType::CodeGeneration, &model);

        let prompt = prompts::plan_prompt(
            &request.query,
            &intent,
            &requirements,
            self.config.max_plan_steps,
        );
        let options = CompletionOptions::new(&model).json().with_temperature(0.5);
        let completion = self
            .providers
            .for_model(&model)
            .generate_completion(&prompt, &options)
            .await?;
        request.record_usage(&completion.usage);
        self.checkpoint(request).await?;

        let mut spec: PlanSpec = parse_json(&completion.content)?;
        if spec.steps.is_empty() {
            return Err(Error::Validation("plan contained no steps".to_string()));
        }
        if spec.steps.len() > self.config.max_plan_steps {
            warn!(
                request_id = %request.id,
                planned = spec.steps.len(),
                cap = self.config.max_plan_steps,
                "plan exceeds step cap, truncating"
            );
            spec.steps.truncate(self.config.max_plan_steps);
        }

        let mut steps = Vec::with_capacity(spec.steps.len());
        for (sequence, step_spec) in spec.steps.into_iter().enumerate() {
            let step = ExecutionStep::new(
                request.id,
                sequence as u32,
                step_spec.step_type,
                step_spec.language,
                step_spec.description,
            );
            self.storage.insert_step(step.clone()).await?;
            steps.push(step);
        }
        debug!(request_id = %request.id, steps = steps.len(), "plan created");
        Ok(steps)
    }

    async fn execute_step(
        &self,
        request: &mut AnalysisRequest,
        step: &mut ExecutionStep,
        schema_text: &str,
        constraints: &SelectionConstraints,
        mounts: &std::collections::HashMap<String, String>,
        prior_outputs: &[StepOutput],
    ) -> Result<StepOutput> {
        let task = step.step_type.task();
        let model = self.selector.select_for_task(task, constraints);
        request.record_selection(task, &model);

        // Generate.
        step.status = StepStatus::Generating;
        self.storage.update_step(step).await?;

        let prompt = prompts::code_prompt(
            &step.description,
            step.language,
            &request.query,
            schema_text,
            prior_outputs,
        );
        let options = CompletionOptions::new(&model).with_temperature(0.2);
        let completion = match self
            .providers
            .for_model(&model)
            .generate_completion(&prompt, &options)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                step.mark_failed(format!("code generation failed: {e}"));
                self.storage.update_step(step).await?;
                return Err(e.into());
            }
        };
        request.record_usage(&completion.usage);
        self.checkpoint(request).await?;

        let code = extract_code(&completion.content);
        step.code = Some(code.clone());

        // Validate.
        step.status = StepStatus::Validating;
        self.storage.update_step(step).await?;
        if let Err(violations) = self.validator.validate(&code, step.language) {
            let message = format!("code validation failed: {}", violations.join(", "));
            step.mark_failed(message.clone());
            self.storage.update_step(step).await?;
            return Err(Error::Validation(message));
        }

        // Execute.
        step.mark_executing();
        self.storage.update_step(step).await?;

        let run = SandboxRun {
            language: step.language,
            code,
            datasets: mounts.clone(),
            timeout: self.config.step_timeout,
        };

        match self.sandbox.run_code(&run).await {
            Ok(outcome) if outcome.succeeded() => {
                let data =
                    serde_json::from_str(&outcome.stdout).unwrap_or(serde_json::Value::Null);
                let result = crate::request::StepResult {
                    stdout: outcome.stdout.clone(),
                    truncated: outcome.truncated,
                    data,
                    artifacts: outcome.artifacts.clone(),
                };
                step.mark_completed(result, outcome.usage);
                self.storage.update_step(step).await?;
                Ok(StepOutput {
                    sequence: step.sequence,
                    step_type: step.step_type,
                    description: step.description.clone(),
                    stdout: outcome.stdout,
                    artifacts: outcome.artifacts,
                })
            }
            Ok(outcome) => {
                let stderr: String = outcome.stderr.chars().take(500).collect();
                step.mark_failed(format!("exit code {}: {stderr}", outcome.exit_code));
                self.storage.update_step(step).await?;
                Err(Error::Sandbox(crate::errors::SandboxError::Runtime {
                    exit_code: outcome.exit_code,
                    stderr,
                }))
            }
            Err(e) if e.is_timeout() => {
                step.mark_timed_out(e.to_string());
                self.storage.update_step(step).await?;
                Err(e.into())
            }
            Err(e) => {
                step.mark_failed(e.to_string());
                self.storage.update_step(step).await?;
                Err(e.into())
            }
        }
    }

    async fn interpret_results(
        &self,
        request: &mut AnalysisRequest,
        constraints: &SelectionConstraints,
        outputs: &[StepOutput],
    ) -> Result<String> {
        let model = self
            .selector
            .select_for_task(TaskType::ResultInterpretation, constraints);
        request.record_selection(TaskType::ResultInterpretation, &model);

        let prompt = prompts::interpretation_prompt(
            &request.query,
            outputs,
            request.requester.technical_level,
        );
        let options = CompletionOptions::new(&model).with_temperature(0.5);
        let completion = self
            .providers
            .for_model(&model)
            .generate_completion(&prompt, &options)
            .await?;
        request.record_usage(&completion.usage);
        self.checkpoint(request).await?;
        Ok(completion.content)
    }

    // ---- helpers ----

    async fn complete_from_cache(
        &self,
        mut request: AnalysisRequest,
        result: FinalResult,
    ) -> Result<AnalysisStatus> {
        request.final_result = Some(result);
        request.served_from_cache = true;
        request.completed_at = Some(Utc::now());
        request.status = AnalysisStatus::Completed;
        self.storage.update_request(&request).await?;

        info!(request_id = %request.id, "served from cache");
        self.notifier
            .notify(
                request.requester.user_id,
                AnalysisEvent::completed(request.id, &request.query),
            )
            .await;
        Ok(AnalysisStatus::Completed)
    }

    async fn park_for_clarification(
        &self,
        request: &mut AnalysisRequest,
        error: &Error,
    ) -> Result<()> {
        request.status = AnalysisStatus::RequiresClarification;
        request.error_message = Some(error.user_message());
        self.storage.update_request(request).await?;
        info!(request_id = %request.id, "parked for clarification");
        Ok(())
    }

    async fn record_failure(&self, request: &mut AnalysisRequest, error: &Error) -> Result<()> {
        warn!(request_id = %request.id, error = %error, "analysis failed");
        request.status = AnalysisStatus::Failed;
        request.error_message = Some(error.to_string());
        match self.storage.update_request(request).await {
            Ok(()) => Ok(()),
            // A cancel already moved the request to failed; its record wins.
            Err(Error::StateTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Persist the request, detecting a concurrent cancellation: when the
    /// stored status no longer accepts ours, the run stops.
    async fn checkpoint(&self, request: &AnalysisRequest) -> Result<()> {
        match self.storage.update_request(request).await {
            Ok(()) => Ok(()),
            Err(Error::StateTransition { .. }) => Err(Error::Canceled(request.id)),
            Err(e) => Err(e),
        }
    }

    /// Move to the next stage status, both locally and in storage.
    async fn advance(&self, request: &mut AnalysisRequest, to: AnalysisStatus) -> Result<()> {
        request.status = to;
        self.checkpoint(request).await
    }

    /// Observed between sandbox executions so a cancel lands at the next
    /// step boundary.
    async fn ensure_active(&self, id: RequestId) -> Result<()> {
        let current = self.storage.get_request(id).await?;
        if current.status.is_in_progress() {
            Ok(())
        } else {
            Err(Error::Canceled(id))
        }
    }

    fn constraints_for(&self, request: &AnalysisRequest) -> SelectionConstraints {
        let org_allowed = self
            .org_policies
            .get(&request.requester.org_id)
            .map(|p| p.allowed_models.clone())
            .unwrap_or_default();
        SelectionConstraints {
            tier: request.requester.subscription_tier,
            org_allowed_models: org_allowed,
            preferred_model: request.preferred_model.clone(),
            max_cost: request.max_cost,
            token_estimate: Default::default(),
        }
    }

    fn cache_enabled_for(&self, request: &AnalysisRequest) -> bool {
        if !self.cache.enabled() || request.skip_cache {
            return false;
        }
        !self
            .org_policies
            .get(&request.requester.org_id)
            .map(|p| p.cache_disabled)
            .unwrap_or(false)
    }
}

/// Parsed stdout of one step when it was valid JSON, Null otherwise.
fn structured_output(output: &StepOutput) -> serde_json::Value {
    serde_json::from_str(&output.stdout).unwrap_or(serde_json::Value::Null)
}

/// Parse a JSON object out of a model response, tolerating prose or fences
/// around it.
fn parse_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    if let Ok(value) = serde_json::from_str::<T>(content) {
        return Ok(value);
    }
    let start = content.find('{');
    let end = content.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            return Ok(serde_json::from_str(&content[start..=end])?);
        }
    }
    Err(Error::Provider(
        crate::errors::ProviderError::MalformedResponse(format!(
            "expected a JSON object, got: {}",
            content.chars().take(120).collect::<String>()
        )),
    ))
}
