//! End-to-end pipeline tests against scripted providers and sandbox.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use quarry::connectors::{ColumnSchema, Dataset, DatasetRegistry, SchemaDoc, StaticConnector, TableSchema};
use quarry::errors::{Error, ProviderError};
use quarry::notify::{AnalysisEvent, RecordingNotifier};
use quarry::orchestrator::{AnalysisOrchestrator, OrgPolicy, PipelineConfig, SubmitAnalysis};
use quarry::providers::{MockProvider, ProviderRegistry};
use quarry::request::Requester;
use quarry::sandbox::MockSandbox;
use quarry::selector::ModelSelector;
use quarry::storage::{InMemoryStorage, Storage};
use quarry::types::{SubscriptionTier, TaskType, TechnicalLevel};
use quarry::worker::{WorkerConfig, WorkerPool};
use quarry::{AnalysisStatus, CacheConfig, ResultCache, StepStatus};

struct Harness {
    orchestrator: Arc<AnalysisOrchestrator<InMemoryStorage>>,
    storage: Arc<InMemoryStorage>,
    provider: Arc<MockProvider>,
    sandbox: Arc<MockSandbox>,
    notifier: Arc<RecordingNotifier>,
    dataset: Dataset,
}

fn harness() -> Harness {
    harness_with(PipelineConfig::default(), CacheConfig::default())
}

fn harness_with(pipeline: PipelineConfig, cache: CacheConfig) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let provider = Arc::new(MockProvider::new());
    let sandbox = Arc::new(MockSandbox::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let dataset = Dataset {
        id: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        name: "orders".to_string(),
        description: "E-commerce order history".to_string(),
        location: "/srv/datasets/orders.parquet".to_string(),
        row_count: Some(250_000),
    };

    let connector = Arc::new(StaticConnector::new());
    connector.set_schema(
        dataset.id,
        SchemaDoc {
            tables: vec![TableSchema {
                name: "orders".to_string(),
                columns: vec![ColumnSchema {
                    name: "total".to_string(),
                    data_type: "numeric".to_string(),
                    description: None,
                }],
            }],
        },
    );
    let datasets = Arc::new(DatasetRegistry::new(connector));
    datasets.register(dataset.clone());

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        storage.clone(),
        ProviderRegistry::single(provider.clone()),
        ModelSelector::default(),
        sandbox.clone(),
        Arc::new(ResultCache::new(cache)),
        datasets,
        notifier.clone(),
        pipeline,
    ));

    Harness {
        orchestrator,
        storage,
        provider,
        sandbox,
        notifier,
        dataset,
    }
}

fn requester() -> Requester {
    Requester {
        user_id: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        subscription_tier: SubscriptionTier::Enterprise,
        technical_level: TechnicalLevel::Intermediate,
    }
}

fn submission(h: &Harness) -> SubmitAnalysis {
    SubmitAnalysis {
        query: "Show average order value by month for 2024".to_string(),
        dataset_id: h.dataset.id,
        requester: requester(),
        preferred_model: None,
        max_cost: None,
        skip_cache: false,
    }
}

fn intent_json(complexity: u8) -> serde_json::Value {
    json!({
        "query_type": "exploratory",
        "main_objective": "Average order value by month",
        "required_analysis_types": ["aggregation"],
        "identified_entities": ["orders.total"],
        "complexity_score": complexity,
        "estimated_steps": 2,
        "needs_clarification": false,
        "clarification_needed": null,
        "suggested_approach": "Group by month and average"
    })
}

fn requirements_json() -> serde_json::Value {
    json!({
        "tables_needed": ["orders"],
        "columns_needed": ["orders.total", "orders.created_at"],
        "filters": ["created_at in 2024"],
        "aggregations": ["avg(total) by month"]
    })
}

fn plan_json(step_count: usize) -> serde_json::Value {
    let steps: Vec<_> = (0..step_count)
        .map(|i| {
            json!({
                "step_type": "data_exploration",
                "language": "python",
                "description": format!("Analysis step {i}")
            })
        })
        .collect();
    json!({ "steps": steps })
}

/// Queue a full happy-path script: intent, requirements, plan, one code
/// generation and sandbox success per step, and the interpretation.
fn script_happy_path(h: &Harness, step_count: usize) {
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(step_count));
    for i in 0..step_count {
        h.provider.push_completion(format!(
            "```python\nimport pandas as pd\nprint('step {i}')\n```"
        ));
        h.sandbox
            .push_success(format!(r#"{{"rows": [{{"month": "2024-0{}", "avg": 42.5}}]}}"#, i + 1));
    }
    h.provider
        .push_completion("Average order value held steady around $42.");
}

#[test_log::test(tokio::test)]
async fn happy_path_completes_with_result_usage_and_notification() {
    let h = harness();
    script_happy_path(&h, 2);

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Completed);

    let stored = h.storage.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, AnalysisStatus::Completed);
    assert!(!stored.served_from_cache);
    assert!(stored.completed_at.is_some());

    let result = stored.final_result.expect("completed requires a result");
    assert_eq!(result.interpretation, "Average order value held steady around $42.");
    assert_eq!(result.step_outputs.len(), 2);
    assert!(result.total_cost > 0.0);

    // 2 steps -> 6 AI calls (intent, requirements, plan, 2 codegen,
    // interpretation), each 100 in / 50 out.
    assert_eq!(h.provider.call_count(), 6);
    assert_eq!(stored.usage.input_tokens, 600);
    assert_eq!(stored.usage.output_tokens, 300);

    // Steps ran strictly in order and completed.
    let steps = h.storage.steps_for_request(request.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(steps.iter().all(|s| s.started_at.is_some()));
    assert_eq!(h.sandbox.run_count(), 2);

    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].1, AnalysisEvent::Completed { .. }));
}

#[test_log::test(tokio::test)]
async fn selection_records_accumulate_in_stage_order() {
    let h = harness();
    script_happy_path(&h, 1);

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    h.orchestrator.run(request.id).await.unwrap();

    let stored = h.storage.get_request(request.id).await.unwrap();
    let tasks: Vec<TaskType> = stored.model_selections.iter().map(|s| s.task).collect();
    assert_eq!(
        tasks,
        vec![
            TaskType::IntentAnalysis,
            TaskType::DataExploration,
            TaskType::CodeGeneration,
            TaskType::DataExploration,
            TaskType::ResultInterpretation,
        ]
    );
    // Enterprise tier, defaults from the task matrix.
    assert_eq!(stored.model_selections[0].model, "claude-3-sonnet");
    assert_eq!(stored.model_selections[4].model, "claude-3-opus");
}

#[test_log::test(tokio::test)]
async fn clarification_parks_the_request_and_retry_requeues() {
    let h = harness();
    let mut ambiguous = intent_json(3);
    ambiguous["needs_clarification"] = json!(true);
    ambiguous["clarification_needed"] = json!("Which year do you mean?");
    h.provider.push_json(ambiguous);

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::RequiresClarification);

    let stored = h.storage.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, AnalysisStatus::RequiresClarification);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Which year do you mean?")
    );
    // Clarification is not a failure: no failure notification.
    assert!(h.notifier.events().is_empty());

    // Retry re-queues and a clean run completes.
    let requeued = h.orchestrator.retry(request.id).await.unwrap();
    assert_eq!(requeued.status, AnalysisStatus::Pending);
    script_happy_path(&h, 1);
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Completed);
}

#[test_log::test(tokio::test)]
async fn step_failure_fails_fast_and_preserves_usage() {
    let h = harness();
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(2));
    h.provider
        .push_completion("```python\nprint('boom')\n```");
    h.sandbox.push_failure(1, "Traceback: division by zero");
    // The second step's code generation is never requested.

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Failed);

    let stored = h.storage.get_request(request.id).await.unwrap();
    let message = stored.error_message.clone().unwrap();
    assert!(message.starts_with("executing plan: step 1:"), "{message}");

    // Fail fast: one sandbox run, 4 AI calls, second step untouched.
    assert_eq!(h.sandbox.run_count(), 1);
    assert_eq!(h.provider.call_count(), 4);
    let steps = h.storage.steps_for_request(request.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[1].status, StepStatus::Pending);

    // Usage from the calls that did happen is preserved.
    assert_eq!(stored.usage.input_tokens, 400);
    assert!(stored.usage.cost > 0.0);

    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].1, AnalysisEvent::Failed { .. }));
}

#[test_log::test(tokio::test)]
async fn failure_in_a_later_step_names_that_step_in_the_error() {
    let h = harness();
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(2));
    h.provider
        .push_completion("```python\nprint('step 1 ok')\n```");
    h.sandbox.push_success(r#"{"rows": [{"n": 1}]}"#);
    // The second step's code is rejected by the validator.
    h.provider
        .push_completion("```python\nimport subprocess\nsubprocess.run(['curl', 'evil'])\n```");

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Failed);

    let stored = h.storage.get_request(request.id).await.unwrap();
    let message = stored.error_message.clone().unwrap();
    assert!(message.contains("step 2"), "{message}");
    assert!(message.starts_with("executing plan: step 2:"), "{message}");

    let steps = h.storage.steps_for_request(request.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(h.sandbox.run_count(), 1);
}

#[test_log::test(tokio::test)]
async fn sandbox_timeout_marks_the_step_timed_out() {
    let h = harness();
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(1));
    h.provider.push_completion("```python\nwhile True: pass\n```");
    h.sandbox.push_timeout(60);

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Failed);

    let steps = h.storage.steps_for_request(request.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Timeout);
}

#[test_log::test(tokio::test)]
async fn hostile_generated_code_never_reaches_the_sandbox() {
    let h = harness();
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(1));
    h.provider
        .push_completion("```python\nimport subprocess\nsubprocess.run(['curl', 'evil'])\n```");

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Failed);

    assert_eq!(h.sandbox.run_count(), 0);
    let steps = h.storage.steps_for_request(request.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("validation"));
}

#[test_log::test(tokio::test)]
async fn provider_rate_limit_fails_the_request_with_provider_error() {
    let h = harness();
    h.provider.push_error(ProviderError::RateLimit {
        provider: "anthropic".to_string(),
    });

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Failed);

    let stored = h.storage.get_request(request.id).await.unwrap();
    let message = stored.error_message.unwrap();
    assert!(message.starts_with("intent analysis:"), "{message}");
    assert!(message.contains("rate limited"));
}

#[test_log::test(tokio::test)]
async fn identical_query_is_served_from_cache_without_ai_calls() {
    let h = harness();
    script_happy_path(&h, 1);

    let first = h.orchestrator.submit(submission(&h)).await.unwrap();
    h.orchestrator.run(first.id).await.unwrap();
    let calls_after_first = h.provider.call_count();
    let runs_after_first = h.sandbox.run_count();

    // Same question, different case and whitespace, same dataset.
    let mut second_submission = submission(&h);
    second_submission.query = "  show AVERAGE order value BY month for 2024 ".to_string();
    // Requester must share the organization for statistics to line up, but
    // the cache key only involves query and dataset.
    second_submission.requester = first.requester.clone();

    let second = h.orchestrator.submit(second_submission).await.unwrap();
    let status = h.orchestrator.run(second.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Completed);

    let stored = h.storage.get_request(second.id).await.unwrap();
    assert!(stored.served_from_cache);
    assert_eq!(
        stored.final_result.unwrap().interpretation,
        "Average order value held steady around $42."
    );
    assert_eq!(h.provider.call_count(), calls_after_first);
    assert_eq!(h.sandbox.run_count(), runs_after_first);

    let stats = h.orchestrator.cache_statistics(first.requester.org_id);
    assert_eq!(stats.total_entries, 1);
    assert!(stats.hit_rate.unwrap() > 0.0);
}

#[test_log::test(tokio::test)]
async fn skip_cache_and_invalidation_force_recomputation() {
    let h = harness();
    script_happy_path(&h, 1);

    let first = h.orchestrator.submit(submission(&h)).await.unwrap();
    h.orchestrator.run(first.id).await.unwrap();

    // skip_cache bypasses the lookup.
    script_happy_path(&h, 1);
    let mut skip = submission(&h);
    skip.skip_cache = true;
    skip.requester = first.requester.clone();
    let second = h.orchestrator.submit(skip).await.unwrap();
    h.orchestrator.run(second.id).await.unwrap();
    let stored = h.storage.get_request(second.id).await.unwrap();
    assert!(!stored.served_from_cache);

    // Invalidating the dataset forces the next run to recompute too.
    assert!(h.orchestrator.invalidate_dataset_cache(h.dataset.id) > 0);
    script_happy_path(&h, 1);
    let mut third_submission = submission(&h);
    third_submission.requester = first.requester.clone();
    let third = h.orchestrator.submit(third_submission).await.unwrap();
    h.orchestrator.run(third.id).await.unwrap();
    let stored = h.storage.get_request(third.id).await.unwrap();
    assert!(!stored.served_from_cache);
}

#[test_log::test(tokio::test)]
async fn oversized_results_are_not_cached_but_still_complete() {
    let h = harness_with(
        PipelineConfig::default(),
        CacheConfig {
            max_entry_bytes: 256,
            ..CacheConfig::default()
        },
    );
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(1));
    h.provider.push_completion("```python\nprint('x')\n```");
    h.sandbox
        .push_success(format!(r#"{{"rows": ["{}"]}}"#, "x".repeat(400)));
    h.provider.push_completion("Big output.");

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Completed);

    let stats = h.orchestrator.cache_statistics(request.requester.org_id);
    assert_eq!(stats.total_entries, 0);
}

#[test_log::test(tokio::test)]
async fn org_policy_restricts_models_and_disables_cache() {
    let h = harness();
    let req = requester();
    h.orchestrator.set_org_policy(
        req.org_id,
        OrgPolicy {
            allowed_models: vec!["gpt-3.5-turbo".to_string()],
            cache_disabled: true,
        },
    );

    script_happy_path(&h, 1);
    let mut s = submission(&h);
    s.requester = req.clone();
    let request = h.orchestrator.submit(s).await.unwrap();
    h.orchestrator.run(request.id).await.unwrap();

    let stored = h.storage.get_request(request.id).await.unwrap();
    // Every selection collapsed onto the only permitted model.
    assert!(stored
        .model_selections
        .iter()
        .all(|s| s.model == "gpt-3.5-turbo"));

    // Nothing cached for this organization.
    let stats = h.orchestrator.cache_statistics(req.org_id);
    assert_eq!(stats.total_entries, 0);
}

#[test_log::test(tokio::test)]
async fn submit_validates_query_length() {
    let h = harness();

    let mut short = submission(&h);
    short.query = "too short".to_string();
    assert!(matches!(
        h.orchestrator.submit(short).await,
        Err(Error::Validation(_))
    ));

    let mut long = submission(&h);
    long.query = "x".repeat(5001);
    assert!(matches!(
        h.orchestrator.submit(long).await,
        Err(Error::Validation(_))
    ));

    let mut unknown_dataset = submission(&h);
    unknown_dataset.dataset_id = Uuid::new_v4();
    assert!(matches!(
        h.orchestrator.submit(unknown_dataset).await,
        Err(Error::DatasetNotFound(_))
    ));
}

#[test_log::test(tokio::test)]
async fn cancel_is_honored_only_while_cancelable() {
    let h = harness();
    let request = h.orchestrator.submit(submission(&h)).await.unwrap();

    // Pending requests cannot be canceled.
    assert!(matches!(
        h.orchestrator.cancel(request.id).await,
        Err(Error::StateTransition { .. })
    ));

    // Claimed (analyzing) requests can.
    let claimed = h.storage.claim_pending(1, Uuid::new_v4()).await.unwrap();
    assert_eq!(claimed[0].id, request.id);
    h.orchestrator.cancel(request.id).await.unwrap();

    let stored = h.storage.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, AnalysisStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("canceled by user"));

    // A canceled request cannot be canceled again, but can be retried.
    assert!(h.orchestrator.cancel(request.id).await.is_err());
    let requeued = h.orchestrator.retry(request.id).await.unwrap();
    assert_eq!(requeued.status, AnalysisStatus::Pending);
    assert!(requeued.error_message.is_none());
}

#[test_log::test(tokio::test)]
async fn retry_clears_steps_but_keeps_usage() {
    let h = harness();
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(1));
    h.provider.push_completion("```python\nprint(1)\n```");
    h.sandbox.push_failure(2, "out of memory");

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    h.orchestrator.run(request.id).await.unwrap();

    let failed = h.storage.get_request(request.id).await.unwrap();
    assert_eq!(failed.status, AnalysisStatus::Failed);
    let usage_before = failed.usage;
    assert!(usage_before.input_tokens > 0);
    assert!(!h.storage.steps_for_request(request.id).await.unwrap().is_empty());

    let requeued = h.orchestrator.retry(request.id).await.unwrap();
    assert_eq!(requeued.status, AnalysisStatus::Pending);
    assert!(h.storage.steps_for_request(request.id).await.unwrap().is_empty());
    assert_eq!(requeued.usage, usage_before);

    // Completed requests are not retryable.
    script_happy_path(&h, 1);
    h.orchestrator.run(request.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.retry(request.id).await,
        Err(Error::StateTransition { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn status_report_tracks_progress_and_steps() {
    let h = harness();
    let request = h.orchestrator.submit(submission(&h)).await.unwrap();

    let report = h.orchestrator.get_status(request.id).await.unwrap();
    assert_eq!(report.status, AnalysisStatus::Pending);
    assert_eq!(report.progress_percent, 0);
    assert!(report.steps.is_empty());

    script_happy_path(&h, 2);
    h.orchestrator.run(request.id).await.unwrap();

    let report = h.orchestrator.get_status(request.id).await.unwrap();
    assert_eq!(report.status, AnalysisStatus::Completed);
    assert_eq!(report.progress_percent, 100);
    assert_eq!(report.steps.len(), 2);
    assert!(report.current_step.is_none());
    assert!(report.steps[0].output_preview.is_some());
}

#[test_log::test(tokio::test)]
async fn plan_larger_than_the_cap_is_truncated() {
    let h = harness_with(
        PipelineConfig {
            max_plan_steps: 2,
            ..PipelineConfig::default()
        },
        CacheConfig::default(),
    );
    h.provider.push_json(intent_json(4));
    h.provider.push_json(requirements_json());
    h.provider.push_json(plan_json(5));
    for _ in 0..2 {
        h.provider.push_completion("```python\nprint(1)\n```");
        h.sandbox.push_success(r#"{"rows": []}"#);
    }
    h.provider.push_completion("Done.");

    let request = h.orchestrator.submit(submission(&h)).await.unwrap();
    let status = h.orchestrator.run(request.id).await.unwrap();
    assert_eq!(status, AnalysisStatus::Completed);
    assert_eq!(
        h.storage.steps_for_request(request.id).await.unwrap().len(),
        2
    );
}

#[test_log::test(tokio::test)]
async fn worker_pool_drives_queued_requests_to_terminal_states() {
    let h = harness();
    // Two identical happy-path scripts; concurrency 1 keeps the FIFO
    // scripts aligned with the runs.
    script_happy_path(&h, 1);
    script_happy_path(&h, 1);

    let first = h.orchestrator.submit(submission(&h)).await.unwrap();
    let mut other = submission(&h);
    other.query = "Which product category grew fastest last quarter?".to_string();
    let second = h.orchestrator.submit(other).await.unwrap();

    let pool = Arc::new(WorkerPool::new(
        h.orchestrator.clone(),
        WorkerConfig {
            claim_batch_size: 1,
            max_concurrent_requests: 1,
            claim_interval: std::time::Duration::from_millis(20),
            status_log_interval: None,
            cache_sweep_interval: std::time::Duration::from_secs(3600),
        },
    ));
    let handle = pool.clone().spawn();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let a = h.storage.get_request(first.id).await.unwrap().status;
        let b = h.storage.get_request(second.id).await.unwrap().status;
        if a == AnalysisStatus::Completed && b == AnalysisStatus::Completed {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "requests did not complete in time: {a}, {b}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // The in-flight counter drops when the request task fully unwinds,
    // which can lag the status write by a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.abort();
    assert_eq!(pool.in_flight(), 0);
}
