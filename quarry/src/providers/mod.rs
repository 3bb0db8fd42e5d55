//! AI model providers.
//!
//! `ModelProvider` is the seam between the pipeline and vendor APIs. The
//! concrete adapters speak HTTP via reqwest; `MockProvider` serves scripted
//! responses for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::catalog::{self, ModelInfo, Vendor};
use crate::errors::ProviderError;
use crate::types::Usage;

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the model to emit a single JSON object.
    pub json_output: bool,
}

impl CompletionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.3,
            max_tokens: 4096,
            json_output: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// A completed generation with its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// One AI vendor (or OpenAI-compatible gateway).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short vendor name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Models this provider serves.
    fn models(&self) -> Vec<&'static ModelInfo>;

    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError>;
}

/// Dollar cost of a call given the catalog's per-1k pricing. Models without
/// a catalog entry are billed at zero.
pub fn call_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match catalog::model_info(model) {
        Some(info) => {
            input_tokens as f64 / 1000.0 * info.input_cost_per_1k
                + output_tokens as f64 / 1000.0 * info.output_cost_per_1k
        }
        None => 0.0,
    }
}

/// Extract the first fenced code block from a model response, or the whole
/// response when the model skipped the fences.
pub fn extract_code(response: &str) -> String {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Skip a language tag on the fence line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim_end().to_string();
        }
        return body.trim_end().to_string();
    }
    trimmed.to_string()
}

/// Routes model names to vendor adapters.
#[derive(Clone)]
pub struct ProviderRegistry {
    openai: Arc<dyn ModelProvider>,
    anthropic: Arc<dyn ModelProvider>,
    gateway: Arc<dyn ModelProvider>,
}

impl ProviderRegistry {
    pub fn new(
        openai: Arc<dyn ModelProvider>,
        anthropic: Arc<dyn ModelProvider>,
        gateway: Arc<dyn ModelProvider>,
    ) -> Self {
        Self {
            openai,
            anthropic,
            gateway,
        }
    }

    /// A registry serving every model from one provider. Used in tests with
    /// a `MockProvider`.
    pub fn single(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            openai: provider.clone(),
            anthropic: provider.clone(),
            gateway: provider,
        }
    }

    pub fn for_model(&self, model: &str) -> Arc<dyn ModelProvider> {
        match catalog::vendor_for_model(model) {
            Vendor::OpenAi => self.openai.clone(),
            Vendor::Anthropic => self.anthropic.clone(),
            Vendor::Gateway => self.gateway.clone(),
        }
    }
}

/// A recorded call made against the mock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub model: String,
    pub json_output: bool,
}

/// Scripted provider for tests: responses are served FIFO, calls are
/// recorded for assertions.
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text completion with nominal usage.
    pub fn push_completion(&self, content: impl Into<String>) {
        self.responses.lock().push_back(Ok(Completion {
            content: content.into(),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                cost: 0.001,
            },
        }));
    }

    /// Queue a JSON completion.
    pub fn push_json(&self, value: serde_json::Value) {
        self.push_completion(value.to_string());
    }

    pub fn push_error(&self, error: ProviderError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn models(&self) -> Vec<&'static ModelInfo> {
        catalog::MODELS.iter().collect()
    }

    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        self.calls.lock().push(RecordedCall {
            prompt: prompt.to_string(),
            model: options.model.clone(),
            json_output: options.json_output,
        });

        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(ProviderError::Api {
                provider: "mock".to_string(),
                message: "no scripted response remaining".to_string(),
            })
        })
    }
}
