//! OpenAI-compatible chat completions adapter. Also used for third-party
//! models served through an OpenAI-compatible gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{call_cost, Completion, CompletionOptions, ModelProvider};
use crate::catalog::{self, ModelInfo, Vendor};
use crate::errors::ProviderError;
use crate::types::Usage;

pub struct OpenAiProvider {
    name: &'static str,
    vendor: Vendor,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Self {
        Self::with_vendor("openai", Vendor::OpenAi, base_url, api_key, timeout)
    }

    /// An OpenAI-compatible gateway serving third-party models.
    pub fn gateway(base_url: String, api_key: String, timeout: Duration) -> Self {
        Self::with_vendor("gateway", Vendor::Gateway, base_url, api_key, timeout)
    }

    fn with_vendor(
        name: &'static str,
        vendor: Vendor,
        base_url: String,
        api_key: String,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            vendor,
            client: reqwest::Client::new(),
            base_url,
            api_key,
            timeout,
        }
    }

    fn map_status(&self, status: reqwest::StatusCode, body: &str, model: &str) -> ProviderError {
        match status.as_u16() {
            429 => ProviderError::RateLimit {
                provider: self.name.to_string(),
            },
            401 | 403 => ProviderError::Authentication {
                provider: self.name.to_string(),
            },
            404 => ProviderError::ModelUnavailable {
                provider: self.name.to_string(),
                model: model.to_string(),
            },
            _ => ProviderError::Api {
                provider: self.name.to_string(),
                message: format!("{status}: {body}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn models(&self) -> Vec<&'static ModelInfo> {
        catalog::MODELS
            .iter()
            .filter(|m| m.vendor == self.vendor)
            .collect()
    }

    #[tracing::instrument(skip(self, prompt), fields(provider = self.name, model = %options.model))]
    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        let mut body = json!({
            "model": options.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if options.json_output {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        provider: self.name.to_string(),
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_status(status, &body, &options.model));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("response contained no choices".to_string())
            })?;

        let usage = Usage {
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            cost: call_cost(
                &options.model,
                parsed.usage.prompt_tokens,
                parsed.usage.completion_tokens,
            ),
        };

        Ok(Completion { content, usage })
    }
}
