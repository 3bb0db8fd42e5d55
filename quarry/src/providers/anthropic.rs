//! Anthropic messages API adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{call_cost, Completion, CompletionOptions, ModelProvider};
use crate::catalog::{self, ModelInfo, Vendor};
use crate::errors::ProviderError;
use crate::types::Usage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            timeout,
        }
    }

    fn map_status(&self, status: reqwest::StatusCode, body: &str, model: &str) -> ProviderError {
        match status.as_u16() {
            // 529 is Anthropic's "overloaded" answer; treat like a rate limit.
            429 | 529 => ProviderError::RateLimit {
                provider: "anthropic".to_string(),
            },
            401 | 403 => ProviderError::Authentication {
                provider: "anthropic".to_string(),
            },
            404 => ProviderError::ModelUnavailable {
                provider: "anthropic".to_string(),
                model: model.to_string(),
            },
            _ => ProviderError::Api {
                provider: "anthropic".to_string(),
                message: format!("{status}: {body}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn models(&self) -> Vec<&'static ModelInfo> {
        catalog::MODELS
            .iter()
            .filter(|m| m.vendor == Vendor::Anthropic)
            .collect()
    }

    #[tracing::instrument(skip(self, prompt), fields(provider = "anthropic", model = %options.model))]
    async fn generate_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        // The messages API has no JSON response format knob; the prompt
        // itself asks for a bare JSON object when needed.
        let mut content = prompt.to_string();
        if options.json_output {
            content.push_str("\n\nRespond with a single JSON object and nothing else.");
        }

        let body = json!({
            "model": options.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [{"role": "user", "content": content}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        provider: "anthropic".to_string(),
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

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "response contained no text blocks".to_string(),
            ));
        }

        let usage = Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cost: call_cost(
                &options.model,
                parsed.usage.input_tokens,
                parsed.usage.output_tokens,
            ),
        };

        Ok(Completion {
            content: text,
            usage,
        })
    }
}
