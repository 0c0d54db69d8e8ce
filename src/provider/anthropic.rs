//! Anthropic API Provider
//!
//! Completion provider using Anthropic's Messages API. The Messages API
//! takes system prompts as a top-level field rather than as messages, so
//! system messages are lifted out of the conversation before sending.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use super::{
    CompletionProvider, ProviderRequest, ProviderResponse, ProviderSettings, build_http_client,
    error_from_response, validate_base_url,
};
use crate::types::{
    ErrorCategory, ErrorClassifier, LexgateError, MessageRole, ProviderError, Result, TokenUsage,
};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";

/// Anthropic API provider with secure API key handling
pub struct AnthropicProvider {
    name: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let api_key_str = settings
            .api_key
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                LexgateError::Config(format!(
                    "API key for provider '{}' not found. Set ANTHROPIC_API_KEY env var or provide in config",
                    settings.name
                ))
            })?;

        let api_base = match settings.base_url {
            Some(url) => validate_base_url(&url)?,
            None => DEFAULT_API_BASE.to_string(),
        };

        let model = settings.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let client = build_http_client(settings.timeout_secs)?;

        Ok(Self {
            name: settings.name,
            api_key: SecretString::from(api_key_str),
            api_base,
            model,
            client,
        })
    }

    /// Split the conversation into the top-level system prompt and the
    /// user/assistant turns the Messages API expects.
    fn build_request(&self, request: &ProviderRequest) -> MessagesRequest {
        let mut system_parts: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();

        if request.json_mode {
            // No response_format equivalent; instruct via the system prompt
            system_parts.push("Respond only with a single valid JSON object.");
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            messages,
            system,
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let start_time = Instant::now();
        let body = self.build_request(request);
        let url = format!("{}/v1/messages", self.api_base);

        debug!(provider = %self.name, model = %body.model, "Sending request to Anthropic API");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, &self.name))?;

        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }

        let response_body: MessagesResponse = response.json().await.map_err(|e| {
            ProviderError::with_provider(
                ErrorCategory::Upstream,
                format!("Failed to parse Anthropic response: {}", e),
                &self.name,
            )
        })?;

        let usage = response_body
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        let content = response_body
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| {
                ProviderError::with_provider(
                    ErrorCategory::Upstream,
                    "No text content in Anthropic response",
                    &self.name,
                )
            })?;

        debug!(
            provider = %self.name,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            tokens = usage.total(),
            "Received response from Anthropic"
        );

        Ok(ProviderResponse {
            content,
            model: response_body.model.unwrap_or_else(|| body.model.clone()),
            usage,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> &'static str {
        "v1/messages"
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.api_base);

        let response = self
            .client
            .get(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(provider = %self.name, status = %resp.status(), "Anthropic API check failed");
                false
            }
            Err(e) => {
                warn!(provider = %self.name, error = %e, "Anthropic API check failed");
                false
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<ApiUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
