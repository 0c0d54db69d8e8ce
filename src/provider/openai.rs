//! OpenAI API Provider
//!
//! Completion provider using OpenAI's Chat Completions API.
//! Returns ProviderResponse with token usage metrics for cost tracking.

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
    ErrorCategory, ErrorClassifier, LexgateError, ProviderError, Result, TokenUsage,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

/// OpenAI API provider with secure API key handling
pub struct OpenAiProvider {
    name: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let api_key_str = settings
            .api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                LexgateError::Config(format!(
                    "API key for provider '{}' not found. Set OPENAI_API_KEY env var or provide in config",
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

    fn build_request(&self, request: &ProviderRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: Some(request.max_tokens),
            response_format: request.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let start_time = Instant::now();
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.api_base);

        debug!(provider = %self.name, model = %body.model, "Sending request to OpenAI API");

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, &self.name))?;

        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }

        let response_body: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::with_provider(
                ErrorCategory::Upstream,
                format!("Failed to parse OpenAI response: {}", e),
                &self.name,
            )
        })?;

        let usage = response_body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let content = response_body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::with_provider(
                    ErrorCategory::Upstream,
                    "No content in OpenAI response",
                    &self.name,
                )
            })?;

        debug!(
            provider = %self.name,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            tokens = usage.total(),
            "Received response from OpenAI"
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
        "chat/completions"
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.api_base);

        let response = self
            .client
            .get(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(provider = %self.name, status = %resp.status(), "OpenAI API check failed");
                false
            }
            Err(e) => {
                warn!(provider = %self.name, error = %e, "OpenAI API check failed");
                false
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use crate::types::{Message, MessageRole};

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(ProviderSettings {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            model: Some("gpt-4o".to_string()),
            api_key: Some("sk-test".to_string()),
            base_url: None,
            timeout_secs: 30,
        })
        .expect("provider")
    }

    fn request(json_mode: bool) -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                Message::new(MessageRole::System, "Be terse."),
                Message::new(MessageRole::User, "Summarize this clause."),
            ],
            temperature: 0.0,
            max_tokens: 4096,
            json_mode,
        }
    }

    #[test]
    fn test_build_request_shape() {
        let body = provider().build_request(&request(false));
        let value = serde_json::to_value(&body).expect("serialize");

        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "Summarize this clause.");
        assert_eq!(value["max_tokens"], 4096);
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn test_json_mode_sets_response_format() {
        let body = provider().build_request(&request(true));
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "Done."}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).expect("parse");

        assert_eq!(parsed.model.as_deref(), Some("gpt-4o-2024-08-06"));
        let usage = parsed.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Done.")
        );
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_custom_base_url_is_validated() {
        let bad = OpenAiProvider::new(ProviderSettings {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            model: None,
            api_key: Some("sk-test".to_string()),
            base_url: Some("file:///etc/passwd".to_string()),
            timeout_secs: 30,
        });
        assert!(bad.is_err());
    }
}
