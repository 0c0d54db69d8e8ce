//! Completion Provider Abstraction
//!
//! Defines the CompletionProvider trait the gateway routes through. All
//! providers speak the same request/response vocabulary and report errors
//! as classified `ProviderError`s so retry and failover decisions work the
//! same way regardless of which API is behind them.
//!
//! ## Modules
//!
//! - `openai`: OpenAI Chat Completions API client
//! - `anthropic`: Anthropic Messages API client

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::network as network_constants;
use crate::types::{
    ErrorClassifier, LexgateError, Message, ProviderError, Result, TokenUsage,
};

// =============================================================================
// Wire Types
// =============================================================================

/// A fully resolved request ready to send upstream: model chosen, defaults
/// applied, reliability concerns already handled by the caller.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub json_mode: bool,
}

/// A completed upstream response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    /// Model the provider reports having used
    pub model: String,
    pub usage: TokenUsage,
}

/// Shared provider type for concurrent access across the gateway.
pub type SharedProvider = Arc<dyn CompletionProvider + Send + Sync>;

// =============================================================================
// Provider Trait
// =============================================================================

/// A completion API the gateway can route to.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Execute one completion attempt.
    ///
    /// Errors must be classified so the caller can decide between retrying,
    /// failing over, and giving up.
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Instance name used for routing, health samples, and usage records.
    fn name(&self) -> &str;

    /// Model used when a request does not name one.
    fn model(&self) -> &str;

    /// API path label for usage records.
    fn endpoint(&self) -> &'static str;

    /// Probe whether the provider currently answers at all.
    async fn health_check(&self) -> bool;
}

// =============================================================================
// Provider Configuration
// =============================================================================

/// Which API dialect a configured provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for one provider instance.
///
/// Note: API keys are handled securely - they are never serialized to output
/// and are redacted in debug output. Each provider converts the key to
/// SecretString internally for runtime protection.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Instance name requests and config refer to
    pub name: String,
    /// API dialect
    pub kind: ProviderKind,
    /// Default model for requests that do not name one
    #[serde(default)]
    pub model: Option<String>,
    /// API key; falls back to the provider's conventional env var
    /// Never serialized to output for security
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Base URL override (for proxies and compatible endpoints)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_timeout_secs() -> u64 {
    network_constants::DEFAULT_TIMEOUT_SECS
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            model: None,
            api_key: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Create a shared provider from configuration.
pub fn create_provider(settings: &ProviderSettings) -> Result<SharedProvider> {
    match settings.kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(settings.clone())?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(settings.clone())?)),
    }
}

// =============================================================================
// Shared Client Plumbing
// =============================================================================

/// Validate a base URL for security (SSRF prevention)
///
/// Only allows http/https schemes and strips the trailing slash.
pub(crate) fn validate_base_url(base_url: &str) -> Result<String> {
    let url = url::Url::parse(base_url)
        .map_err(|e| LexgateError::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(LexgateError::Config(format!(
            "Base URL must use http or https scheme, got: {}",
            url.scheme()
        )));
    }

    // Remove trailing slash for consistency
    let mut result = url.to_string();
    if result.ends_with('/') {
        result.pop();
    }
    Ok(result)
}

/// Build the HTTP client shared by all provider kinds.
pub(crate) fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(
            network_constants::CONNECTION_TIMEOUT_SECS,
        ))
        .build()
        .map_err(|e| LexgateError::Config(format!("Failed to create HTTP client: {}", e)))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Turn a non-success HTTP response into a classified provider error.
///
/// Both supported APIs nest a human-readable message under `error.message`;
/// anything else falls back to the raw body. A Retry-After header is carried
/// through (capped) so rate-limit waits honor the server.
pub(crate) async fn error_from_response(
    provider: &str,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.min(network_constants::MAX_RETRY_AFTER_SECS)));

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|parsed| parsed.error)
        .and_then(|detail| detail.message)
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            }
        });

    warn!(provider, status, %message, "Provider returned error response");

    let mut err = ErrorClassifier::classify_http_status(status, &message, provider);
    if let Some(delay) = retry_after {
        err = err.retry_after(delay);
    }
    err
}
