//! Completion Request Types
//!
//! The caller-facing request shape plus the normalization rules that make
//! logically-equal requests collapse to one cache/dedup key.

use serde::{Deserialize, Serialize};

use crate::constants::request as request_constants;
use crate::types::{LexgateError, Result};

// =============================================================================
// Messages
// =============================================================================

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single (role, content) pair in the conversation sent upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// =============================================================================
// Token Usage
// =============================================================================

/// Token counts reported by a provider for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt (input) tokens
    pub prompt_tokens: u32,
    /// Completion (output) tokens
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Total tokens used (prompt + completion)
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

// =============================================================================
// Completion Request
// =============================================================================

/// A completion request as submitted by the application.
///
/// Optional tuning fields are normalized to fixed defaults before
/// fingerprinting, so two requests that differ only in unset-vs-default
/// optional fields are treated as the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation to complete (must be non-empty)
    pub messages: Vec<Message>,

    /// Explicit provider to try first; gateway default when absent
    #[serde(default)]
    pub provider: Option<String>,

    /// Model override; the provider's configured model when absent
    #[serde(default)]
    pub model: Option<String>,

    /// Sampling temperature; normalized default when absent
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Max output tokens; normalized default when absent
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Ask the provider for a JSON object response
    #[serde(default)]
    pub json_mode: bool,

    /// Caller identity for usage attribution and budget checks
    #[serde(default)]
    pub user_id: Option<String>,

    /// Optional matter/document reference for usage attribution
    #[serde(default)]
    pub matter_ref: Option<String>,

    /// Serve from the response cache when possible
    #[serde(default = "default_true")]
    pub use_cache: bool,

    /// Retry transient failures before giving up on a provider
    #[serde(default = "default_true")]
    pub use_retry: bool,

    /// Coalesce with identical in-flight requests
    #[serde(default = "default_true")]
    pub use_dedupe: bool,
}

fn default_true() -> bool {
    true
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            provider: None,
            model: None,
            temperature: None,
            max_tokens: None,
            json_mode: false,
            user_id: None,
            matter_ref: None,
            use_cache: true,
            use_retry: true,
            use_dedupe: true,
        }
    }

    /// Single user-message convenience constructor
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Temperature with the fingerprint default applied
    pub fn normalized_temperature(&self) -> f64 {
        self.temperature
            .unwrap_or(request_constants::DEFAULT_TEMPERATURE)
    }

    /// Max output tokens with the fingerprint default applied
    pub fn normalized_max_tokens(&self) -> u32 {
        self.max_tokens
            .unwrap_or(request_constants::DEFAULT_MAX_TOKENS)
    }

    /// Reject requests the gateway cannot meaningfully forward.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(LexgateError::Validation(
                "message list must not be empty".to_string(),
            ));
        }
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(LexgateError::Validation(
                "message content must not be empty".to_string(),
            ));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(LexgateError::Validation(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                t
            )));
        }
        if let Some(max) = self.max_tokens
            && max == 0
        {
            return Err(LexgateError::Validation(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
