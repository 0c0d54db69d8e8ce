//! Complete Command
//!
//! Run one completion request through the gateway and print the result.
//! Text output puts the completion on stdout followed by a short route
//! summary; JSON output emits one machine-readable object.

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::{CompletionRequest, Message, Result};

pub struct CompleteOptions {
    pub prompt: String,
    pub system: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub user: Option<String>,
    pub matter: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub no_cache: bool,
    pub no_retry: bool,
    pub no_dedupe: bool,
    pub format: String,
}

pub async fn run(config_file: Option<&Path>, options: CompleteOptions) -> Result<()> {
    let ctx = CommandContext::load(config_file)?;

    let mut messages = Vec::new();
    if let Some(system) = &options.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(&options.prompt));

    let mut request = CompletionRequest::new(messages);
    request.provider = options.provider;
    request.model = options.model;
    request.user_id = options.user;
    request.matter_ref = options.matter;
    request.temperature = options.temperature;
    request.max_tokens = options.max_tokens;
    request.json_mode = options.json_mode;
    request.use_cache = !options.no_cache;
    request.use_retry = !options.no_retry;
    request.use_dedupe = !options.no_dedupe;

    let response = ctx.gateway.complete(request).await?;

    if options.format == "json" {
        let json = serde_json::json!({
            "content": response.content,
            "provider": response.provider,
            "model": response.model,
            "usage": {
                "prompt_tokens": response.usage.prompt_tokens,
                "completion_tokens": response.usage.completion_tokens,
                "total_tokens": response.usage.total(),
            },
            "metadata": {
                "cached": response.metadata.cached,
                "deduplicated": response.metadata.deduplicated,
                "fallback_used": response.metadata.fallback_used,
                "retry_attempts": response.metadata.retry_attempts,
                "total_duration_ms": response.metadata.total_duration_ms,
            },
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    println!("{}", response.content);

    let out = Output::new();
    out.section("Route");
    out.field("Provider", &response.provider);
    out.field("Model", &response.model);
    out.field(
        "Tokens",
        &format!(
            "{} in / {} out",
            response.usage.prompt_tokens, response.usage.completion_tokens
        ),
    );
    out.field(
        "Duration",
        &format!("{} ms", response.metadata.total_duration_ms),
    );

    let mut notes: Vec<String> = Vec::new();
    if response.metadata.cached {
        notes.push("served from cache".to_string());
    }
    if response.metadata.deduplicated {
        notes.push("coalesced with an in-flight request".to_string());
    }
    if response.metadata.fallback_used {
        notes.push("answered by a fallback provider".to_string());
    }
    if response.metadata.retry_attempts > 0 {
        notes.push(format!(
            "{} extra attempt(s)",
            response.metadata.retry_attempts
        ));
    }
    if !notes.is_empty() {
        out.field("Notes", &notes.join(", "));
    }

    Ok(())
}
