//! Status Command
//!
//! Display gateway status: cache occupancy, recent usage, in-flight
//! executions, and budget standing.

use std::path::Path;
use std::time::Duration;

use crate::cli::util::CommandContext;
use crate::types::Result;

pub fn run(
    config_file: Option<&Path>,
    user: Option<&str>,
    window_hours: u64,
    format: &str,
) -> Result<()> {
    let ctx = CommandContext::load(config_file)?;
    let window = Duration::from_secs(window_hours * 3600);
    let json_output = format == "json";

    let cache = ctx.gateway.cache_stats()?;
    let usage = ctx.gateway.usage_summary(user, window)?;
    let pending = ctx.gateway.pending_executions();
    let (budgets, alerts) = match user {
        Some(user) => (
            ctx.gateway.budget_report(user)?,
            ctx.gateway.recent_budget_alerts(user, window)?,
        ),
        None => (Vec::new(), Vec::new()),
    };

    if json_output {
        let status = serde_json::json!({
            "cache": {
                "entries": cache.entries,
                "total_hits": cache.total_hits,
                "size_bytes": cache.size_bytes,
            },
            "usage": {
                "window_hours": window_hours,
                "user": user,
                "requests": usage.requests,
                "successes": usage.successes,
                "fallbacks": usage.fallbacks,
                "cached": usage.cached,
                "errors": usage.errors,
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_cost_usd": usage.total_cost_usd,
                "avg_duration_ms": usage.avg_duration_ms,
            },
            "pending_executions": pending,
            "budgets": budgets.iter().map(|check| {
                serde_json::json!({
                    "period": check.period.as_str(),
                    "status": check.status.as_str(),
                    "spent_usd": check.spent_usd,
                    "limit_usd": check.limit_usd,
                })
            }).collect::<Vec<_>>(),
            "alerts": alerts.iter().map(|alert| {
                serde_json::json!({
                    "period": alert.period,
                    "status": alert.status,
                    "percentage": alert.percentage,
                    "created_at": alert.created_at,
                })
            }).collect::<Vec<_>>(),
        });

        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Lexgate Status");
    println!("══════════════════════════════════════");

    println!("Cache:");
    println!("  Entries: {}", cache.entries);
    println!("  Hits served: {}", cache.total_hits);
    println!("  Size: {} bytes", cache.size_bytes);
    println!();

    match user {
        Some(user) => println!("Usage (last {}h, user {}):", window_hours, user),
        None => println!("Usage (last {}h, all users):", window_hours),
    }
    println!(
        "  Requests: {} ({} success, {} fallback, {} cached, {} errors)",
        usage.requests, usage.successes, usage.fallbacks, usage.cached, usage.errors
    );
    println!(
        "  Tokens: {} in / {} out",
        usage.prompt_tokens, usage.completion_tokens
    );
    println!("  Cost: ${:.4}", usage.total_cost_usd);
    println!("  Avg duration: {:.0} ms", usage.avg_duration_ms);
    println!();

    println!("In-flight executions: {}", pending);

    if !budgets.is_empty() {
        println!();
        println!("Budgets:");
        for check in &budgets {
            if check.limit_usd <= 0.0 {
                println!("  {:<8} disabled", check.period.as_str());
                continue;
            }
            println!(
                "  {:<8} ${:.2} of ${:.2} ({})",
                check.period.as_str(),
                check.spent_usd,
                check.limit_usd,
                check.status
            );
        }
    }

    if !alerts.is_empty() {
        println!();
        println!("Alerts (last {}h):", window_hours);
        for alert in &alerts {
            let when = chrono::DateTime::from_timestamp(alert.created_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| alert.created_at.to_string());
            println!(
                "  {:<8} {} at {:.0}% ({})",
                alert.period, alert.status, alert.percentage, when
            );
        }
    }

    Ok(())
}
