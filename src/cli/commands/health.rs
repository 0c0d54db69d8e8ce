//! Health Command
//!
//! Show per-provider health over the rolling window, and optionally probe
//! each provider's API for current reachability.

use std::path::Path;

use crate::cli::util::CommandContext;
use crate::types::Result;

pub async fn run(config_file: Option<&Path>, probe: bool, format: &str) -> Result<()> {
    let ctx = CommandContext::load(config_file)?;
    let json_output = format == "json";

    let configured = ctx.gateway.provider_names();
    // Probe first so the samples it records show up in the snapshot below.
    let probes = if probe {
        Some(ctx.gateway.probe_providers().await)
    } else {
        None
    };
    let snapshot = ctx.gateway.provider_health()?;

    if json_output {
        let providers: Vec<_> = configured
            .iter()
            .map(|name| {
                let stats = snapshot.iter().find(|h| &h.provider == name);
                let reachable = probes.as_ref().and_then(|probes| {
                    probes
                        .iter()
                        .find(|(probed, _)| probed == name)
                        .map(|(_, ok)| *ok)
                });
                serde_json::json!({
                    "provider": name,
                    "samples": stats.map(|s| s.samples),
                    "success_ratio": stats.map(|s| s.success_ratio),
                    "avg_latency_ms": stats.map(|s| s.avg_latency_ms),
                    "reachable": reachable,
                })
            })
            .collect();

        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "providers": providers }))?
        );
        return Ok(());
    }

    println!("Provider Health");
    println!("══════════════════════════════════════");

    if configured.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    for name in &configured {
        match snapshot.iter().find(|h| &h.provider == name) {
            Some(stats) => {
                println!(
                    "  {:<12} {:>5.1}% success, {:>6.0} ms avg, {} samples",
                    name,
                    stats.success_ratio * 100.0,
                    stats.avg_latency_ms,
                    stats.samples
                );
            }
            None => {
                println!("  {:<12} no recent samples", name);
            }
        }
    }

    if let Some(probes) = probes {
        println!();
        println!("Live probes:");
        for (name, ok) in probes {
            println!(
                "  {:<12} {}",
                name,
                if ok { "reachable" } else { "unreachable" }
            );
        }
    }

    Ok(())
}
