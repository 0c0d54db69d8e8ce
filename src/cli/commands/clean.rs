//! Clean Command
//!
//! Removes expired cache entries, stale in-flight records, and aged
//! health samples. `--all` also drops live cache entries and the full
//! health history. Usage records are billing data and are never touched.

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::Result;

pub fn run(config_file: Option<&Path>, all: bool) -> Result<()> {
    let ctx = CommandContext::load(config_file)?;
    let out = Output::new();

    if all {
        let (removed, dropped) = ctx.gateway.clear_all()?;
        out.success(&format!("Cleared {} cache entries", removed));
        if dropped > 0 {
            out.success(&format!("Dropped {} in-flight entries", dropped));
        }

        let samples = ctx.gateway.clear_health_samples()?;
        out.success(&format!("Cleared {} health samples", samples));
    } else {
        let expired = ctx.gateway.clean_expired_cache()?;
        if expired > 0 {
            out.success(&format!("Removed {} expired cache entries", expired));
        } else {
            out.info("No expired cache entries");
        }

        let pruned = ctx.gateway.prune_health_samples()?;
        if pruned > 0 {
            out.success(&format!("Pruned {} aged health samples", pruned));
        }

        let stale = ctx.gateway.clean_stale_executions();
        if stale > 0 {
            out.success(&format!("Dropped {} stalled in-flight entries", stale));
        }
    }

    Ok(())
}
