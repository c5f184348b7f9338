use anyhow::{Context as _, Result};
use clap::Args;
use serde_json::json;
use std::io::Read;
use std::time::Duration;

use tally_core::audit::retention::{RetentionScheduler, SweepReport, sweep_project};

use super::Context;
use crate::output::{pretty_kv, render, render_mode};

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Keep sweeping at the configured interval until stdin is closed.
    #[arg(long)]
    pub daemon: bool,

    /// How long to wait for another sweeper's lock before skipping.
    #[arg(long, default_value_t = 2_000)]
    pub lock_timeout_ms: u64,
}

/// Execute `tally sweep`: purge expired audit snapshots.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the sweep fails.
pub fn run_sweep(args: &SweepArgs, ctx: &Context<'_>) -> Result<()> {
    // Fails early on an uninitialized project.
    drop(ctx.ledger()?);
    let config = ctx.ledger_config()?;

    if args.daemon {
        let interval = config.retention.interval();
        tracing::info!(?interval, "retention daemon started; close stdin to stop");
        let scheduler = RetentionScheduler::for_project(ctx.project_root.to_path_buf(), config);
        let mut sink = Vec::new();
        std::io::stdin()
            .read_to_end(&mut sink)
            .context("wait for stdin to close")?;
        scheduler.stop();
        return render(ctx.output, &json!({ "stopped": true }), |_, w| {
            writeln!(w, "retention daemon stopped")
        });
    }

    let timeout = Duration::from_millis(args.lock_timeout_ms);
    match sweep_project(ctx.project_root, &config, timeout)? {
        Some(report) => render_mode(
            ctx.output,
            &report,
            |r, w| {
                writeln!(
                    w,
                    "{}\t{}\t{}\t{}",
                    r.deleted, r.batches, r.failed_batches, r.elapsed_ms
                )
            },
            render_report,
        ),
        None => render(ctx.output, &json!({ "skipped": true }), |_, w| {
            writeln!(w, "another sweep is running; skipped")
        }),
    }
}

fn render_report(r: &SweepReport, w: &mut dyn std::io::Write) -> std::io::Result<()> {
    writeln!(w, "✓ retention sweep finished")?;
    pretty_kv(w, "Deleted", r.deleted.to_string())?;
    pretty_kv(w, "Batches", r.batches.to_string())?;
    if r.failed_batches > 0 {
        pretty_kv(
            w,
            "Failed",
            format!("{} batches ({} snapshots kept)", r.failed_batches, r.skipped),
        )?;
    }
    pretty_kv(w, "Elapsed", format!("{} ms", r.elapsed_ms))
}
