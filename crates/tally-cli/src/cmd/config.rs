use anyhow::Result;
use clap::Args;

use tally_core::config::{EffectiveConfig, resolve_config};

use super::Context;
use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ConfigArgs {}

/// Execute `tally config`: print the effective project and user settings.
///
/// # Errors
///
/// Returns an error if either config file fails to parse.
pub fn run_config(_args: &ConfigArgs, ctx: &Context<'_>) -> Result<()> {
    let effective = resolve_config(ctx.project_root, ctx.output.is_json())?;
    render_mode(
        ctx.output,
        &effective,
        |c, w| {
            writeln!(w, "sequence.max_attempts\t{}", c.ledger.sequence.max_attempts)?;
            writeln!(w, "audit.retention_days\t{}", c.ledger.audit.retention_days)?;
            writeln!(w, "retention.batch_size\t{}", c.ledger.retention.batch_size)?;
            writeln!(w, "retention.interval_hours\t{}", c.ledger.retention.interval_hours)?;
            writeln!(w, "output\t{}", c.resolved_output)
        },
        render_pretty,
    )
}

fn render_pretty(c: &EffectiveConfig, w: &mut dyn std::io::Write) -> std::io::Result<()> {
    pretty_section(w, "Sequence")?;
    pretty_kv(w, "Attempts", c.ledger.sequence.max_attempts.to_string())?;
    pretty_kv(w, "Retry delay", format!("{} ms", c.ledger.sequence.retry_delay_ms))?;
    writeln!(w)?;
    pretty_section(w, "Audit")?;
    pretty_kv(w, "Retention", format!("{} days", c.ledger.audit.retention_days))?;
    pretty_kv(w, "Monitored", c.ledger.audit.monitored.join(", "))?;
    writeln!(w)?;
    pretty_section(w, "Retention sweep")?;
    pretty_kv(w, "Batch size", c.ledger.retention.batch_size.to_string())?;
    pretty_kv(w, "Attempts", c.ledger.retention.max_attempts.to_string())?;
    pretty_kv(w, "Interval", format!("{} h", c.ledger.retention.interval_hours))?;
    writeln!(w)?;
    pretty_section(w, "User")?;
    pretty_kv(w, "Caller", c.user.caller_id.as_deref().unwrap_or("(unset)"))?;
    pretty_kv(w, "Output", &c.resolved_output)
}
