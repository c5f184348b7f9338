use anyhow::{Result, anyhow};
use clap::Args;
use std::io::{self, Write};

use tally_core::clock::{format_us, parse_instant_us};
use tally_core::sync::pending::{NewPendingWrite, PendingState, PendingWrite, WriteOp};

use super::{Context, parse_path, read_fields};
use crate::output::{pretty_kv, pretty_rule, render_mode};

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// `create`, `update` or `delete`.
    pub op: String,

    /// Collection path.
    pub path: String,

    /// Target document; generated for creates when omitted.
    pub doc_id: Option<String>,

    /// Local values as a JSON object, or `-` for stdin.
    #[arg(short, long)]
    pub data: Option<String>,

    /// Document version the local edit was made against.
    #[arg(long)]
    pub base_version: Option<i64>,

    /// Device clock at the time of the edit (RFC 3339). Defaults to now.
    #[arg(long)]
    pub client_ts: Option<String>,
}

#[derive(Args, Debug)]
pub struct PendingArgs {
    /// `pending`, `synced`, `conflict` or `discarded`.
    #[arg(long)]
    pub state: Option<String>,
}

fn render_text(writes: &[PendingWrite], w: &mut dyn Write) -> io::Result<()> {
    for p in writes {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            p.write_id, p.state, p.op, p.path, p.doc_id
        )?;
    }
    Ok(())
}

fn render_pretty(writes: &[PendingWrite], w: &mut dyn Write) -> io::Result<()> {
    if writes.is_empty() {
        return writeln!(w, "(queue empty)");
    }
    for p in writes {
        writeln!(w, "{} [{}]", p.write_id, p.state)?;
        pretty_kv(w, "Write", format!("{} {}/{}", p.op, p.path, p.doc_id))?;
        pretty_kv(w, "Actor", p.actor.to_string())?;
        pretty_kv(w, "Queued", format_us(p.queued_at_us))?;
        pretty_rule(w)?;
    }
    Ok(())
}

/// Execute `tally queue`: record a local write for the next `tally sync`.
///
/// # Errors
///
/// Returns an error for malformed input.
pub fn run_queue(args: &QueueArgs, ctx: &Context<'_>) -> Result<()> {
    let op: WriteOp = args.op.parse()?;
    let path = parse_path(&args.path)?;
    let fields = match op {
        WriteOp::Delete => None,
        WriteOp::Create | WriteOp::Update => Some(read_fields(args.data.as_deref())?),
    };
    let client_ts_us = match args.client_ts.as_deref() {
        Some(raw) => parse_instant_us(raw)
            .ok_or_else(|| anyhow!("--client-ts: expected RFC 3339, got '{raw}'"))?,
        None => chrono::Utc::now().timestamp_micros(),
    };
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;

    let queued = ledger.enqueue(NewPendingWrite {
        tenant_id: ctx.tenant.clone(),
        path,
        doc_id: args.doc_id.clone(),
        op,
        fields,
        base_version: args.base_version,
        actor,
        client_ts_us,
    })?;
    render_mode(
        ctx.output,
        &queued,
        |p, w| render_text(std::slice::from_ref(p), w),
        |p, w| render_pretty(std::slice::from_ref(p), w),
    )
}

/// Execute `tally pending`: show the offline queue.
///
/// # Errors
///
/// Returns an error for an unknown state or a failed read.
pub fn run_pending(args: &PendingArgs, ctx: &Context<'_>) -> Result<()> {
    let state = args
        .state
        .as_deref()
        .map(str::parse::<PendingState>)
        .transpose()?;
    let ledger = ctx.ledger()?;
    let writes = ledger.pending(state)?;
    render_mode(ctx.output, writes.as_slice(), render_text, render_pretty)
}
