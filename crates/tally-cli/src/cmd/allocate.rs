use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::Context;
use crate::output::{pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct AllocateArgs {
    /// Sequence name, e.g. `jobNumber` or `costs.ordinalNumber`.
    pub sequence: String,

    /// Scope id; defaults to the tenant (use the job id for ordinals).
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct Allocation<'a> {
    tenant_id: &'a str,
    scope_id: &'a str,
    sequence_name: &'a str,
    value: i64,
}

/// Execute `tally allocate`: reserve the next number of a counter.
///
/// # Errors
///
/// Returns authorization or allocation errors.
pub fn run_allocate(args: &AllocateArgs, ctx: &Context<'_>) -> Result<()> {
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;
    let scope = args.scope.as_deref().unwrap_or(&ctx.tenant);
    let value = ledger.allocate_sequence(&actor.caller_id, &ctx.tenant, scope, &args.sequence)?;

    let allocation = Allocation {
        tenant_id: &ctx.tenant,
        scope_id: scope,
        sequence_name: &args.sequence,
        value,
    };
    render_mode(
        ctx.output,
        &allocation,
        |a, w| writeln!(w, "{}", a.value),
        |a, w| {
            pretty_kv(w, "Sequence", format!("{}/{}/{}", a.tenant_id, a.scope_id, a.sequence_name))?;
            pretty_kv(w, "Value", a.value.to_string())
        },
    )
}
