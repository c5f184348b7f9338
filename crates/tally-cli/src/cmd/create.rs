use anyhow::Result;
use clap::Args;

use super::show::render_document;
use super::{Context, parse_path, read_fields};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Collection path: `jobs`, `vehicles`, `jobs/<job-id>/costs`, ...
    pub path: String,

    /// Document body as a JSON object, or `-` to read it from stdin.
    #[arg(short, long)]
    pub data: Option<String>,

    /// Commit without a number, the way a disconnected client does; the
    /// number is backfilled right after the commit.
    #[arg(long)]
    pub offline: bool,

    /// Explicit document id (offline creates only).
    #[arg(long, requires = "offline")]
    pub id: Option<String>,
}

/// Execute `tally create`.
///
/// # Errors
///
/// Returns authorization, validation or allocation errors.
pub fn run_create(args: &CreateArgs, ctx: &Context<'_>) -> Result<()> {
    let path = parse_path(&args.path)?;
    let fields = read_fields(args.data.as_deref())?;
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;

    let doc = if args.offline {
        ledger.create_offline(&ctx.tenant, &path, args.id.as_deref(), fields, &actor)?
    } else {
        ledger.create(&ctx.tenant, &path, fields, &actor)?
    };
    render_document(ctx.output, &doc)
}
