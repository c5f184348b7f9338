use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::show::render_document;
use super::{Context, parse_path, read_fields};
use crate::output::render;

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub path: String,
    pub doc_id: String,

    /// Replacement body as a JSON object, or `-` for stdin. The whole
    /// document is replaced; the sequence number is kept.
    #[arg(short, long)]
    pub data: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub path: String,
    pub doc_id: String,
}

/// Execute `tally update`.
///
/// # Errors
///
/// Returns authorization, not-found or validation errors.
pub fn run_update(args: &UpdateArgs, ctx: &Context<'_>) -> Result<()> {
    let path = parse_path(&args.path)?;
    let fields = read_fields(Some(&args.data))?;
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;
    let doc = ledger.update(&ctx.tenant, &path, &args.doc_id, fields, &actor)?;
    render_document(ctx.output, &doc)
}

/// Execute `tally delete`. Jobs are archived; everything else is removed.
///
/// # Errors
///
/// Returns authorization or not-found errors.
pub fn run_delete(args: &DeleteArgs, ctx: &Context<'_>) -> Result<()> {
    let path = parse_path(&args.path)?;
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;

    match ledger.delete(&ctx.tenant, &path, &args.doc_id, &actor)? {
        Some(archived) => render_document(ctx.output, &archived),
        None => render(
            ctx.output,
            &json!({ "deleted": true, "path": path.to_string(), "doc_id": args.doc_id }),
            |_, w| writeln!(w, "✓ deleted {path}/{}", args.doc_id),
        ),
    }
}
