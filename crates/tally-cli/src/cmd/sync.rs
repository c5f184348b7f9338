use anyhow::Result;
use clap::Args;
use std::io::{self, Write};

use tally_core::clock::format_us;
use tally_core::ledger::{ResolutionOutcome, SyncReport};
use tally_core::sync::conflict::{ConflictStatus, Resolution, SyncConflict};
use tally_core::sync::reconcile::SyncOutcome;

use super::Context;
use crate::output::{pretty_kv, pretty_rule, render_mode};

#[derive(Args, Debug)]
pub struct SyncArgs {}

#[derive(Args, Debug)]
pub struct ConflictsArgs {
    /// `pending` (default), `discarded`, `retried`, `recreated`, or `all`.
    #[arg(long, default_value = "pending")]
    pub status: String,

    /// Include every tenant, not just the current one.
    #[arg(long)]
    pub all_tenants: bool,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub conflict_id: String,

    /// `discard`, `retry` or `recreate`.
    pub resolution: String,
}

fn outcome_line(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Synced {
            write_id,
            doc_id,
            overwrote_remote,
        } => {
            let note = if *overwrote_remote { " (overwrote remote)" } else { "" };
            format!("synced\t{write_id}\t{doc_id}{note}")
        }
        SyncOutcome::Superseded { write_id, doc_id } => format!("superseded\t{write_id}\t{doc_id}"),
        SyncOutcome::AlreadyApplied { write_id, doc_id } => {
            format!("already_applied\t{write_id}\t{doc_id}")
        }
        SyncOutcome::Conflict {
            write_id,
            conflict_id,
            category,
        } => format!("conflict\t{write_id}\t{conflict_id}\t{}", category.as_str()),
        SyncOutcome::Deferred {
            write_id,
            doc_id,
            blocked_by,
        } => format!("deferred\t{write_id}\t{doc_id}\tblocked by {blocked_by}"),
    }
}

fn render_report_pretty(report: &SyncReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "✓ offline queue drained")?;
    pretty_kv(w, "Synced", report.synced.to_string())?;
    pretty_kv(w, "Superseded", report.superseded.to_string())?;
    pretty_kv(w, "Replayed", report.already_applied.to_string())?;
    pretty_kv(w, "Conflicts", report.conflicts.to_string())?;
    if report.deferred > 0 {
        pretty_kv(w, "Waiting", report.deferred.to_string())?;
    }
    if report.conflicts > 0 || report.deferred > 0 {
        writeln!(w, "Run `tally conflicts` to review them.")?;
    }
    Ok(())
}

/// Execute `tally sync`: apply every pending offline write.
///
/// # Errors
///
/// Returns a storage error; business problems become conflict records.
pub fn run_sync(_args: &SyncArgs, ctx: &Context<'_>) -> Result<()> {
    let mut ledger = ctx.ledger()?;
    let report = ledger.sync()?;
    render_mode(
        ctx.output,
        &report,
        |r, w| {
            for outcome in &r.outcomes {
                writeln!(w, "{}", outcome_line(outcome))?;
            }
            Ok(())
        },
        render_report_pretty,
    )
}

fn render_conflicts_text(conflicts: &[SyncConflict], w: &mut dyn Write) -> io::Result<()> {
    for c in conflicts {
        writeln!(
            w,
            "{}\t{}\t{}\t{}/{}",
            c.conflict_id,
            c.status.as_str(),
            c.category.as_str(),
            c.collection_path,
            c.doc_id
        )?;
    }
    Ok(())
}

fn render_conflicts_pretty(conflicts: &[SyncConflict], w: &mut dyn Write) -> io::Result<()> {
    if conflicts.is_empty() {
        return writeln!(w, "(no conflicts)");
    }
    for c in conflicts {
        writeln!(w, "{} [{}] {}", c.conflict_id, c.status.as_str(), c.category)?;
        pretty_kv(w, "Document", format!("{}/{}", c.collection_path, c.doc_id))?;
        if let Some(ref detail) = c.detail {
            pretty_kv(w, "Detail", detail)?;
        }
        if let Some(ref local) = c.local {
            pretty_kv(w, "Local", serde_json::Value::Object(local.clone()).to_string())?;
        }
        pretty_kv(w, "Detected", format_us(c.detected_at_us))?;
        if let Some(ref recreated) = c.recreated_doc_id {
            pretty_kv(w, "Recreated as", recreated)?;
        }
        pretty_rule(w)?;
    }
    Ok(())
}

/// Execute `tally conflicts`.
///
/// # Errors
///
/// Returns an error for an unknown status or a failed read.
pub fn run_conflicts(args: &ConflictsArgs, ctx: &Context<'_>) -> Result<()> {
    let status = match args.status.as_str() {
        "all" => None,
        raw => Some(raw.parse::<ConflictStatus>()?),
    };
    let tenant = (!args.all_tenants).then_some(ctx.tenant.as_str());
    let ledger = ctx.ledger()?;
    let conflicts = ledger.conflicts(tenant, status)?;
    render_mode(
        ctx.output,
        conflicts.as_slice(),
        render_conflicts_text,
        render_conflicts_pretty,
    )
}

fn resolution_line(outcome: &ResolutionOutcome) -> String {
    match outcome {
        ResolutionOutcome::Discarded { conflict_id } => format!("discarded\t{conflict_id}"),
        ResolutionOutcome::Retried {
            conflict_id,
            outcome,
        } => format!("retried\t{conflict_id}\t{}", outcome_line(outcome)),
        ResolutionOutcome::StillConflicted { conflict_id } => {
            format!("still_conflicted\t{conflict_id}")
        }
        ResolutionOutcome::Recreated {
            conflict_id,
            doc_id,
            number,
        } => format!(
            "recreated\t{conflict_id}\t{doc_id}\t{}",
            number.map_or_else(|| "-".to_string(), |n| n.to_string())
        ),
    }
}

/// Execute `tally resolve`.
///
/// # Errors
///
/// Returns not-found, already-resolved or authorization errors, or the
/// failure of the write the resolution performs.
pub fn run_resolve(args: &ResolveArgs, ctx: &Context<'_>) -> Result<()> {
    let resolution: Resolution = args.resolution.parse()?;
    let actor = ctx.actor()?;
    let mut ledger = ctx.ledger()?;
    let outcome = ledger.resolve(&args.conflict_id, resolution, &actor)?;
    render_mode(
        ctx.output,
        &outcome,
        |o, w| writeln!(w, "{}", resolution_line(o)),
        |o, w| {
            writeln!(w, "{}", resolution_line(o).replace('\t', "  "))?;
            if matches!(o, ResolutionOutcome::StillConflicted { .. }) {
                writeln!(w, "The write still conflicts; discard it or recreate it as new.")?;
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::sync::conflict::ConflictCategory;

    #[test]
    fn outcome_lines_are_tab_separated() {
        let line = outcome_line(&SyncOutcome::Conflict {
            write_id: "w-1".into(),
            conflict_id: "c-1".into(),
            category: ConflictCategory::UpdateToDeletedDocument,
        });
        assert_eq!(line, "conflict\tw-1\tc-1\tupdate_to_deleted_document");

        let line = outcome_line(&SyncOutcome::Synced {
            write_id: "w-2".into(),
            doc_id: "d-2".into(),
            overwrote_remote: true,
        });
        assert!(line.ends_with("(overwrote remote)"));

        let line = outcome_line(&SyncOutcome::Deferred {
            write_id: "w-3".into(),
            doc_id: "d-3".into(),
            blocked_by: "w-1".into(),
        });
        assert_eq!(line, "deferred\tw-3\td-3\tblocked by w-1");
    }

    #[test]
    fn recreated_line_shows_number() {
        let line = resolution_line(&ResolutionOutcome::Recreated {
            conflict_id: "c-1".into(),
            doc_id: "d-9".into(),
            number: Some(4),
        });
        assert_eq!(line, "recreated\tc-1\td-9\t4");
    }
}
