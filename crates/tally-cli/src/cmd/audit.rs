use anyhow::{Result, anyhow};
use clap::Args;
use std::io::{self, Write};

use tally_core::audit::AuditSnapshot;
use tally_core::audit::query::AuditFilter;
use tally_core::clock::{format_us, parse_instant_us};
use tally_core::event::MutationKind;

use super::Context;
use crate::output::{pretty_kv, pretty_rule, render_mode};

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Leaf collection name (`jobs`, `costs`, ...).
    #[arg(long)]
    pub collection: Option<String>,

    /// Only snapshots of this document.
    #[arg(long = "doc")]
    pub doc_id: Option<String>,

    /// `create`, `update` or `delete`.
    #[arg(long = "op")]
    pub operation: Option<String>,

    /// Author caller id.
    #[arg(long)]
    pub author: Option<String>,

    /// Inclusive lower bound: RFC 3339 instant or `YYYY-MM-DD`.
    #[arg(long)]
    pub since: Option<String>,

    /// Exclusive upper bound: RFC 3339 instant or `YYYY-MM-DD`.
    #[arg(long)]
    pub until: Option<String>,

    #[arg(long)]
    pub limit: Option<u32>,

    #[arg(long)]
    pub offset: Option<u32>,
}

fn parse_bound(flag: &str, raw: Option<&str>) -> Result<Option<i64>> {
    raw.map(|value| {
        parse_instant_us(value)
            .ok_or_else(|| anyhow!("--{flag}: expected RFC 3339 or YYYY-MM-DD, got '{value}'"))
    })
    .transpose()
}

impl AuditArgs {
    fn filter(&self, tenant_id: &str) -> Result<AuditFilter> {
        let operation = self
            .operation
            .as_deref()
            .map(str::parse::<MutationKind>)
            .transpose()?;
        Ok(AuditFilter {
            collection: self.collection.clone(),
            doc_id: self.doc_id.clone(),
            operation,
            author: self.author.clone(),
            since_us: parse_bound("since", self.since.as_deref())?,
            until_us: parse_bound("until", self.until.as_deref())?,
            limit: self.limit,
            offset: self.offset,
            ..AuditFilter::for_tenant(tenant_id)
        })
    }
}

fn render_text(snapshots: &[AuditSnapshot], w: &mut dyn Write) -> io::Result<()> {
    for s in snapshots {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            format_us(s.ts_us),
            s.operation,
            s.collection_path,
            s.doc_id,
            s.author.as_ref().map_or("-", |a| a.caller_id.as_str())
        )?;
    }
    Ok(())
}

fn render_pretty(snapshots: &[AuditSnapshot], w: &mut dyn Write) -> io::Result<()> {
    if snapshots.is_empty() {
        return writeln!(w, "(no audit entries)");
    }
    for s in snapshots {
        writeln!(w, "{} {}/{}", s.operation, s.collection_path, s.doc_id)?;
        pretty_kv(w, "At", format_us(s.ts_us))?;
        if let Some(ref author) = s.author {
            pretty_kv(w, "Author", author.to_string())?;
        }
        pretty_kv(w, "Expires", format_us(s.expires_at_us))?;
        pretty_rule(w)?;
    }
    Ok(())
}

/// Execute `tally audit`: list snapshots newest first.
///
/// # Errors
///
/// Returns an error for malformed filters or a failed query.
pub fn run_audit(args: &AuditArgs, ctx: &Context<'_>) -> Result<()> {
    let filter = args.filter(&ctx.tenant)?;
    let ledger = ctx.ledger()?;
    let snapshots = ledger.audit(&filter)?;
    render_mode(ctx.output, snapshots.as_slice(), render_text, render_pretty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> AuditArgs {
        AuditArgs {
            collection: None,
            doc_id: None,
            operation: None,
            author: None,
            since: None,
            until: None,
            limit: None,
            offset: None,
        }
    }

    #[test]
    fn filter_parses_operation_and_bounds() {
        let filter = AuditArgs {
            operation: Some("delete".into()),
            since: Some("2024-02-01".into()),
            until: Some("2024-02-02T00:00:00Z".into()),
            ..args()
        }
        .filter("acme")
        .unwrap();
        assert_eq!(filter.tenant_id, "acme");
        assert_eq!(filter.operation, Some(MutationKind::Delete));
        assert_eq!(
            filter.until_us.unwrap() - filter.since_us.unwrap(),
            86_400_000_000
        );
    }

    #[test]
    fn bad_bound_is_rejected() {
        let err = AuditArgs {
            since: Some("yesterday".into()),
            ..args()
        }
        .filter("acme")
        .unwrap_err();
        assert!(err.to_string().contains("--since"));
    }

    #[test]
    fn bad_operation_is_rejected() {
        let result = AuditArgs {
            operation: Some("upsert".into()),
            ..args()
        }
        .filter("acme");
        assert!(result.is_err());
    }
}
