use anyhow::{Result, anyhow};
use clap::Args;
use std::io::{self, Write};

use tally_core::clock::format_us;
use tally_core::model::Document;

use super::{Context, parse_path};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Collection path: `jobs`, `vehicles`, `jobs/<job-id>/costs`, ...
    pub path: String,
    pub doc_id: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Collection path: `jobs`, `vehicles`, `jobs/<job-id>/costs`, ...
    pub path: String,
}

/// Business fields only; metadata is shown separately.
fn business_fields(doc: &Document) -> impl Iterator<Item = (&String, &serde_json::Value)> {
    const META: [&str; 4] = ["createdAt", "createdBy", "updatedAt", "updatedBy"];
    doc.fields
        .iter()
        .filter(|(k, _)| !META.contains(&k.as_str()) && k.as_str() != doc.path.sequence().field)
}

pub fn render_document_human(doc: &Document, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("{} #{}", doc.path, doc.display_number()))?;
    pretty_kv(w, "Id", &doc.doc_id)?;
    pretty_kv(w, "Tenant", &doc.tenant_id)?;
    if let Some(status) = doc.job_status() {
        pretty_kv(w, "Status", status.as_str())?;
    }
    for (key, value) in business_fields(doc) {
        let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
        pretty_kv(w, key, shown)?;
    }
    if let Some(author) = doc.last_author() {
        pretty_kv(w, "Last author", author.to_string())?;
    }
    pretty_kv(w, "Created", format_us(doc.created_at_us))?;
    pretty_kv(w, "Updated", format_us(doc.stamp.server_ts_us))?;
    pretty_kv(w, "Version", doc.version().to_string())?;
    writeln!(w)
}

pub fn render_document_text(doc: &Document, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "{}\t{}\t{}\t{}",
        doc.doc_id,
        doc.display_number(),
        doc.version(),
        serde_json::Value::Object(doc.fields.clone())
    )
}

/// Render one document in any mode.
pub fn render_document(mode: OutputMode, doc: &Document) -> Result<()> {
    render_mode(mode, doc, render_document_text, render_document_human)
}

/// Execute `tally show`.
///
/// # Errors
///
/// Returns an error if the path is invalid or the document does not exist.
pub fn run_show(args: &ShowArgs, ctx: &Context<'_>) -> Result<()> {
    let path = parse_path(&args.path)?;
    let ledger = ctx.ledger()?;
    let doc = ledger
        .get(&ctx.tenant, &path, &args.doc_id)?
        .ok_or_else(|| anyhow!("document not found: {path}/{}", args.doc_id))?;
    render_document(ctx.output, &doc)
}

/// Execute `tally list`: a collection in creation order.
///
/// # Errors
///
/// Returns an error if the path is invalid or the store cannot be read.
pub fn run_list(args: &ListArgs, ctx: &Context<'_>) -> Result<()> {
    let path = parse_path(&args.path)?;
    let ledger = ctx.ledger()?;
    let docs = ledger.list(&ctx.tenant, &path)?;
    render_mode(
        ctx.output,
        docs.as_slice(),
        |docs, w| {
            for doc in docs {
                render_document_text(doc, w)?;
            }
            Ok(())
        },
        |docs, w| {
            if docs.is_empty() {
                return writeln!(w, "(no documents)");
            }
            for doc in docs {
                render_document_human(doc, w)?;
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::model::{CollectionPath, RootCollection, WriteStamp};

    fn doc() -> Document {
        let serde_json::Value::Object(fields) = json!({
            "jobNumber": 12,
            "title": "Fence",
            "status": "active",
            "createdBy": {"callerId": "u-ana", "displayName": "Ana"},
        }) else {
            unreachable!()
        };
        Document {
            tenant_id: "acme".into(),
            path: CollectionPath::Root(RootCollection::Jobs),
            doc_id: "d-1".into(),
            fields,
            stamp: WriteStamp {
                server_ts_us: 1_700_000_000_000_000,
                write_seq: 4,
            },
            created_at_us: 1_700_000_000_000_000,
        }
    }

    #[test]
    fn human_rendering_shows_number_and_fields() {
        let mut out = Vec::new();
        render_document_human(&doc(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("jobs #12"));
        assert!(text.contains("title:"));
        assert!(text.contains("Fence"));
        assert!(text.contains("Ana (u-ana)"));
        assert!(!text.contains("createdBy"));
    }

    #[test]
    fn text_rendering_is_one_tab_separated_line() {
        let mut out = Vec::new();
        render_document_text(&doc(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("d-1\t12\t4\t"));
    }
}
