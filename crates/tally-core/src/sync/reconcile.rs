//! Applying queued offline writes once the client is back online.
//!
//! Each write is settled in one transaction:
//!
//! - writes already applied (by `write_id`) are acknowledged again and
//!   nothing else happens
//! - a write queued behind an unresolved conflict on the same document
//!   stays pending until that conflict is resolved
//! - authorization and validation failures, and updates aimed at documents
//!   deleted remotely, become [`SyncConflict`](super::conflict::SyncConflict)
//!   records instead of being dropped
//! - everything else goes through whole-document last-writer-wins against
//!   the stored state, ordered by server stamps
//!
//! A create that reaches the server here has no sequence number; the
//! resulting create event is what triggers the backfill.

use rusqlite::{Transaction, params};
use serde::Serialize;

use super::conflict::{self, ConflictCategory};
use super::lww::{self, Verdict};
use super::pending::{self, PendingState, PendingWrite, WriteOp};
use crate::auth::Authorizer;
use crate::error::{LedgerError, Result};
use crate::event::MutationEvent;
use crate::model::Document;
use crate::store::{self, Store};

/// How one queued write was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Applied. `overwrote_remote` is set when the document changed
    /// remotely after the version the write was based on.
    Synced {
        write_id: String,
        doc_id: String,
        overwrote_remote: bool,
    },
    /// A remote write with a later stamp already holds the document.
    Superseded { write_id: String, doc_id: String },
    /// This write was applied before; nothing changed.
    AlreadyApplied { write_id: String, doc_id: String },
    /// Left pending behind an earlier write on the same document that is
    /// still in conflict.
    Deferred {
        write_id: String,
        doc_id: String,
        blocked_by: String,
    },
    /// Parked for explicit resolution.
    Conflict {
        write_id: String,
        conflict_id: String,
        category: ConflictCategory,
    },
}

impl SyncOutcome {
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Outcome plus the events of whatever was committed.
#[derive(Debug, Clone)]
pub struct Applied {
    pub outcome: SyncOutcome,
    pub events: Vec<MutationEvent>,
}

/// Settle one queued write.
///
/// # Errors
///
/// Returns storage errors, and [`LedgerError::AllocationExhausted`] if the
/// transaction kept losing write races. Business-level problems are
/// reported as [`SyncOutcome::Conflict`], not as errors.
pub fn apply(store: &mut Store, authorizer: &dyn Authorizer, write: &PendingWrite) -> Result<Applied> {
    let now = store.now_us();
    let allocator = store.allocator();
    let label = format!("sync {}", write.write_id);

    let applied = allocator.run(store.conn_mut(), &label, |tx| {
        apply_in(tx, authorizer, write, now)
    })?;

    tracing::info!(
        write_id = %write.write_id,
        op = %write.op,
        path = %write.path,
        doc_id = %write.doc_id,
        outcome = ?applied.outcome,
        "reconciled offline write"
    );
    Ok(applied)
}

fn apply_in(
    tx: &Transaction<'_>,
    authorizer: &dyn Authorizer,
    write: &PendingWrite,
    now_us: i64,
) -> Result<Applied> {
    if was_applied(tx, &write.write_id)? {
        pending::set_state(tx, &write.write_id, PendingState::Synced)?;
        return Ok(Applied {
            outcome: SyncOutcome::AlreadyApplied {
                write_id: write.write_id.clone(),
                doc_id: write.doc_id.clone(),
            },
            events: Vec::new(),
        });
    }

    if let Some(blocked_by) = pending::blocked_by(tx, write)? {
        return Ok(Applied {
            outcome: SyncOutcome::Deferred {
                write_id: write.write_id.clone(),
                doc_id: write.doc_id.clone(),
                blocked_by,
            },
            events: Vec::new(),
        });
    }

    let current = store::load(tx, &write.tenant_id, &write.path, &write.doc_id)?;

    if !authorizer.is_member(&write.actor.caller_id, &write.tenant_id) {
        let detail = format!(
            "{} is not a member of tenant {}",
            write.actor.caller_id, write.tenant_id
        );
        return park(
            tx,
            write,
            ConflictCategory::PermissionDenied,
            &detail,
            current.as_ref(),
            now_us,
        );
    }

    let mut fields = write.fields.clone().unwrap_or_default();
    if write.op != WriteOp::Delete {
        let checked = store::prepare_body(&write.path, &mut fields).and_then(|()| {
            if write.op == WriteOp::Create {
                store::ensure_parent(tx, &write.tenant_id, &write.path)
            } else {
                Ok(())
            }
        });
        match checked {
            Ok(()) => {}
            Err(LedgerError::InvalidDocument(detail)) => {
                return park(
                    tx,
                    write,
                    ConflictCategory::ValidationRejected,
                    &detail,
                    current.as_ref(),
                    now_us,
                );
            }
            Err(err) => return Err(err),
        }
    }

    let (outcome, events) = match (write.op, current) {
        (WriteOp::Create, Some(existing)) => {
            let detail = format!("document {} already exists", existing.doc_id);
            return park(
                tx,
                write,
                ConflictCategory::ValidationRejected,
                &detail,
                Some(&existing),
                now_us,
            );
        }
        (WriteOp::Create, None) => {
            store::stamp_created(&mut fields, &write.actor, now_us);
            let event = store::insert_document(
                tx,
                &write.tenant_id,
                &write.path,
                &write.doc_id,
                fields,
                now_us,
            )?;
            (synced(write, false), vec![event])
        }
        (WriteOp::Update, None) if existed_remotely(tx, write)? => {
            return park(
                tx,
                write,
                ConflictCategory::UpdateToDeletedDocument,
                "document was deleted remotely",
                None,
                now_us,
            );
        }
        (WriteOp::Update, None) => {
            let detail = format!("document {} never reached the server", write.doc_id);
            return park(
                tx,
                write,
                ConflictCategory::ValidationRejected,
                &detail,
                None,
                now_us,
            );
        }
        (WriteOp::Delete, None) => (synced(write, false), Vec::new()),
        (op, Some(existing)) => {
            let stamp = store::next_stamp(tx, now_us)?;
            match lww::decide(existing.stamp, stamp) {
                Verdict::CurrentWins => (
                    SyncOutcome::Superseded {
                        write_id: write.write_id.clone(),
                        doc_id: write.doc_id.clone(),
                    },
                    Vec::new(),
                ),
                Verdict::IncomingWins => {
                    let overwrote = write
                        .base_version
                        .is_some_and(|base| base < existing.version());
                    if overwrote {
                        tracing::info!(
                            doc_id = %existing.doc_id,
                            base = ?write.base_version,
                            remote = existing.version(),
                            "remote changed since the local edit, later write wins"
                        );
                    }
                    let event = if op == WriteOp::Delete {
                        store::delete_or_archive(tx, &existing, &write.actor, stamp)?
                    } else {
                        store::replace_document(tx, &existing, fields, &write.actor, stamp)?
                    };
                    (synced(write, overwrote), vec![event])
                }
            }
        }
    };

    tx.execute(
        "INSERT OR IGNORE INTO applied_writes (write_id, tenant_id, doc_id, applied_at_us) \
         VALUES (?1, ?2, ?3, ?4)",
        params![write.write_id, write.tenant_id, write.doc_id, now_us],
    )?;
    let state = match outcome {
        SyncOutcome::Superseded { .. } => PendingState::Discarded,
        _ => PendingState::Synced,
    };
    pending::set_state(tx, &write.write_id, state)?;

    Ok(Applied { outcome, events })
}

fn was_applied(tx: &Transaction<'_>, write_id: &str) -> Result<bool> {
    Ok(tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM applied_writes WHERE write_id = ?1)",
        [write_id],
        |row| row.get(0),
    )?)
}

/// Whether the document was ever stored: the client read a version of it,
/// a queued write created it, or the audit trail saw it.
fn existed_remotely(tx: &Transaction<'_>, write: &PendingWrite) -> Result<bool> {
    if write.base_version.is_some() {
        return Ok(true);
    }
    Ok(tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM applied_writes WHERE tenant_id = ?1 AND doc_id = ?2) \
             OR EXISTS (SELECT 1 FROM audit_snapshots \
                        WHERE tenant_id = ?1 AND collection_path = ?3 AND doc_id = ?2)",
        params![write.tenant_id, write.doc_id, write.path.to_string()],
        |row| row.get(0),
    )?)
}

fn synced(write: &PendingWrite, overwrote_remote: bool) -> SyncOutcome {
    SyncOutcome::Synced {
        write_id: write.write_id.clone(),
        doc_id: write.doc_id.clone(),
        overwrote_remote,
    }
}

fn park(
    tx: &Transaction<'_>,
    write: &PendingWrite,
    category: ConflictCategory,
    detail: &str,
    remote: Option<&Document>,
    now_us: i64,
) -> Result<Applied> {
    let remote = remote.map(|doc| &doc.fields);
    let conflict_id = conflict::record(tx, write, category, detail, remote, now_us)?;
    Ok(Applied {
        outcome: SyncOutcome::Conflict {
            write_id: write.write_id.clone(),
            conflict_id,
            category,
        },
        events: Vec::new(),
    })
}
