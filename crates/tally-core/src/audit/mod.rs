//! Audit trail for monitored collections.
//!
//! Every committed mutation on a monitored collection produces one snapshot
//! holding the full before/after document states, the author copied from
//! the document's `updatedBy`/`createdBy` metadata, a server timestamp and
//! an expiry instant. Snapshot ids are derived from the event, so a
//! re-delivered event writes nothing new.
//!
//! Recording happens after the originating write has committed and its
//! failures are only logged: the business write is never rolled back or
//! delayed by the audit trail.

pub mod query;
pub mod retention;

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::config::AuditConfig;
use crate::dispatch::Subscriber;
use crate::error::{LedgerError, Result};
use crate::event::{MutationEvent, MutationKind};
use crate::model::document::author_of;
use crate::model::{Actor, Fields};
use crate::store::Store;

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSnapshot {
    pub snapshot_id: String,
    pub tenant_id: String,
    pub operation: MutationKind,
    pub collection: String,
    pub collection_path: String,
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub ts_us: i64,
    pub write_seq: i64,
    pub author: Option<Actor>,
    pub before: Option<Fields>,
    pub after: Option<Fields>,
    pub expires_at_us: i64,
}

impl AuditSnapshot {
    /// Build the snapshot for `event` observed at server time `now_us`.
    #[must_use]
    pub fn from_event(event: &MutationEvent, now_us: i64, retention_us: i64) -> Self {
        // Deletes carry no after-state; the last author is on the before-state.
        let author = match event.kind {
            MutationKind::Delete => event.before.as_ref().and_then(author_of),
            MutationKind::Create | MutationKind::Update => event.after.as_ref().and_then(author_of),
        };
        Self {
            snapshot_id: event.event_id(),
            tenant_id: event.tenant_id.clone(),
            operation: event.kind,
            collection: event.path.collection().to_string(),
            collection_path: event.path.to_string(),
            doc_id: event.doc_id.clone(),
            parent_id: event.path.parent_id().map(str::to_string),
            ts_us: now_us,
            write_seq: event.stamp.write_seq,
            author,
            before: event.before.clone(),
            after: event.after.clone(),
            expires_at_us: now_us.saturating_add(retention_us),
        }
    }
}

/// Insert a snapshot unless one with the same id exists.
///
/// Returns `true` if a row was written.
///
/// # Errors
///
/// Returns the storage or serialization error.
pub fn insert_snapshot(conn: &Connection, snapshot: &AuditSnapshot) -> Result<bool> {
    let to_json = |fields: &Option<Fields>| -> Result<Option<String>> {
        Ok(fields.as_ref().map(serde_json::to_string).transpose()?)
    };
    let author_json = snapshot
        .author
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO audit_snapshots (snapshot_id, tenant_id, operation, collection, \
         collection_path, doc_id, parent_id, ts_us, write_seq, author_json, before_json, \
         after_json, expires_at_us) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            snapshot.snapshot_id,
            snapshot.tenant_id,
            snapshot.operation.as_str(),
            snapshot.collection,
            snapshot.collection_path,
            snapshot.doc_id,
            snapshot.parent_id,
            snapshot.ts_us,
            snapshot.write_seq,
            author_json,
            to_json(&snapshot.before)?,
            to_json(&snapshot.after)?,
            snapshot.expires_at_us,
        ],
    )?;
    Ok(inserted > 0)
}

/// Captures snapshots for the configured collections.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    config: AuditConfig,
}

impl AuditRecorder {
    #[must_use]
    pub const fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Persist the snapshot for `event`.
    ///
    /// Returns `None` for unmonitored collections and for events already
    /// recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AuditWriteFailure`] if the insert fails.
    pub fn record(&self, store: &Store, event: &MutationEvent) -> Result<Option<AuditSnapshot>> {
        if !self.config.is_monitored(event.path.collection()) {
            return Ok(None);
        }

        let snapshot =
            AuditSnapshot::from_event(event, store.now_us(), self.config.retention_us());
        match insert_snapshot(store.conn(), &snapshot) {
            Ok(true) => {
                tracing::debug!(
                    snapshot_id = %snapshot.snapshot_id,
                    operation = %snapshot.operation,
                    path = %snapshot.collection_path,
                    doc_id = %snapshot.doc_id,
                    "recorded audit snapshot"
                );
                Ok(Some(snapshot))
            }
            Ok(false) => {
                tracing::debug!(snapshot_id = %snapshot.snapshot_id, "audit snapshot already recorded");
                Ok(None)
            }
            Err(err) => Err(LedgerError::AuditWriteFailure {
                doc_id: event.doc_id.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

impl Subscriber for AuditRecorder {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn on_mutation(&self, store: &mut Store, event: &MutationEvent) -> Result<Vec<MutationEvent>> {
        if let Err(err) = self.record(store, event) {
            tracing::error!(
                code = %err.code(),
                operation = %event.kind,
                path = %event.path,
                doc_id = %event.doc_id,
                error = %err,
                "audit snapshot lost"
            );
        }
        Ok(Vec::new())
    }
}
