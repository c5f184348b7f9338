//! Sync conflicts: queued writes that could not be applied automatically.
//!
//! A conflict is keyed by the write that caused it, so detecting the same
//! problem again (for example after a retry) refreshes the existing record
//! instead of adding a second one. Records stay in the table after they are
//! resolved; the status says how.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::pending::{self, PendingState, PendingWrite};
use crate::error::{LedgerError, Result};
use crate::model::Fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCategory {
    /// The local write targets a document deleted remotely meanwhile.
    UpdateToDeletedDocument,
    /// The server rejected the body after reconnecting.
    ValidationRejected,
    /// The author is no longer a member of the tenant.
    PermissionDenied,
}

impl ConflictCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpdateToDeletedDocument => "update_to_deleted_document",
            Self::ValidationRejected => "validation_rejected",
            Self::PermissionDenied => "permission_denied",
        }
    }

    /// Wording for the "Sync Issues" list.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::UpdateToDeletedDocument => "update to deleted document",
            Self::ValidationRejected => "rejected by validation",
            Self::PermissionDenied => "permission denied",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "update_to_deleted_document" => Ok(Self::UpdateToDeletedDocument),
            "validation_rejected" => Ok(Self::ValidationRejected),
            "permission_denied" => Ok(Self::PermissionDenied),
            other => Err(LedgerError::InvalidDocument(format!(
                "unknown conflict category '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ConflictCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Discarded,
    Retried,
    Recreated,
}

impl ConflictStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Discarded => "discarded",
            Self::Retried => "retried",
            Self::Recreated => "recreated",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "discarded" => Ok(Self::Discarded),
            "retried" => Ok(Self::Retried),
            "recreated" => Ok(Self::Recreated),
            other => Err(LedgerError::InvalidDocument(format!(
                "unknown conflict status '{other}'"
            ))),
        }
    }
}

/// The three ways a caller can settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Drop the local write.
    Discard,
    /// Resubmit the same write against the current remote state.
    Retry,
    /// Create a fresh entity from the local values, with a new id and number.
    RecreateAsNew,
}

impl FromStr for Resolution {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "retry" => Ok(Self::Retry),
            "recreate" | "recreate-as-new" | "recreate_as_new" => Ok(Self::RecreateAsNew),
            other => Err(LedgerError::InvalidDocument(format!(
                "unknown resolution '{other}': expected discard, retry, or recreate"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub conflict_id: String,
    pub write_id: String,
    pub tenant_id: String,
    pub collection_path: String,
    pub doc_id: String,
    pub category: ConflictCategory,
    pub detail: Option<String>,
    /// Field values of the local write, if it carried any.
    pub local: Option<Fields>,
    /// Remote document state when the conflict was detected.
    pub remote: Option<Fields>,
    pub detected_at_us: i64,
    pub status: ConflictStatus,
    pub resolved_at_us: Option<i64>,
    pub recreated_doc_id: Option<String>,
}

/// Stable conflict id for a write.
#[must_use]
pub fn conflict_id_for(write_id: &str) -> String {
    format!("c-{}", &blake3::hash(write_id.as_bytes()).to_hex().as_str()[..12])
}

/// Record (or refresh) the conflict for `write` and park the write.
///
/// # Errors
///
/// Returns the storage or serialization error.
pub(crate) fn record(
    conn: &Connection,
    write: &PendingWrite,
    category: ConflictCategory,
    detail: &str,
    remote: Option<&Fields>,
    now_us: i64,
) -> Result<String> {
    let conflict_id = conflict_id_for(&write.write_id);
    conn.execute(
        "INSERT INTO sync_conflicts (conflict_id, write_id, tenant_id, collection_path, doc_id, \
         category, detail, local_json, remote_json, detected_at_us, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending') \
         ON CONFLICT (write_id) DO UPDATE SET \
            category = excluded.category, \
            detail = excluded.detail, \
            remote_json = excluded.remote_json, \
            detected_at_us = excluded.detected_at_us, \
            status = 'pending', \
            resolved_at_us = NULL",
        params![
            conflict_id,
            write.write_id,
            write.tenant_id,
            write.path.to_string(),
            write.doc_id,
            category.as_str(),
            detail,
            serde_json::to_string(&write.fields)?,
            remote.map(serde_json::to_string).transpose()?,
            now_us,
        ],
    )?;
    pending::set_state(conn, &write.write_id, PendingState::Conflict)?;

    tracing::warn!(
        conflict_id = %conflict_id,
        write_id = %write.write_id,
        category = category.as_str(),
        path = %write.path,
        doc_id = %write.doc_id,
        detail,
        "sync conflict recorded"
    );
    Ok(conflict_id)
}

/// Close a conflict with its final status.
///
/// # Errors
///
/// Returns the storage error.
pub(crate) fn mark(
    conn: &Connection,
    conflict_id: &str,
    status: ConflictStatus,
    now_us: i64,
    recreated_doc_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_conflicts SET status = ?1, resolved_at_us = ?2, recreated_doc_id = ?3 \
         WHERE conflict_id = ?4",
        params![status.as_str(), now_us, recreated_doc_id, conflict_id],
    )?;
    Ok(())
}

const SELECT_CONFLICT: &str = "SELECT conflict_id, write_id, tenant_id, collection_path, doc_id, \
     category, detail, local_json, remote_json, detected_at_us, status, resolved_at_us, \
     recreated_doc_id FROM sync_conflicts";

/// List conflicts, newest first.
///
/// # Errors
///
/// Returns a storage or decode error.
pub fn list(
    conn: &Connection,
    tenant_id: Option<&str>,
    status: Option<ConflictStatus>,
) -> Result<Vec<SyncConflict>> {
    let sql = format!(
        "{SELECT_CONFLICT} WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR status = ?2) \
         ORDER BY detected_at_us DESC, conflict_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![tenant_id, status.map(ConflictStatus::as_str)],
        RawConflict::from_row,
    )?;

    let mut conflicts = Vec::new();
    for row in rows {
        conflicts.push(row?.decode()?);
    }
    Ok(conflicts)
}

/// # Errors
///
/// Returns a storage or decode error.
pub fn get(conn: &Connection, conflict_id: &str) -> Result<Option<SyncConflict>> {
    conn.query_row(
        &format!("{SELECT_CONFLICT} WHERE conflict_id = ?1"),
        [conflict_id],
        RawConflict::from_row,
    )
    .optional()?
    .map(RawConflict::decode)
    .transpose()
}

struct RawConflict {
    conflict_id: String,
    write_id: String,
    tenant_id: String,
    collection_path: String,
    doc_id: String,
    category: String,
    detail: Option<String>,
    local_json: String,
    remote_json: Option<String>,
    detected_at_us: i64,
    status: String,
    resolved_at_us: Option<i64>,
    recreated_doc_id: Option<String>,
}

impl RawConflict {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conflict_id: row.get(0)?,
            write_id: row.get(1)?,
            tenant_id: row.get(2)?,
            collection_path: row.get(3)?,
            doc_id: row.get(4)?,
            category: row.get(5)?,
            detail: row.get(6)?,
            local_json: row.get(7)?,
            remote_json: row.get(8)?,
            detected_at_us: row.get(9)?,
            status: row.get(10)?,
            resolved_at_us: row.get(11)?,
            recreated_doc_id: row.get(12)?,
        })
    }

    fn decode(self) -> Result<SyncConflict> {
        Ok(SyncConflict {
            category: ConflictCategory::parse(&self.category)?,
            local: serde_json::from_str(&self.local_json)?,
            remote: self
                .remote_json
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
            status: self.status.parse()?,
            conflict_id: self.conflict_id,
            write_id: self.write_id,
            tenant_id: self.tenant_id,
            collection_path: self.collection_path,
            doc_id: self.doc_id,
            detail: self.detail,
            detected_at_us: self.detected_at_us,
            resolved_at_us: self.resolved_at_us,
            recreated_doc_id: self.recreated_doc_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::model::{Actor, CollectionPath, RootCollection};
    use crate::sync::pending::{NewPendingWrite, WriteOp, enqueue};

    fn queued(conn: &mut Connection) -> PendingWrite {
        enqueue(
            conn,
            NewPendingWrite {
                tenant_id: "acme".into(),
                path: CollectionPath::Root(RootCollection::Jobs),
                doc_id: Some("d-gone".into()),
                op: WriteOp::Update,
                fields: Some(Fields::new()),
                base_version: Some(3),
                actor: Actor::new("u-bob", "Bob"),
                client_ts_us: 1,
            },
        )
        .unwrap()
    }

    #[test]
    fn recording_twice_keeps_one_record() {
        let mut conn = open_in_memory().unwrap();
        let write = queued(&mut conn);

        let first = record(
            &conn,
            &write,
            ConflictCategory::UpdateToDeletedDocument,
            "gone",
            None,
            10,
        )
        .unwrap();
        let second = record(
            &conn,
            &write,
            ConflictCategory::UpdateToDeletedDocument,
            "still gone",
            None,
            20,
        )
        .unwrap();
        assert_eq!(first, second);

        let all = list(&conn, Some("acme"), None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].detail.as_deref(), Some("still gone"));
        assert_eq!(all[0].detected_at_us, 20);
        assert_eq!(all[0].local, Some(Fields::new()));

        let parked = pending::get(&conn, &write.write_id).unwrap().unwrap();
        assert_eq!(parked.state, PendingState::Conflict);
    }

    #[test]
    fn mark_closes_and_filters() {
        let mut conn = open_in_memory().unwrap();
        let write = queued(&mut conn);
        let id = record(&conn, &write, ConflictCategory::ValidationRejected, "bad", None, 5).unwrap();

        mark(&conn, &id, ConflictStatus::Discarded, 6, None).unwrap();
        assert!(list(&conn, None, Some(ConflictStatus::Pending)).unwrap().is_empty());

        let closed = get(&conn, &id).unwrap().unwrap();
        assert_eq!(closed.status, ConflictStatus::Discarded);
        assert_eq!(closed.resolved_at_us, Some(6));
        assert!(list(&conn, Some("globex"), None).unwrap().is_empty());
    }

    #[test]
    fn resolution_names_parse() {
        assert_eq!("discard".parse::<Resolution>().unwrap(), Resolution::Discard);
        assert_eq!("Retry".parse::<Resolution>().unwrap(), Resolution::Retry);
        assert_eq!(
            "recreate".parse::<Resolution>().unwrap(),
            Resolution::RecreateAsNew
        );
        assert!("merge".parse::<Resolution>().is_err());
    }
}
