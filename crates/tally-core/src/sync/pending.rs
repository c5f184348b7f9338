//! Outbox of writes made while disconnected.
//!
//! Each entry records what the client did locally (create, whole-document
//! update, delete), the document version it was computed against, and the
//! client's own clock reading. The client clock is kept for display only;
//! ordering against remote writes always uses server stamps assigned when
//! the entry is reconciled.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::db;
use crate::error::{LedgerError, Result};
use crate::model::{Actor, CollectionPath, Fields};
use crate::store::new_doc_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteOp {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(LedgerError::InvalidDocument(format!("unknown write op '{other}'"))),
        }
    }
}

/// Lifecycle of a queued write: `pending -> synced | conflict`, and
/// `conflict -> pending | discarded` through resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingState {
    Pending,
    Synced,
    Conflict,
    Discarded,
}

impl PendingState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Discarded => "discarded",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "discarded" => Ok(Self::Discarded),
            other => Err(LedgerError::InvalidDocument(format!(
                "unknown pending state '{other}'"
            ))),
        }
    }
}

impl FromStr for PendingState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PendingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub write_id: String,
    pub tenant_id: String,
    #[serde(serialize_with = "serialize_path")]
    pub path: CollectionPath,
    pub doc_id: String,
    pub op: WriteOp,
    pub fields: Option<Fields>,
    /// Document version (`write_seq`) the client last saw.
    pub base_version: Option<i64>,
    pub actor: Actor,
    pub queued_at_us: i64,
    pub queue_seq: i64,
    pub state: PendingState,
}

fn serialize_path<S: serde::Serializer>(path: &CollectionPath, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}

/// Input for [`enqueue`].
#[derive(Debug, Clone)]
pub struct NewPendingWrite {
    pub tenant_id: String,
    pub path: CollectionPath,
    /// Required for update/delete; generated for creates when absent.
    pub doc_id: Option<String>,
    pub op: WriteOp,
    pub fields: Option<Fields>,
    pub base_version: Option<i64>,
    pub actor: Actor,
    /// Client clock reading at the time of the local write.
    pub client_ts_us: i64,
}

/// Append a write to the outbox.
///
/// The queue position is read and the row inserted under one write lock, so
/// concurrent writers never share a position.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidDocument`] if an update/delete has no
/// document id or a create/update has no fields.
pub fn enqueue(conn: &mut Connection, write: NewPendingWrite) -> Result<PendingWrite> {
    let doc_id = match (write.op, write.doc_id) {
        (_, Some(id)) => id,
        (WriteOp::Create, None) => new_doc_id(&write.tenant_id, &write.path, write.client_ts_us),
        (op, None) => {
            return Err(LedgerError::InvalidDocument(format!(
                "a queued {op} needs a document id"
            )));
        }
    };
    if write.op != WriteOp::Delete && write.fields.is_none() {
        return Err(LedgerError::InvalidDocument(format!(
            "a queued {} needs fields",
            write.op
        )));
    }

    let tx = db::begin_write(conn)?;
    let queue_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(queue_seq), 0) + 1 FROM pending_writes",
        [],
        |row| row.get(0),
    )?;
    let nonce: u64 = rand::random();
    let write_id = format!(
        "w-{}",
        &blake3::hash(format!("{}\t{doc_id}\t{queue_seq}\t{nonce}", write.tenant_id).as_bytes())
            .to_hex()
            .as_str()[..16]
    );

    let pending = PendingWrite {
        write_id,
        tenant_id: write.tenant_id,
        path: write.path,
        doc_id,
        op: write.op,
        fields: write.fields,
        base_version: write.base_version,
        actor: write.actor,
        queued_at_us: write.client_ts_us,
        queue_seq,
        state: PendingState::Pending,
    };

    tx.execute(
        "INSERT INTO pending_writes (write_id, tenant_id, collection_path, doc_id, op, \
         fields_json, base_version, actor_json, queued_at_us, queue_seq, state) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending')",
        params![
            pending.write_id,
            pending.tenant_id,
            pending.path.to_string(),
            pending.doc_id,
            pending.op.as_str(),
            pending.fields.as_ref().map(serde_json::to_string).transpose()?,
            pending.base_version,
            serde_json::to_string(&pending.actor)?,
            pending.queued_at_us,
            pending.queue_seq,
        ],
    )?;
    tx.commit()?;

    tracing::debug!(
        write_id = %pending.write_id,
        op = %pending.op,
        path = %pending.path,
        doc_id = %pending.doc_id,
        "queued offline write"
    );
    Ok(pending)
}

const SELECT_PENDING: &str = "SELECT write_id, tenant_id, collection_path, doc_id, op, \
     fields_json, base_version, actor_json, queued_at_us, queue_seq, state FROM pending_writes";

/// Entries in `state`, oldest first.
///
/// # Errors
///
/// Returns a storage or decode error.
pub fn list(conn: &Connection, state: Option<PendingState>) -> Result<Vec<PendingWrite>> {
    let sql = match state {
        Some(_) => format!("{SELECT_PENDING} WHERE state = ?1 ORDER BY queue_seq"),
        None => format!("{SELECT_PENDING} ORDER BY queue_seq"),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = match state {
        Some(state) => stmt.query_map([state.as_str()], RawPending::from_row)?,
        None => stmt.query_map([], RawPending::from_row)?,
    };

    let mut writes = Vec::new();
    for row in rows {
        writes.push(row?.decode()?);
    }
    Ok(writes)
}

/// # Errors
///
/// Returns a storage or decode error.
pub fn get(conn: &Connection, write_id: &str) -> Result<Option<PendingWrite>> {
    conn.query_row(
        &format!("{SELECT_PENDING} WHERE write_id = ?1"),
        [write_id],
        RawPending::from_row,
    )
    .optional()?
    .map(RawPending::decode)
    .transpose()
}

/// # Errors
///
/// Returns the storage error.
pub fn set_state(conn: &Connection, write_id: &str, state: PendingState) -> Result<()> {
    conn.execute(
        "UPDATE pending_writes SET state = ?1 WHERE write_id = ?2",
        params![state.as_str(), write_id],
    )?;
    Ok(())
}

/// Point a write at a new base version before it is retried.
///
/// # Errors
///
/// Returns the storage error.
pub fn rebase(conn: &Connection, write_id: &str, base_version: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE pending_writes SET base_version = ?1, state = 'pending' WHERE write_id = ?2",
        params![base_version, write_id],
    )?;
    Ok(())
}

/// The earliest write on the same document, queued before `write`, that is
/// still waiting for conflict resolution.
///
/// # Errors
///
/// Returns the storage error.
pub fn blocked_by(conn: &Connection, write: &PendingWrite) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT write_id FROM pending_writes \
             WHERE tenant_id = ?1 AND collection_path = ?2 AND doc_id = ?3 \
               AND state = 'conflict' AND queue_seq < ?4 \
             ORDER BY queue_seq LIMIT 1",
            params![
                write.tenant_id,
                write.path.to_string(),
                write.doc_id,
                write.queue_seq
            ],
            |row| row.get(0),
        )
        .optional()?)
}

/// Move the still-pending writes queued after `write` on the same document
/// over to `new_doc_id`. Returns how many were moved.
///
/// # Errors
///
/// Returns the storage error.
pub fn rebind(conn: &Connection, write: &PendingWrite, new_doc_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pending_writes SET doc_id = ?1 \
         WHERE tenant_id = ?2 AND collection_path = ?3 AND doc_id = ?4 \
           AND state = 'pending' AND queue_seq > ?5",
        params![
            new_doc_id,
            write.tenant_id,
            write.path.to_string(),
            write.doc_id,
            write.queue_seq
        ],
    )?)
}

struct RawPending {
    write_id: String,
    tenant_id: String,
    collection_path: String,
    doc_id: String,
    op: String,
    fields_json: Option<String>,
    base_version: Option<i64>,
    actor_json: String,
    queued_at_us: i64,
    queue_seq: i64,
    state: String,
}

impl RawPending {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            write_id: row.get(0)?,
            tenant_id: row.get(1)?,
            collection_path: row.get(2)?,
            doc_id: row.get(3)?,
            op: row.get(4)?,
            fields_json: row.get(5)?,
            base_version: row.get(6)?,
            actor_json: row.get(7)?,
            queued_at_us: row.get(8)?,
            queue_seq: row.get(9)?,
            state: row.get(10)?,
        })
    }

    fn decode(self) -> Result<PendingWrite> {
        Ok(PendingWrite {
            path: self.collection_path.parse()?,
            op: self.op.parse()?,
            fields: self
                .fields_json
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
            actor: serde_json::from_str(&self.actor_json)?,
            state: PendingState::parse(&self.state)?,
            write_id: self.write_id,
            tenant_id: self.tenant_id,
            doc_id: self.doc_id,
            base_version: self.base_version,
            queued_at_us: self.queued_at_us,
            queue_seq: self.queue_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::model::RootCollection;

    fn new_write(op: WriteOp, doc_id: Option<&str>) -> NewPendingWrite {
        NewPendingWrite {
            tenant_id: "acme".into(),
            path: CollectionPath::Root(RootCollection::Jobs),
            doc_id: doc_id.map(str::to_string),
            op,
            fields: (op != WriteOp::Delete).then(Fields::new),
            base_version: None,
            actor: Actor::new("u-bob", "Bob"),
            client_ts_us: 42,
        }
    }

    #[test]
    fn enqueue_assigns_ids_and_order() {
        let mut conn = open_in_memory().unwrap();
        let first = enqueue(&mut conn, new_write(WriteOp::Create, None)).unwrap();
        let second = enqueue(&mut conn, new_write(WriteOp::Delete, Some("d-x"))).unwrap();

        assert!(first.doc_id.starts_with("d-"));
        assert!(first.write_id.starts_with("w-"));
        assert_eq!(first.queue_seq, 1);
        assert_eq!(second.queue_seq, 2);
        assert_eq!(first.queued_at_us, 42);

        let listed = list(&conn, Some(PendingState::Pending)).unwrap();
        assert_eq!(listed, vec![first.clone(), second]);
        assert_eq!(get(&conn, &first.write_id).unwrap(), Some(first));
    }

    #[test]
    fn update_requires_doc_id() {
        let mut conn = open_in_memory().unwrap();
        let err = enqueue(&mut conn, new_write(WriteOp::Update, None)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDocument(_)));
    }

    #[test]
    fn concurrent_enqueues_get_distinct_positions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.sqlite3");
        drop(crate::db::open_store(&path).unwrap());

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut conn = crate::db::open_store(&path).unwrap();
                    (0..20)
                        .map(|_| {
                            enqueue(&mut conn, new_write(WriteOp::Create, None))
                                .unwrap()
                                .queue_seq
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seqs: Vec<i64> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
    }

    #[test]
    fn blocked_by_and_rebind_follow_queue_order() {
        let mut conn = open_in_memory().unwrap();
        let create = enqueue(&mut conn, new_write(WriteOp::Create, Some("d-1"))).unwrap();
        let update = enqueue(&mut conn, new_write(WriteOp::Update, Some("d-1"))).unwrap();
        let other = enqueue(&mut conn, new_write(WriteOp::Update, Some("d-2"))).unwrap();
        assert_eq!(blocked_by(&conn, &update).unwrap(), None);

        set_state(&conn, &create.write_id, PendingState::Conflict).unwrap();
        assert_eq!(blocked_by(&conn, &update).unwrap(), Some(create.write_id.clone()));
        assert_eq!(blocked_by(&conn, &create).unwrap(), None);
        assert_eq!(blocked_by(&conn, &other).unwrap(), None);

        assert_eq!(rebind(&conn, &create, "d-9").unwrap(), 1);
        let moved = get(&conn, &update.write_id).unwrap().unwrap();
        assert_eq!(moved.doc_id, "d-9");
        assert_eq!(get(&conn, &other.write_id).unwrap().unwrap().doc_id, "d-2");
    }

    #[test]
    fn state_transitions_filter_listing() {
        let mut conn = open_in_memory().unwrap();
        let write = enqueue(&mut conn, new_write(WriteOp::Update, Some("d-1"))).unwrap();
        set_state(&conn, &write.write_id, PendingState::Conflict).unwrap();
        assert!(list(&conn, Some(PendingState::Pending)).unwrap().is_empty());

        rebase(&conn, &write.write_id, Some(9)).unwrap();
        let back = get(&conn, &write.write_id).unwrap().unwrap();
        assert_eq!(back.state, PendingState::Pending);
        assert_eq!(back.base_version, Some(9));
        assert_eq!(list(&conn, None).unwrap().len(), 1);
    }
}
