//! Document write path.
//!
//! Every write runs in one immediate transaction through
//! [`SequenceAllocator::run`], bumps the store-wide write sequence, and
//! returns the [`MutationEvent`] describing the commit. Publishing that event
//! is the caller's job (see [`crate::ledger::Ledger`]), so nothing a
//! subscriber does can fail or delay the write itself.
//!
//! Sequence fields belong to the allocator: they are stripped from client
//! bodies, set once (online create or backfill), and carried forward
//! unchanged by every later replacement.

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::clock::{ServerClock, SystemClock};
use crate::config::LedgerConfig;
use crate::db;
use crate::error::{LedgerError, Result};
use crate::event::{MutationEvent, MutationKind};
use crate::model::document::{
    CREATED_AT, CREATED_BY, STATUS, UPDATED_AT, UPDATED_BY, strip_reserved, validate_fields,
};
use crate::model::{Actor, CollectionPath, Document, Fields, JobStatus, RootCollection, WriteStamp};
use crate::sequence::{self, SequenceAllocator, SequenceKey};

/// SQLite-backed ledger store.
pub struct Store {
    conn: Connection,
    clock: Arc<dyn ServerClock>,
    config: LedgerConfig,
    allocator: SequenceAllocator,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, config: LedgerConfig) -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::open_store(path)?, config))
    }

    /// In-memory store for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn in_memory(config: LedgerConfig) -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::open_in_memory()?, config))
    }

    #[must_use]
    pub fn from_connection(conn: Connection, config: LedgerConfig) -> Self {
        let allocator = SequenceAllocator::from_config(&config.sequence);
        Self {
            conn,
            clock: Arc::new(SystemClock),
            config,
            allocator,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ServerClock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub const fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    #[must_use]
    pub const fn allocator(&self) -> SequenceAllocator {
        self.allocator
    }

    /// Allocate the next number for `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`SequenceAllocator::allocate`].
    pub fn allocate(&mut self, key: &SequenceKey) -> Result<i64> {
        let now = self.now_us();
        self.allocator.allocate(&mut self.conn, key, now)
    }

    /// Create a document with its sequence number assigned in the same
    /// transaction (connected client path).
    ///
    /// # Errors
    ///
    /// Returns a validation error, a missing-parent error, or an allocation
    /// failure. On any error nothing is committed.
    pub fn create_online(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        mut fields: Fields,
        actor: &Actor,
    ) -> Result<MutationEvent> {
        prepare_body(path, &mut fields)?;
        let now = self.now_us();
        let doc_id = new_doc_id(tenant_id, path, now);
        let spec = path.sequence();
        let key = SequenceKey::new(tenant_id, spec.scope_id(tenant_id), spec.sequence_name.clone());

        let event = self.allocator.run(&mut self.conn, &key, |tx| {
            ensure_parent(tx, tenant_id, path)?;
            let number = sequence::allocate_in(tx, &key, now)?;
            let mut body = fields.clone();
            body.insert(spec.field.to_string(), Value::from(number));
            stamp_created(&mut body, actor, now);
            insert_document(tx, tenant_id, path, &doc_id, body, now)
        })?;

        tracing::info!(
            tenant = tenant_id,
            path = %path,
            doc_id = %event.doc_id,
            "created document online"
        );
        Ok(event)
    }

    /// Create a document without its sequence field (disconnected client
    /// path). The backfill resolver assigns the number afterwards.
    ///
    /// # Errors
    ///
    /// Returns a validation or missing-parent error, or
    /// [`LedgerError::InvalidDocument`] when `doc_id` is already taken.
    pub fn create_offline(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: Option<&str>,
        mut fields: Fields,
        actor: &Actor,
    ) -> Result<MutationEvent> {
        prepare_body(path, &mut fields)?;
        let now = self.now_us();
        let doc_id = doc_id.map_or_else(|| new_doc_id(tenant_id, path, now), str::to_string);
        let label = format!("{path}/{doc_id}");

        self.allocator.run(&mut self.conn, &label, |tx| {
            ensure_parent(tx, tenant_id, path)?;
            let mut body = fields.clone();
            stamp_created(&mut body, actor, now);
            insert_document(tx, tenant_id, path, &doc_id, body, now)
        })
    }

    /// Replace a document's body wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DocumentNotFound`] or a validation error.
    pub fn update(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
        mut fields: Fields,
        actor: &Actor,
    ) -> Result<MutationEvent> {
        prepare_body(path, &mut fields)?;
        let now = self.now_us();
        let label = format!("{path}/{doc_id}");

        self.allocator.run(&mut self.conn, &label, |tx| {
            let current = load(tx, tenant_id, path, doc_id)?
                .ok_or_else(|| not_found(path, doc_id))?;
            let stamp = next_stamp(tx, now)?;
            replace_document(tx, &current, fields.clone(), actor, stamp)
        })
    }

    /// Delete a document. Jobs are never removed: they move to `archived`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DocumentNotFound`] if the document is absent.
    pub fn delete(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
        actor: &Actor,
    ) -> Result<MutationEvent> {
        let now = self.now_us();
        let label = format!("{path}/{doc_id}");

        self.allocator.run(&mut self.conn, &label, |tx| {
            let current = load(tx, tenant_id, path, doc_id)?
                .ok_or_else(|| not_found(path, doc_id))?;
            let stamp = next_stamp(tx, now)?;
            delete_or_archive(tx, &current, actor, stamp)
        })
    }

    /// Write `value` into the document's sequence field unless it already
    /// has one. The presence check and the write share one transaction.
    ///
    /// Returns `None` when the field was already set.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DocumentNotFound`] or a storage error.
    pub fn set_sequence_if_absent(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
        value: i64,
    ) -> Result<Option<MutationEvent>> {
        let now = self.now_us();
        let field = path.sequence().field;
        let label = format!("{path}/{doc_id}#{field}");

        self.allocator.run(&mut self.conn, &label, |tx| {
            let current = load(tx, tenant_id, path, doc_id)?
                .ok_or_else(|| not_found(path, doc_id))?;
            if current.fields.get(field).is_some_and(|v| !v.is_null()) {
                return Ok(None);
            }

            let mut body = current.fields.clone();
            body.insert(field.to_string(), Value::from(value));
            let stamp = next_stamp(tx, now)?;
            write_body(tx, &current, &body, stamp)?;
            Ok(Some(MutationEvent {
                kind: MutationKind::Update,
                tenant_id: current.tenant_id.clone(),
                path: current.path.clone(),
                doc_id: current.doc_id.clone(),
                before: Some(current.fields),
                after: Some(body),
                stamp,
            }))
        })
    }

    /// Fetch one document.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub fn get(
        &self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
    ) -> Result<Option<Document>> {
        load(&self.conn, tenant_id, path, doc_id)
    }

    /// List a collection in creation order.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub fn list(&self, tenant_id: &str, path: &CollectionPath) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, collection_path, doc_id, body_json, server_ts_us, write_seq, \
             created_at_us \
             FROM documents WHERE tenant_id = ?1 AND collection_path = ?2 \
             ORDER BY created_at_us ASC, write_seq ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id, path.to_string()], RawDocument::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?.into_document()?);
        }
        Ok(docs)
    }
}

// ---------------------------------------------------------------------------
// Transaction-level building blocks (shared with reconciliation)
// ---------------------------------------------------------------------------

/// Strip allocator/metadata fields from client input, then validate it.
pub(crate) fn prepare_body(path: &CollectionPath, fields: &mut Fields) -> Result<()> {
    let dropped = strip_reserved(fields);
    if !dropped.is_empty() {
        tracing::debug!(path = %path, ?dropped, "ignoring reserved fields in client body");
    }
    validate_fields(path, fields)
}

/// Job subcollection writes need their parent job to exist.
pub(crate) fn ensure_parent(conn: &Connection, tenant_id: &str, path: &CollectionPath) -> Result<()> {
    let Some(job_id) = path.parent_id() else {
        return Ok(());
    };
    let jobs = CollectionPath::Root(RootCollection::Jobs);
    if load(conn, tenant_id, &jobs, job_id)?.is_none() {
        return Err(LedgerError::InvalidDocument(format!(
            "parent job '{job_id}' does not exist"
        )));
    }
    Ok(())
}

pub(crate) fn load(
    conn: &Connection,
    tenant_id: &str,
    path: &CollectionPath,
    doc_id: &str,
) -> Result<Option<Document>> {
    let raw = conn
        .query_row(
            "SELECT tenant_id, collection_path, doc_id, body_json, server_ts_us, write_seq, \
             created_at_us \
             FROM documents WHERE tenant_id = ?1 AND collection_path = ?2 AND doc_id = ?3",
            params![tenant_id, path.to_string(), doc_id],
            RawDocument::from_row,
        )
        .optional()?;
    raw.map(RawDocument::into_document).transpose()
}

pub(crate) fn next_stamp(tx: &Transaction<'_>, now_us: i64) -> Result<WriteStamp> {
    Ok(WriteStamp {
        server_ts_us: now_us,
        write_seq: db::next_write_seq(tx)?,
    })
}

pub(crate) fn insert_document(
    tx: &Transaction<'_>,
    tenant_id: &str,
    path: &CollectionPath,
    doc_id: &str,
    body: Fields,
    now_us: i64,
) -> Result<MutationEvent> {
    if load(tx, tenant_id, path, doc_id)?.is_some() {
        return Err(LedgerError::InvalidDocument(format!(
            "document '{doc_id}' already exists in {path}"
        )));
    }

    let stamp = next_stamp(tx, now_us)?;
    tx.execute(
        "INSERT INTO documents (tenant_id, collection_path, doc_id, parent_id, body_json, \
         server_ts_us, write_seq, created_at_us) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            tenant_id,
            path.to_string(),
            doc_id,
            path.parent_id(),
            serde_json::to_string(&body)?,
            stamp.server_ts_us,
            stamp.write_seq,
            now_us,
        ],
    )?;

    Ok(MutationEvent {
        kind: MutationKind::Create,
        tenant_id: tenant_id.to_string(),
        path: path.clone(),
        doc_id: doc_id.to_string(),
        before: None,
        after: Some(body),
        stamp,
    })
}

/// Whole-document replacement. The sequence field and creation metadata of
/// `current` survive; everything else comes from `body`.
pub(crate) fn replace_document(
    tx: &Transaction<'_>,
    current: &Document,
    mut body: Fields,
    actor: &Actor,
    stamp: WriteStamp,
) -> Result<MutationEvent> {
    let field = current.path.sequence().field;
    for carried in [field, CREATED_AT, CREATED_BY] {
        if let Some(value) = current.fields.get(carried) {
            body.insert(carried.to_string(), value.clone());
        }
    }
    body.insert(UPDATED_AT.to_string(), Value::from(stamp.server_ts_us));
    body.insert(UPDATED_BY.to_string(), serde_json::to_value(actor)?);

    write_body(tx, current, &body, stamp)?;
    Ok(MutationEvent {
        kind: MutationKind::Update,
        tenant_id: current.tenant_id.clone(),
        path: current.path.clone(),
        doc_id: current.doc_id.clone(),
        before: Some(current.fields.clone()),
        after: Some(body),
        stamp,
    })
}

/// Physical delete, or the archive transition for jobs.
pub(crate) fn delete_or_archive(
    tx: &Transaction<'_>,
    current: &Document,
    actor: &Actor,
    stamp: WriteStamp,
) -> Result<MutationEvent> {
    if current.path.is_jobs() {
        let mut body = current.fields.clone();
        body.insert(
            STATUS.to_string(),
            Value::from(JobStatus::Archived.as_str()),
        );
        return replace_document(tx, current, body, actor, stamp);
    }

    tx.execute(
        "DELETE FROM documents WHERE tenant_id = ?1 AND collection_path = ?2 AND doc_id = ?3",
        params![
            current.tenant_id,
            current.path.to_string(),
            current.doc_id
        ],
    )?;
    Ok(MutationEvent {
        kind: MutationKind::Delete,
        tenant_id: current.tenant_id.clone(),
        path: current.path.clone(),
        doc_id: current.doc_id.clone(),
        before: Some(current.fields.clone()),
        after: None,
        stamp,
    })
}

fn write_body(tx: &Transaction<'_>, current: &Document, body: &Fields, stamp: WriteStamp) -> Result<()> {
    tx.execute(
        "UPDATE documents SET body_json = ?1, server_ts_us = ?2, write_seq = ?3 \
         WHERE tenant_id = ?4 AND collection_path = ?5 AND doc_id = ?6",
        params![
            serde_json::to_string(body)?,
            stamp.server_ts_us,
            stamp.write_seq,
            current.tenant_id,
            current.path.to_string(),
            current.doc_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn stamp_created(body: &mut Fields, actor: &Actor, now_us: i64) {
    let who = serde_json::to_value(actor).unwrap_or(Value::Null);
    body.insert(CREATED_AT.to_string(), Value::from(now_us));
    body.insert(CREATED_BY.to_string(), who.clone());
    body.insert(UPDATED_AT.to_string(), Value::from(now_us));
    body.insert(UPDATED_BY.to_string(), who);
}

fn not_found(path: &CollectionPath, doc_id: &str) -> LedgerError {
    LedgerError::DocumentNotFound {
        path: path.to_string(),
        doc_id: doc_id.to_string(),
    }
}

/// Fresh document id: `d-` plus 12 hex chars of a salted blake3 hash.
#[must_use]
pub fn new_doc_id(tenant_id: &str, path: &CollectionPath, now_us: i64) -> String {
    let nonce: u64 = rand::random();
    let input = format!("{tenant_id}\t{path}\t{now_us}\t{nonce}");
    let hex = blake3::hash(input.as_bytes()).to_hex();
    format!("d-{}", &hex.as_str()[..12])
}

struct RawDocument {
    tenant_id: String,
    collection_path: String,
    doc_id: String,
    body_json: String,
    server_ts_us: i64,
    write_seq: i64,
    created_at_us: i64,
}

impl RawDocument {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            collection_path: row.get(1)?,
            doc_id: row.get(2)?,
            body_json: row.get(3)?,
            server_ts_us: row.get(4)?,
            write_seq: row.get(5)?,
            created_at_us: row.get(6)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        Ok(Document {
            path: self.collection_path.parse()?,
            fields: serde_json::from_str(&self.body_json)?,
            tenant_id: self.tenant_id,
            doc_id: self.doc_id,
            stamp: WriteStamp {
                server_ts_us: self.server_ts_us,
                write_seq: self.write_seq,
            },
            created_at_us: self.created_at_us,
        })
    }
}
