//! Read-only audit queries.
//!
//! Snapshots are listed newest first (server timestamp, then commit order)
//! and filtered by collection, operation, author and a half-open time range.

use anyhow::{Context, Result};
use rusqlite::{Connection, params_from_iter};

use super::AuditSnapshot;
use crate::event::MutationKind;
use crate::model::{Actor, Fields};

/// Filter for [`list_snapshots`]. Only `tenant_id` is required.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant_id: String,
    /// Leaf collection name (`jobs`, `costs`, ...).
    pub collection: Option<String>,
    /// Restrict to one document.
    pub doc_id: Option<String>,
    pub operation: Option<MutationKind>,
    /// Author caller id.
    pub author: Option<String>,
    /// Inclusive lower bound on the snapshot timestamp.
    pub since_us: Option<i64>,
    /// Exclusive upper bound on the snapshot timestamp.
    pub until_us: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(self.tenant_id.clone())];
        let mut conditions = vec!["tenant_id = ?1".to_string()];

        if let Some(ref collection) = self.collection {
            param_values.push(Box::new(collection.clone()));
            conditions.push(format!("collection = ?{}", param_values.len()));
        }
        if let Some(ref doc_id) = self.doc_id {
            param_values.push(Box::new(doc_id.clone()));
            conditions.push(format!("doc_id = ?{}", param_values.len()));
        }
        if let Some(operation) = self.operation {
            param_values.push(Box::new(operation.as_str()));
            conditions.push(format!("operation = ?{}", param_values.len()));
        }
        if let Some(ref author) = self.author {
            param_values.push(Box::new(author.clone()));
            conditions.push(format!(
                "json_extract(author_json, '$.callerId') = ?{}",
                param_values.len()
            ));
        }
        if let Some(since) = self.since_us {
            param_values.push(Box::new(since));
            conditions.push(format!("ts_us >= ?{}", param_values.len()));
        }
        if let Some(until) = self.until_us {
            param_values.push(Box::new(until));
            conditions.push(format!("ts_us < ?{}", param_values.len()));
        }

        (format!(" WHERE {}", conditions.join(" AND ")), param_values)
    }
}

/// List snapshots matching `filter`, newest first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored row cannot be decoded.
pub fn list_snapshots(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditSnapshot>> {
    let (where_clause, param_values) = filter.where_clause();

    let limit_clause = match (filter.limit, filter.offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
        (Some(limit), None) => format!(" LIMIT {limit}"),
        (None, Some(offset)) => format!(" LIMIT -1 OFFSET {offset}"),
        (None, None) => String::new(),
    };

    let sql = format!(
        "SELECT snapshot_id, tenant_id, operation, collection, collection_path, doc_id, \
         parent_id, ts_us, write_seq, author_json, before_json, after_json, expires_at_us \
         FROM audit_snapshots{where_clause} \
         ORDER BY ts_us DESC, write_seq DESC{limit_clause}"
    );

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("prepare list_snapshots query: {sql}"))?;
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(AsRef::as_ref).collect();

    let rows = stmt
        .query_map(params_from_iter(params_ref), RawSnapshot::from_row)
        .context("execute list_snapshots query")?;

    let mut snapshots = Vec::new();
    for row in rows {
        let raw = row.context("read list_snapshots row")?;
        snapshots.push(raw.decode()?);
    }
    Ok(snapshots)
}

/// Count snapshots matching `filter`, ignoring its pagination.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_snapshots(conn: &Connection, filter: &AuditFilter) -> Result<i64> {
    let (where_clause, param_values) = filter.where_clause();
    let sql = format!("SELECT COUNT(*) FROM audit_snapshots{where_clause}");
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(AsRef::as_ref).collect();

    conn.query_row(&sql, params_from_iter(params_ref), |row| row.get(0))
        .context("count audit snapshots")
}

struct RawSnapshot {
    snapshot_id: String,
    tenant_id: String,
    operation: String,
    collection: String,
    collection_path: String,
    doc_id: String,
    parent_id: Option<String>,
    ts_us: i64,
    write_seq: i64,
    author_json: Option<String>,
    before_json: Option<String>,
    after_json: Option<String>,
    expires_at_us: i64,
}

impl RawSnapshot {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            snapshot_id: row.get(0)?,
            tenant_id: row.get(1)?,
            operation: row.get(2)?,
            collection: row.get(3)?,
            collection_path: row.get(4)?,
            doc_id: row.get(5)?,
            parent_id: row.get(6)?,
            ts_us: row.get(7)?,
            write_seq: row.get(8)?,
            author_json: row.get(9)?,
            before_json: row.get(10)?,
            after_json: row.get(11)?,
            expires_at_us: row.get(12)?,
        })
    }

    fn decode(self) -> Result<AuditSnapshot> {
        let fields = |raw: Option<String>| -> Result<Option<Fields>> {
            raw.map(|json| serde_json::from_str(&json))
                .transpose()
                .context("decode snapshot body")
        };
        let author: Option<Actor> = self
            .author_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("decode snapshot author")?;

        Ok(AuditSnapshot {
            operation: self.operation.parse()?,
            before: fields(self.before_json)?,
            after: fields(self.after_json)?,
            snapshot_id: self.snapshot_id,
            tenant_id: self.tenant_id,
            collection: self.collection,
            collection_path: self.collection_path,
            doc_id: self.doc_id,
            parent_id: self.parent_id,
            ts_us: self.ts_us,
            write_seq: self.write_seq,
            author,
            expires_at_us: self.expires_at_us,
        })
    }
}
