use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::identity::Actor;
use super::path::{CollectionPath, SEQUENCE_FIELDS};
use crate::error::LedgerError;

/// Document body: a JSON object of business fields plus audit metadata.
pub type Fields = Map<String, Value>;

pub const CREATED_AT: &str = "createdAt";
pub const CREATED_BY: &str = "createdBy";
pub const UPDATED_AT: &str = "updatedAt";
pub const UPDATED_BY: &str = "updatedBy";
pub const STATUS: &str = "status";

/// Ordering key for whole-document last-write-wins.
///
/// Compared lexicographically: server timestamp first, then the store-wide
/// write sequence, which is unique per commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteStamp {
    pub server_ts_us: i64,
    pub write_seq: i64,
}

impl fmt::Display for WriteStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.write_seq, self.server_ts_us)
    }
}

/// A stored business entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub tenant_id: String,
    #[serde(serialize_with = "serialize_path")]
    pub path: CollectionPath,
    pub doc_id: String,
    pub fields: Fields,
    pub stamp: WriteStamp,
    pub created_at_us: i64,
}

fn serialize_path<S: serde::Serializer>(path: &CollectionPath, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}

impl Document {
    /// Version the client computed its write against.
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.stamp.write_seq
    }

    /// The collection's sequence number, if it has been assigned.
    #[must_use]
    pub fn sequence_number(&self) -> Option<i64> {
        self.fields
            .get(self.path.sequence().field)
            .and_then(Value::as_i64)
    }

    /// Sequence number for display; unassigned numbers show a placeholder.
    #[must_use]
    pub fn display_number(&self) -> String {
        self.sequence_number()
            .map_or_else(|| "—".to_string(), |n| n.to_string())
    }

    #[must_use]
    pub fn job_status(&self) -> Option<JobStatus> {
        self.fields
            .get(STATUS)
            .and_then(Value::as_str)
            .and_then(JobStatus::parse)
    }

    /// `updatedBy`, falling back to `createdBy`.
    #[must_use]
    pub fn last_author(&self) -> Option<Actor> {
        author_of(&self.fields)
    }
}

/// Read the acting identity recorded on a document body.
#[must_use]
pub fn author_of(fields: &Fields) -> Option<Actor> {
    fields
        .get(UPDATED_BY)
        .or_else(|| fields.get(CREATED_BY))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Soft-delete state for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Archived,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Remove every allocator-owned and metadata field from client input.
///
/// Returns the names that were dropped so callers can log them.
pub fn strip_reserved(fields: &mut Fields) -> Vec<String> {
    let reserved = SEQUENCE_FIELDS
        .into_iter()
        .chain([CREATED_AT, CREATED_BY, UPDATED_AT, UPDATED_BY]);
    let mut dropped = Vec::new();
    for name in reserved {
        if fields.remove(name).is_some() {
            dropped.push(name.to_string());
        }
    }
    dropped
}

/// Check business rules on a client-supplied body.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidDocument`] describing the first violation.
pub fn validate_fields(path: &CollectionPath, fields: &Fields) -> Result<(), LedgerError> {
    if let Some(status) = fields.get(STATUS) {
        if path.is_jobs() && status.as_str().and_then(JobStatus::parse).is_none() {
            return Err(LedgerError::InvalidDocument(format!(
                "job status must be 'active' or 'archived', got {status}"
            )));
        }
    }

    if let CollectionPath::Job { child, .. } = path {
        if let Some(amount) = fields.get("amount") {
            if !amount.is_number() {
                return Err(LedgerError::InvalidDocument(format!(
                    "{} amount must be a number, got {amount}",
                    child.as_str()
                )));
            }
        }
    }

    Ok(())
}

/// Parse a JSON text into an object body.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidDocument`] when the text is not an object.
pub fn parse_fields(raw: &str) -> Result<Fields, LedgerError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(LedgerError::InvalidDocument(format!(
            "document body must be a JSON object, got {other}"
        ))),
    }
}
