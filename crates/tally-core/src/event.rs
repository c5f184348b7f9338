//! Mutation events published by the write path after each commit.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::model::{CollectionPath, Fields, WriteStamp};

/// The three mutation kinds recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// Error returned when parsing an unknown operation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMutationKind {
    pub raw: String,
}

impl fmt::Display for UnknownMutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown operation '{}': expected one of CREATE, UPDATE, DELETE",
            self.raw
        )
    }
}

impl std::error::Error for UnknownMutationKind {}

impl MutationKind {
    pub const ALL: [Self; 3] = [Self::Create, Self::Update, Self::Delete];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = UnknownMutationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(UnknownMutationKind { raw: s.to_string() }),
        }
    }
}

/// A committed write on one document, with full before/after states.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub tenant_id: String,
    pub path: CollectionPath,
    pub doc_id: String,
    /// Prior state; absent for creates.
    pub before: Option<Fields>,
    /// New state; absent for deletes.
    pub after: Option<Fields>,
    /// Stamp of the commit that produced this event.
    pub stamp: WriteStamp,
}

impl MutationEvent {
    /// Content-addressed identity of this event.
    ///
    /// A re-delivered event hashes to the same id, which is what makes the
    /// audit write idempotent.
    #[must_use]
    pub fn event_id(&self) -> String {
        let input = format!(
            "{}\t{}\t{}\t{}\t{}",
            self.tenant_id, self.path, self.doc_id, self.kind, self.stamp.write_seq
        );
        format!("blake3:{}", blake3::hash(input.as_bytes()).to_hex())
    }
}
