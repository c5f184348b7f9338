//! Collection paths and the sequences they carry.
//!
//! Tenant-level collections (`jobs`, `team_members`, `vehicles`,
//! `machines`) number their documents per tenant. Job subcollections
//! (`jobs/{jobId}/costs|advances|events`) number theirs per parent job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Collections that live directly under a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCollection {
    Jobs,
    TeamMembers,
    Vehicles,
    Machines,
}

impl RootCollection {
    pub const ALL: [Self; 4] = [Self::Jobs, Self::TeamMembers, Self::Vehicles, Self::Machines];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::TeamMembers => "team_members",
            Self::Vehicles => "vehicles",
            Self::Machines => "machines",
        }
    }

    const fn sequence_field(self) -> &'static str {
        match self {
            Self::Jobs => "jobNumber",
            Self::TeamMembers => "teamMemberNumber",
            Self::Vehicles => "vehicleNumber",
            Self::Machines => "machineNumber",
        }
    }
}

/// Subcollections scoped under a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobChild {
    Costs,
    Advances,
    Events,
}

impl JobChild {
    pub const ALL: [Self; 3] = [Self::Costs, Self::Advances, Self::Events];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Costs => "costs",
            Self::Advances => "advances",
            Self::Events => "events",
        }
    }
}

/// A parsed collection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionPath {
    Root(RootCollection),
    Job { job_id: String, child: JobChild },
}

impl CollectionPath {
    #[must_use]
    pub fn job_child(job_id: impl Into<String>, child: JobChild) -> Self {
        Self::Job {
            job_id: job_id.into(),
            child,
        }
    }

    /// Leaf collection name (`jobs`, `costs`, ...), used for audit monitoring.
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            Self::Root(root) => root.as_str(),
            Self::Job { child, .. } => child.as_str(),
        }
    }

    /// Parent entity id for subcollections.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Root(_) => None,
            Self::Job { job_id, .. } => Some(job_id),
        }
    }

    #[must_use]
    pub const fn is_jobs(&self) -> bool {
        matches!(self, Self::Root(RootCollection::Jobs))
    }

    /// The sequence this collection's documents are numbered by.
    #[must_use]
    pub fn sequence(&self) -> SequenceSpec {
        match self {
            Self::Root(root) => SequenceSpec {
                field: root.sequence_field(),
                sequence_name: root.sequence_field().to_string(),
                scope: Scope::Tenant,
            },
            Self::Job { job_id, child } => SequenceSpec {
                field: ORDINAL_FIELD,
                sequence_name: format!("{}.{ORDINAL_FIELD}", child.as_str()),
                scope: Scope::Parent(job_id.clone()),
            },
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(root) => f.write_str(root.as_str()),
            Self::Job { job_id, child } => write!(f, "jobs/{job_id}/{}", child.as_str()),
        }
    }
}

impl FromStr for CollectionPath {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        match segments.as_slice() {
            [root] => RootCollection::ALL
                .into_iter()
                .find(|candidate| candidate.as_str() == *root)
                .map(Self::Root)
                .ok_or_else(|| LedgerError::InvalidPath(s.to_string())),
            ["jobs", job_id, child] if !job_id.trim().is_empty() => JobChild::ALL
                .into_iter()
                .find(|candidate| candidate.as_str() == *child)
                .map(|child| Self::job_child(*job_id, child))
                .ok_or_else(|| LedgerError::InvalidPath(s.to_string())),
            _ => Err(LedgerError::InvalidPath(s.to_string())),
        }
    }
}

/// Field name carried by every job subcollection document.
pub const ORDINAL_FIELD: &str = "ordinalNumber";

/// Every field name the allocator owns.
pub const SEQUENCE_FIELDS: [&str; 5] = [
    "jobNumber",
    "teamMemberNumber",
    "vehicleNumber",
    "machineNumber",
    ORDINAL_FIELD,
];

/// Which key prefix a counter lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Tenant,
    Parent(String),
}

/// Sequence field and counter identity for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSpec {
    pub field: &'static str,
    pub sequence_name: String,
    pub scope: Scope,
}

impl SequenceSpec {
    /// Resolve the scope id for a tenant: the tenant itself or the parent.
    #[must_use]
    pub fn scope_id<'a>(&'a self, tenant_id: &'a str) -> &'a str {
        match &self.scope {
            Scope::Tenant => tenant_id,
            Scope::Parent(parent_id) => parent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_collections() {
        for root in RootCollection::ALL {
            let path: CollectionPath = root.as_str().parse().unwrap();
            assert_eq!(path, CollectionPath::Root(root));
            assert_eq!(path.to_string(), root.as_str());
            assert!(path.parent_id().is_none());
        }
    }

    #[test]
    fn parses_job_subcollections() {
        let path: CollectionPath = "jobs/d-abc/costs".parse().unwrap();
        assert_eq!(path, CollectionPath::job_child("d-abc", JobChild::Costs));
        assert_eq!(path.collection(), "costs");
        assert_eq!(path.parent_id(), Some("d-abc"));
        assert_eq!(path.to_string(), "jobs/d-abc/costs");
    }

    #[test]
    fn rejects_unknown_paths() {
        for raw in ["invoices", "jobs//costs", "jobs/x/invoices", "vehicles/x/costs", ""] {
            let err = raw.parse::<CollectionPath>().unwrap_err();
            assert!(matches!(err, LedgerError::InvalidPath(_)), "{raw}");
        }
    }

    #[test]
    fn tenant_sequences_scope_to_tenant() {
        let spec = CollectionPath::Root(RootCollection::Vehicles).sequence();
        assert_eq!(spec.field, "vehicleNumber");
        assert_eq!(spec.sequence_name, "vehicleNumber");
        assert_eq!(spec.scope_id("acme"), "acme");
    }

    #[test]
    fn job_children_number_per_job_and_per_child() {
        let costs = CollectionPath::job_child("job-1", JobChild::Costs).sequence();
        let events = CollectionPath::job_child("job-1", JobChild::Events).sequence();
        assert_eq!(costs.field, ORDINAL_FIELD);
        assert_eq!(costs.scope_id("acme"), "job-1");
        assert_ne!(costs.sequence_name, events.sequence_name);
    }
}
