//! Entry points used by clients and tooling.
//!
//! [`Ledger`] owns the store, the post-commit dispatcher (backfill and
//! audit subscribers) and the membership check. Every user-facing write
//! goes through the store first and is published only after it commits, so
//! subscriber failures can at worst leave a numbering gap or a missing
//! audit entry.

use serde::Serialize;
use std::path::Path;

use crate::audit::query::{self, AuditFilter};
use crate::audit::retention::{self, SweepReport};
use crate::audit::{AuditRecorder, AuditSnapshot};
use crate::auth::{AllowAll, Authorizer, require_member};
use crate::backfill::BackfillResolver;
use crate::config::{self, LedgerConfig};
use crate::db;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{LedgerError, Result};
use crate::event::MutationEvent;
use crate::model::{Actor, CollectionPath, Document, Fields};
use crate::sequence::SequenceKey;
use crate::store::Store;
use crate::sync::conflict::{self, ConflictStatus, Resolution, SyncConflict};
use crate::sync::pending::{self, NewPendingWrite, PendingState, PendingWrite};
use crate::sync::reconcile::{self, SyncOutcome};

/// Totals for one drain of the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub superseded: usize,
    pub already_applied: usize,
    pub conflicts: usize,
    pub deferred: usize,
    pub outcomes: Vec<SyncOutcome>,
}

impl SyncReport {
    fn push(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Synced { .. } => self.synced += 1,
            SyncOutcome::Superseded { .. } => self.superseded += 1,
            SyncOutcome::AlreadyApplied { .. } => self.already_applied += 1,
            SyncOutcome::Conflict { .. } => self.conflicts += 1,
            SyncOutcome::Deferred { .. } => self.deferred += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// What resolving a conflict did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Discarded {
        conflict_id: String,
    },
    Retried {
        conflict_id: String,
        outcome: SyncOutcome,
    },
    /// The retry hit the same kind of problem; the record stays open.
    StillConflicted {
        conflict_id: String,
    },
    Recreated {
        conflict_id: String,
        doc_id: String,
        number: Option<i64>,
    },
}

pub struct Ledger {
    store: Store,
    dispatcher: Dispatcher,
    authorizer: Box<dyn Authorizer>,
}

impl Ledger {
    /// Wire the default subscribers (backfill, then audit) around `store`.
    #[must_use]
    pub fn new(store: Store) -> Self {
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe(Box::new(BackfillResolver));
        dispatcher.subscribe(Box::new(AuditRecorder::new(store.config().audit.clone())));
        Self {
            store,
            dispatcher,
            authorizer: Box::new(AllowAll),
        }
    }

    /// Open the project store under `project_root` with its config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed or the store opened.
    pub fn open(project_root: &Path) -> anyhow::Result<Self> {
        let config = config::load_ledger_config(project_root)?;
        let store = Store::open(&config::store_path(project_root), config)?;
        Ok(Self::new(store))
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory store cannot be migrated.
    pub fn in_memory(config: LedgerConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Store::in_memory(config)?))
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Box::new(authorizer);
        self
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    fn authorize(&self, caller_id: &str, tenant_id: &str) -> Result<()> {
        require_member(self.authorizer.as_ref(), caller_id, tenant_id)
    }

    /// Deliver a committed event to the subscribers.
    pub fn publish(&mut self, event: MutationEvent) -> DispatchReport {
        self.dispatcher.publish(&mut self.store, event)
    }

    fn fetch(&self, tenant_id: &str, path: &CollectionPath, doc_id: &str) -> Result<Document> {
        self.store
            .get(tenant_id, path, doc_id)?
            .ok_or_else(|| LedgerError::DocumentNotFound {
                path: path.to_string(),
                doc_id: doc_id.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Sequences and documents
    // -----------------------------------------------------------------------

    /// Allocate the next number for a counter on behalf of `caller_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unauthorized`] for non-members, or the
    /// allocation failure after bounded retries.
    pub fn allocate_sequence(
        &mut self,
        caller_id: &str,
        tenant_id: &str,
        scope_id: &str,
        sequence_name: &str,
    ) -> Result<i64> {
        self.authorize(caller_id, tenant_id)?;
        self.store
            .allocate(&SequenceKey::new(tenant_id, scope_id, sequence_name))
    }

    /// Create with the number assigned in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns authorization, validation or allocation errors.
    pub fn create(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        fields: Fields,
        actor: &Actor,
    ) -> Result<Document> {
        self.authorize(&actor.caller_id, tenant_id)?;
        let event = self.store.create_online(tenant_id, path, fields, actor)?;
        let doc_id = event.doc_id.clone();
        self.publish(event);
        self.fetch(tenant_id, path, &doc_id)
    }

    /// Commit without a number; the backfill assigns it after the commit.
    ///
    /// # Errors
    ///
    /// Returns authorization or validation errors.
    pub fn create_offline(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: Option<&str>,
        fields: Fields,
        actor: &Actor,
    ) -> Result<Document> {
        self.authorize(&actor.caller_id, tenant_id)?;
        let event = self
            .store
            .create_offline(tenant_id, path, doc_id, fields, actor)?;
        let doc_id = event.doc_id.clone();
        self.publish(event);
        self.fetch(tenant_id, path, &doc_id)
    }

    /// # Errors
    ///
    /// Returns authorization, not-found or validation errors.
    pub fn update(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
        fields: Fields,
        actor: &Actor,
    ) -> Result<Document> {
        self.authorize(&actor.caller_id, tenant_id)?;
        let event = self.store.update(tenant_id, path, doc_id, fields, actor)?;
        self.publish(event);
        self.fetch(tenant_id, path, doc_id)
    }

    /// Delete a document. Returns the archived job, or `None` when the
    /// document was removed.
    ///
    /// # Errors
    ///
    /// Returns authorization or not-found errors.
    pub fn delete(
        &mut self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
        actor: &Actor,
    ) -> Result<Option<Document>> {
        self.authorize(&actor.caller_id, tenant_id)?;
        let event = self.store.delete(tenant_id, path, doc_id, actor)?;
        self.publish(event);
        self.store.get(tenant_id, path, doc_id)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get(
        &self,
        tenant_id: &str,
        path: &CollectionPath,
        doc_id: &str,
    ) -> Result<Option<Document>> {
        self.store.get(tenant_id, path, doc_id)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn list(&self, tenant_id: &str, path: &CollectionPath) -> Result<Vec<Document>> {
        self.store.list(tenant_id, path)
    }

    // -----------------------------------------------------------------------
    // Offline queue
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidDocument`] for malformed entries.
    pub fn enqueue(&mut self, write: NewPendingWrite) -> Result<PendingWrite> {
        pending::enqueue(self.store.conn_mut(), write)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn pending(&self, state: Option<PendingState>) -> Result<Vec<PendingWrite>> {
        pending::list(self.store.conn(), state)
    }

    /// Apply every pending write in queue order. Writes queued behind an
    /// unresolved conflict on the same document stay pending.
    ///
    /// # Errors
    ///
    /// Stops at the first storage failure; writes settled before it stay
    /// settled.
    pub fn sync(&mut self) -> Result<SyncReport> {
        let queued = pending::list(self.store.conn(), Some(PendingState::Pending))?;
        let mut report = SyncReport::default();
        for write in queued {
            let applied = reconcile::apply(&mut self.store, self.authorizer.as_ref(), &write)?;
            for event in applied.events {
                self.publish(event);
            }
            report.push(applied.outcome);
        }

        tracing::info!(
            synced = report.synced,
            superseded = report.superseded,
            already_applied = report.already_applied,
            conflicts = report.conflicts,
            deferred = report.deferred,
            "offline queue drained"
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub fn conflicts(
        &self,
        tenant_id: Option<&str>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<SyncConflict>> {
        conflict::list(self.store.conn(), tenant_id, status)
    }

    /// Settle a pending conflict.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ConflictNotFound`],
    /// [`LedgerError::ConflictAlreadyResolved`], an authorization error, or
    /// the failure of the write the resolution performs.
    pub fn resolve(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
        actor: &Actor,
    ) -> Result<ResolutionOutcome> {
        let not_found = || LedgerError::ConflictNotFound(conflict_id.to_string());
        let record = conflict::get(self.store.conn(), conflict_id)?.ok_or_else(not_found)?;
        if record.status != ConflictStatus::Pending {
            return Err(LedgerError::ConflictAlreadyResolved(conflict_id.to_string()));
        }
        self.authorize(&actor.caller_id, &record.tenant_id)?;
        let write = pending::get(self.store.conn(), &record.write_id)?.ok_or_else(not_found)?;
        let conflict_id = record.conflict_id;

        let outcome = match resolution {
            Resolution::Discard => {
                let now = self.store.now_us();
                let tx = db::begin_write(self.store.conn_mut())?;
                conflict::mark(&tx, &conflict_id, ConflictStatus::Discarded, now, None)?;
                pending::set_state(&tx, &write.write_id, PendingState::Discarded)?;
                tx.commit()?;
                ResolutionOutcome::Discarded { conflict_id }
            }
            Resolution::Retry => self.retry(conflict_id, write)?,
            Resolution::RecreateAsNew => self.recreate(conflict_id, &write, actor)?,
        };

        tracing::info!(?resolution, outcome = ?outcome, "sync conflict resolved");
        Ok(outcome)
    }

    fn retry(&mut self, conflict_id: String, mut write: PendingWrite) -> Result<ResolutionOutcome> {
        write.base_version = self
            .store
            .get(&write.tenant_id, &write.path, &write.doc_id)?
            .map(|doc| doc.version())
            .or(write.base_version);
        write.state = PendingState::Pending;
        pending::rebase(self.store.conn(), &write.write_id, write.base_version)?;

        let applied = reconcile::apply(&mut self.store, self.authorizer.as_ref(), &write)?;
        for event in applied.events {
            self.publish(event);
        }
        if applied.outcome.is_conflict() {
            return Ok(ResolutionOutcome::StillConflicted { conflict_id });
        }

        let now = self.store.now_us();
        conflict::mark(self.store.conn(), &conflict_id, ConflictStatus::Retried, now, None)?;
        Ok(ResolutionOutcome::Retried {
            conflict_id,
            outcome: applied.outcome,
        })
    }

    fn recreate(
        &mut self,
        conflict_id: String,
        write: &PendingWrite,
        actor: &Actor,
    ) -> Result<ResolutionOutcome> {
        let fields = write.fields.clone().ok_or_else(|| {
            LedgerError::InvalidDocument("a queued delete has no values to recreate".into())
        })?;
        let created = self.create(&write.tenant_id, &write.path, fields, actor)?;

        let now = self.store.now_us();
        let tx = db::begin_write(self.store.conn_mut())?;
        conflict::mark(
            &tx,
            &conflict_id,
            ConflictStatus::Recreated,
            now,
            Some(&created.doc_id),
        )?;
        pending::set_state(&tx, &write.write_id, PendingState::Discarded)?;
        let moved = pending::rebind(&tx, write, &created.doc_id)?;
        tx.commit()?;
        if moved > 0 {
            tracing::info!(
                from = %write.doc_id,
                to = %created.doc_id,
                moved,
                "queued writes follow the recreated document"
            );
        }

        Ok(ResolutionOutcome::Recreated {
            conflict_id,
            number: created.sequence_number(),
            doc_id: created.doc_id,
        })
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn audit(&self, filter: &AuditFilter) -> anyhow::Result<Vec<AuditSnapshot>> {
        query::list_snapshots(self.store.conn(), filter)
    }

    /// Manual retention sweep against this store.
    ///
    /// # Errors
    ///
    /// See [`retention::sweep_store`].
    pub fn sweep(&mut self) -> Result<SweepReport> {
        retention::sweep_store(&mut self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticMembership;
    use crate::model::RootCollection;

    fn jobs() -> CollectionPath {
        CollectionPath::Root(RootCollection::Jobs)
    }

    #[test]
    fn allocate_requires_membership() {
        let members = StaticMembership::new().with_member("acme", "u-ana");
        let mut ledger = Ledger::in_memory(LedgerConfig::default())
            .unwrap()
            .with_authorizer(members);

        assert_eq!(ledger.allocate_sequence("u-ana", "acme", "acme", "jobNumber").unwrap(), 1);
        let err = ledger
            .allocate_sequence("u-eve", "acme", "acme", "jobNumber")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
        assert_eq!(ledger.allocate_sequence("u-ana", "acme", "acme", "jobNumber").unwrap(), 2);
    }

    #[test]
    fn offline_create_is_backfilled_and_audited() {
        let mut ledger = Ledger::in_memory(LedgerConfig::default()).unwrap();
        let actor = Actor::new("u-bob", "Bob");
        let doc = ledger
            .create_offline("acme", &jobs(), None, Fields::new(), &actor)
            .unwrap();
        assert_eq!(doc.sequence_number(), Some(1));

        // Create plus the backfill write-back.
        let trail = ledger.audit(&AuditFilter::for_tenant("acme")).unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn resolving_unknown_conflict_fails() {
        let mut ledger = Ledger::in_memory(LedgerConfig::default()).unwrap();
        let err = ledger
            .resolve("c-nope", Resolution::Discard, &Actor::system())
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConflictNotFound(_)));
    }
}
