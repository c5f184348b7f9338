//! Sequence backfill for documents created without their number.
//!
//! A disconnected client commits its document with the sequence field
//! absent. When the create event arrives here the resolver allocates the
//! next number for the document's key and writes it back, unless the field
//! was set in the meantime. The presence re-check and the write share one
//! transaction, so a re-delivered event can never overwrite an assigned
//! number. Losing that race after allocating consumes the number: the
//! sequence gets a gap, never a duplicate.

use crate::dispatch::Subscriber;
use crate::error::{LedgerError, Result};
use crate::event::{MutationEvent, MutationKind};
use crate::sequence::SequenceKey;
use crate::store::Store;

/// What happened to one create event.
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillOutcome {
    /// Not a create, or the document no longer exists.
    NotApplicable,
    /// The document already carries a number.
    AlreadyAssigned(i64),
    /// The number was allocated and written back.
    Assigned { value: i64, event: MutationEvent },
    /// Another writer set the field between allocation and write-back.
    /// `consumed` is now a gap in the sequence.
    LostRace { consumed: i64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillResolver;

impl BackfillResolver {
    /// Assign a sequence number to the document created by `event`.
    ///
    /// # Errors
    ///
    /// Returns the allocation error if no number could be allocated, or
    /// [`LedgerError::BackfillWriteFailure`] if the write-back failed after
    /// allocating. In the latter case the number is lost and the document
    /// keeps its placeholder until a new create event is processed.
    pub fn resolve(&self, store: &mut Store, event: &MutationEvent) -> Result<BackfillOutcome> {
        if event.kind != MutationKind::Create {
            return Ok(BackfillOutcome::NotApplicable);
        }

        let spec = event.path.sequence();
        let assigned = event
            .after
            .as_ref()
            .and_then(|after| after.get(spec.field))
            .and_then(serde_json::Value::as_i64);
        if let Some(value) = assigned {
            return Ok(BackfillOutcome::AlreadyAssigned(value));
        }

        // Re-read: the event may be stale (re-delivery, or a later delete).
        let Some(current) = store.get(&event.tenant_id, &event.path, &event.doc_id)? else {
            tracing::debug!(
                path = %event.path,
                doc_id = %event.doc_id,
                "document gone before backfill, skipping"
            );
            return Ok(BackfillOutcome::NotApplicable);
        };
        if let Some(value) = current.sequence_number() {
            return Ok(BackfillOutcome::AlreadyAssigned(value));
        }

        let key = SequenceKey::new(
            event.tenant_id.as_str(),
            spec.scope_id(&event.tenant_id),
            spec.sequence_name.as_str(),
        );
        let value = store.allocate(&key)?;

        match store.set_sequence_if_absent(&event.tenant_id, &event.path, &event.doc_id, value) {
            Ok(Some(write_back)) => {
                tracing::info!(
                    tenant = %event.tenant_id,
                    path = %event.path,
                    doc_id = %event.doc_id,
                    field = spec.field,
                    value,
                    "backfilled sequence number"
                );
                Ok(BackfillOutcome::Assigned {
                    value,
                    event: write_back,
                })
            }
            Ok(None) => {
                tracing::warn!(
                    key = %key,
                    doc_id = %event.doc_id,
                    consumed = value,
                    "sequence field set concurrently, allocated number left as a gap"
                );
                Ok(BackfillOutcome::LostRace { consumed: value })
            }
            Err(err) => {
                tracing::error!(
                    key = %key,
                    doc_id = %event.doc_id,
                    consumed = value,
                    error = %err,
                    "backfill write-back failed, allocated number left as a gap"
                );
                Err(LedgerError::BackfillWriteFailure {
                    doc_id: event.doc_id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl Subscriber for BackfillResolver {
    fn name(&self) -> &'static str {
        "backfill"
    }

    fn on_mutation(&self, store: &mut Store, event: &MutationEvent) -> Result<Vec<MutationEvent>> {
        match self.resolve(store, event)? {
            BackfillOutcome::Assigned { event, .. } => Ok(vec![event]),
            _ => Ok(Vec::new()),
        }
    }
}
