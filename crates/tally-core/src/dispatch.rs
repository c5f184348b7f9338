//! Post-commit event delivery.
//!
//! Subscribers run after the originating write has committed. A subscriber
//! error is logged and counted, never returned to the writer. Events a
//! subscriber emits (for example the backfill write-back) are delivered to
//! every subscriber in turn, so they get audited like any other write.

use std::collections::VecDeque;

use crate::error::Result;
use crate::event::MutationEvent;
use crate::store::Store;

/// Upper bound on follow-up events produced by one publish.
const MAX_EVENTS_PER_PUBLISH: usize = 64;

/// Reacts to committed mutations.
pub trait Subscriber {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle one event. Returns the events of any writes the subscriber
    /// committed in response.
    ///
    /// # Errors
    ///
    /// Any error is logged by the dispatcher and otherwise ignored.
    fn on_mutation(&self, store: &mut Store, event: &MutationEvent) -> Result<Vec<MutationEvent>>;
}

/// Outcome counters for one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub events: usize,
    pub deliveries: usize,
    pub failures: usize,
}

#[derive(Default)]
pub struct Dispatcher {
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    #[must_use]
    pub fn subscriber_names(&self) -> Vec<&'static str> {
        self.subscribers.iter().map(|s| s.name()).collect()
    }

    /// Deliver `event`, and every follow-up event, to all subscribers.
    pub fn publish(&self, store: &mut Store, event: MutationEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            report.events += 1;
            for subscriber in &self.subscribers {
                report.deliveries += 1;
                match subscriber.on_mutation(store, &event) {
                    Ok(follow_ups) => queue.extend(follow_ups),
                    Err(err) => {
                        report.failures += 1;
                        tracing::error!(
                            subscriber = subscriber.name(),
                            code = %err.code(),
                            kind = %event.kind,
                            path = %event.path,
                            doc_id = %event.doc_id,
                            error = %err,
                            "subscriber failed"
                        );
                    }
                }
            }

            if report.events >= MAX_EVENTS_PER_PUBLISH && !queue.is_empty() {
                tracing::warn!(
                    dropped = queue.len(),
                    "follow-up event limit reached, dropping remaining events"
                );
                break;
            }
        }

        report
    }
}
