//! Re-evaluation of registrations on committed changes.

use super::diff::{compute_diff, merge_unbounded, DiffOutcome};
use super::{PublisherConfig, QueryEvaluator};
use crate::bus::MessageBus;
use crate::error::Result;
use crate::policy::{ChannelRequest, SubscribePolicy};
use crate::registry::{Registration, RegistrationStore};
use crate::types::{ChangeEvent, Identity, Record};
use crate::wal::ChangeBatch;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// What one change batch did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Registrations watching the changed entity type.
    pub registrations: usize,
    /// Registrations that published a diff.
    pub published: usize,
    /// Diff messages published across all channels.
    pub messages: usize,
    /// Registrations skipped because of an error, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Turns change batches into diffs on the bus.
pub struct LiveQueryPublisher {
    store: Arc<dyn RegistrationStore>,
    evaluator: Arc<dyn QueryEvaluator>,
    bus: Arc<dyn MessageBus>,
    policy: Arc<dyn SubscribePolicy>,
    config: PublisherConfig,
}

impl LiveQueryPublisher {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        evaluator: Arc<dyn QueryEvaluator>,
        bus: Arc<dyn MessageBus>,
        policy: Arc<dyn SubscribePolicy>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            bus,
            policy,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistrationStore> {
        &self.store
    }

    pub fn publish(&self, batch: &ChangeBatch) -> Result<PublishReport> {
        self.items_changed(&batch.entity_key, &batch.changes)
    }

    /// Re-evaluate every registration on `entity_key` and publish its diff.
    ///
    /// Only failing to list registrations is an error; a registration that
    /// cannot be evaluated is reported in [`PublishReport::failed`].
    pub fn items_changed(&self, entity_key: &str, changes: &[ChangeEvent]) -> Result<PublishReport> {
        let changes: Cow<'_, [ChangeEvent]> = if changes.iter().all(|c| c.entity_key == entity_key) {
            Cow::Borrowed(changes)
        } else {
            Cow::Owned(
                changes
                    .iter()
                    .filter(|c| c.entity_key == entity_key)
                    .cloned()
                    .collect(),
            )
        };

        let mut report = PublishReport::default();
        if changes.is_empty() {
            return Ok(report);
        }

        let registrations = self.store.list_for_entity(entity_key)?;
        report.registrations = registrations.len();
        if registrations.is_empty() {
            return Ok(report);
        }

        let results = self.run_all(&registrations, &changes);
        for (registration, result) in registrations.iter().zip(results) {
            match result {
                Ok(0) => {}
                Ok(count) => {
                    report.published += 1;
                    report.messages += count;
                }
                Err(e) => {
                    warn!(channel = %registration.id, entity = %entity_key, error = %e, "skipping registration");
                    report.failed.push((registration.id.clone(), e.to_string()));
                }
            }
        }

        debug!(
            entity = %entity_key,
            changes = changes.len(),
            registrations = report.registrations,
            published = report.published,
            "changes published"
        );
        Ok(report)
    }

    fn run_all(&self, registrations: &[Registration], changes: &[ChangeEvent]) -> Vec<Result<usize>> {
        let width = self.config.max_concurrent_evaluations.max(1);
        if width == 1 || registrations.len() == 1 {
            return registrations
                .iter()
                .map(|r| self.process(r, changes))
                .collect();
        }

        let mut results = Vec::with_capacity(registrations.len());
        for chunk in registrations.chunks(width) {
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|r| scope.spawn(move || self.process(r, changes)))
                    .collect();
                for handle in handles {
                    results.push(handle.join().unwrap_or_else(|_| {
                        Err(crate::error::LiveQueryError::Evaluation(
                            "evaluation panicked".into(),
                        ))
                    }));
                }
            });
        }
        results
    }

    /// Diff one registration and publish it. Returns the number of messages
    /// published.
    fn process(&self, registration: &Registration, changes: &[ChangeEvent]) -> Result<usize> {
        let request = ChannelRequest {
            channel: &registration.id,
            entity_key: Some(&registration.entity_key),
        };
        if !self.policy.can_subscribe(&request, &registration.context) {
            debug!(channel = %registration.id, "not authorized, no diff published");
            return Ok(0);
        }

        let outcome = self.diff(registration, changes)?;
        if outcome.is_empty() {
            if outcome.identities != registration.identities {
                self.persist(registration, outcome.identities);
            }
            return Ok(0);
        }

        let count = outcome.messages.len();
        let delivered = self.bus.publish_message(&registration.id, outcome.messages);
        trace!(channel = %registration.id, messages = count, delivered, "diff published");

        self.persist(registration, outcome.identities);
        Ok(count)
    }

    fn diff(&self, registration: &Registration, changes: &[ChangeEvent]) -> Result<DiffOutcome> {
        let query = registration.query()?;
        let entity = registration.entity_key.as_str();
        let context = &registration.context;

        if query.is_bounded() {
            let rows = self.evaluator.evaluate(entity, &query, context)?;
            let mut current = Vec::with_capacity(rows.len());
            let mut by_identity = HashMap::with_capacity(rows.len());
            for row in rows {
                let identity = self.evaluator.identity_of(entity, &row)?;
                current.push(identity.clone());
                by_identity.insert(identity, row);
            }
            return Ok(compute_diff(
                &registration.identities,
                &current,
                &by_identity,
                changes,
            ));
        }

        let mut seen = HashSet::new();
        let touched: Vec<Identity> = changes
            .iter()
            .flat_map(|c| c.touched())
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();

        let matching = self
            .evaluator
            .evaluate_identities(entity, &query, &touched, context)?
            .into_iter()
            .map(|row| Ok((self.evaluator.identity_of(entity, &row)?, row)))
            .collect::<Result<Vec<(Identity, Record)>>>()?;

        let current = merge_unbounded(&registration.identities, &matching, changes);
        let by_identity: HashMap<Identity, Record> = matching.into_iter().collect();
        Ok(compute_diff(
            &registration.identities,
            &current,
            &by_identity,
            changes,
        ))
    }

    /// Store the new identity list. A failure here is healed by the next
    /// change, so it is only logged.
    fn persist(&self, registration: &Registration, identities: Vec<Identity>) {
        match self.store.set_identities(&registration.id, identities) {
            Ok(true) => {}
            Ok(false) => debug!(channel = %registration.id, "registration removed while publishing"),
            Err(e) => warn!(channel = %registration.id, error = %e, "failed to store identities"),
        }
    }
}
