//! Applying diff messages to a local result array.

use crate::types::{EntityDescriptor, Identity, Record};
use crate::wire::DiffMessage;
use std::collections::HashSet;

/// Apply `changes` in order to `previous`.
///
/// The output never holds two records with the same identity:
/// - `all` replaces everything
/// - `add` appends, or overwrites in place when the identity is present
/// - `replace` overwrites the record with the old identity in place, dropping
///   any other copy of the new identity; appends when the old one is absent
/// - `remove` drops the identity if present
///
/// Records without an identity are carried along untouched.
pub fn apply_changes(
    previous: &[Record],
    changes: &[DiffMessage],
    entity: &EntityDescriptor,
) -> Vec<Record> {
    let mut items = dedup(previous, entity);

    for change in changes {
        match change {
            DiffMessage::All(rows) => items = dedup(rows, entity),
            DiffMessage::Add(item) => {
                let identity = entity.identity_of(item).ok();
                match identity.and_then(|id| position(&items, &id, entity)) {
                    Some(at) => items[at] = item.clone(),
                    None => items.push(item.clone()),
                }
            }
            DiffMessage::Replace { old_identity, item } => {
                let new_identity = entity
                    .identity_of(item)
                    .unwrap_or_else(|_| old_identity.clone());
                match position(&items, old_identity, entity) {
                    Some(at) => {
                        items[at] = item.clone();
                        if new_identity != *old_identity {
                            let mut index = 0;
                            items.retain(|record| {
                                let keep = index == at
                                    || entity.identity_of(record).ok().as_ref() != Some(&new_identity);
                                index += 1;
                                keep
                            });
                        }
                    }
                    None => match position(&items, &new_identity, entity) {
                        Some(at) => items[at] = item.clone(),
                        None => items.push(item.clone()),
                    },
                }
            }
            DiffMessage::Remove { identity } => {
                items.retain(|record| entity.identity_of(record).ok().as_ref() != Some(identity));
            }
        }
    }

    items
}

fn position(items: &[Record], identity: &Identity, entity: &EntityDescriptor) -> Option<usize> {
    items
        .iter()
        .position(|record| entity.identity_of(record).ok().as_ref() == Some(identity))
}

/// First occurrence of every identity, in order.
fn dedup(records: &[Record], entity: &EntityDescriptor) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .filter(|record| match entity.identity_of(record) {
            Ok(identity) => seen.insert(identity),
            Err(_) => true,
        })
        .cloned()
        .collect()
}

/// What a subscriber callback receives.
#[derive(Clone, Debug)]
pub struct LiveQueryUpdate {
    /// Current materialized result.
    pub items: Vec<Record>,
    /// Diffs since the previous callback. Starts with an `all` after a
    /// (re)fetch.
    pub changes: Vec<DiffMessage>,
    entity: EntityDescriptor,
}

impl LiveQueryUpdate {
    pub(crate) fn new(items: Vec<Record>, changes: Vec<DiffMessage>, entity: EntityDescriptor) -> Self {
        Self {
            items,
            changes,
            entity,
        }
    }

    /// Apply [`changes`](Self::changes) to the caller's own copy of the
    /// result, keeping the positions of the records it already holds.
    pub fn apply_changes(&self, previous: &[Record]) -> Vec<Record> {
        apply_changes(previous, &self.changes, &self.entity)
    }

    pub fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }
}
