//! Diff computation between a stored identity list and a fresh result.

use crate::types::{ChangeEvent, Identity, Record};
use crate::wire::DiffMessage;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Messages to publish and the identity list to store afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffOutcome {
    pub messages: Vec<DiffMessage>,
    pub identities: Vec<Identity>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Diff `previous` against `current`.
///
/// `rows` must hold the record of every identity in `current` that was added
/// or touched by `changes`. Rows present on both sides are only reported
/// when a change touched them. A row whose identity changed is reported as a
/// single `replace` carrying its old identity.
pub fn compute_diff(
    previous: &[Identity],
    current: &[Identity],
    rows: &HashMap<Identity, Record>,
    changes: &[ChangeEvent],
) -> DiffOutcome {
    let before: HashSet<&Identity> = previous.iter().collect();
    let now: HashSet<&Identity> = current.iter().collect();
    let touched: HashSet<&Identity> = changes.iter().filter_map(ChangeEvent::after).collect();

    // New identities that came from a row which was in the result before
    let mut renamed: HashMap<&Identity, &Identity> = HashMap::new();
    let mut claimed: HashSet<&Identity> = HashSet::new();
    for id in current {
        if before.contains(id) {
            continue;
        }
        if let Some(origin) = origin_of(id, changes, &before) {
            if !now.contains(origin) && claimed.insert(origin) {
                renamed.insert(id, origin);
            }
        }
    }

    let mut messages = Vec::new();
    for id in previous {
        if !now.contains(id) && !claimed.contains(id) {
            messages.push(DiffMessage::remove(id.clone()));
        }
    }

    let mut emitted: HashSet<&Identity> = HashSet::new();
    for id in current {
        if !emitted.insert(id) {
            continue;
        }
        let message = if let Some(origin) = renamed.get(id) {
            rows.get(id)
                .map(|row| DiffMessage::replace((*origin).clone(), row.clone()))
        } else if before.contains(id) {
            if !touched.contains(id) {
                continue;
            }
            rows.get(id)
                .map(|row| DiffMessage::replace(id.clone(), row.clone()))
        } else {
            rows.get(id).map(|row| DiffMessage::Add(row.clone()))
        };

        match message {
            Some(message) => messages.push(message),
            None => warn!(identity = %id, "no row for changed identity, skipping"),
        }
    }

    DiffOutcome {
        messages,
        identities: current.to_vec(),
    }
}

/// Follow identity changes backwards from `id` to the first identity that
/// was in the previous result.
fn origin_of<'a>(
    id: &'a Identity,
    changes: &'a [ChangeEvent],
    before: &HashSet<&Identity>,
) -> Option<&'a Identity> {
    let mut cursor = id;
    for _ in 0..changes.len() {
        let change = changes.iter().rev().find(|c| c.after() == Some(cursor))?;
        match change.before() {
            Some(prior) if prior != cursor => {
                if before.contains(prior) {
                    return Some(prior);
                }
                cursor = prior;
            }
            _ => return None,
        }
    }
    None
}

/// Current identity list of an unbounded query, given only the rows among
/// the changed identities that match now.
///
/// Untouched identities keep matching and keep their position; a row whose
/// identity changed takes the slot of its old identity; new matches go last.
pub fn merge_unbounded(
    previous: &[Identity],
    matching: &[(Identity, Record)],
    changes: &[ChangeEvent],
) -> Vec<Identity> {
    let matching_ids: HashSet<&Identity> = matching.iter().map(|(id, _)| id).collect();
    let touched: HashSet<&Identity> = changes.iter().flat_map(|c| c.touched()).collect();

    let mut merged = Vec::with_capacity(previous.len() + matching.len());
    let mut placed: HashSet<&Identity> = HashSet::new();

    for id in previous {
        if !touched.contains(id) || matching_ids.contains(id) {
            if placed.insert(id) {
                merged.push(id.clone());
            }
            continue;
        }

        let successor = changes
            .iter()
            .rev()
            .find(|c| c.before() == Some(id))
            .and_then(ChangeEvent::after);
        if let Some(next) = successor {
            if matching_ids.contains(next) && placed.insert(next) {
                merged.push(next.clone());
            }
        }
    }

    for (id, _) in matching {
        if placed.insert(id) {
            merged.push(id.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(values: &[i64]) -> Vec<Identity> {
        values.iter().map(|&v| Identity::Int(v)).collect()
    }

    fn row(id: i64, title: &str) -> (Identity, Record) {
        (Identity::Int(id), json!({"id": id, "title": title}))
    }

    fn rows(entries: &[(Identity, Record)]) -> HashMap<Identity, Record> {
        entries.iter().cloned().collect()
    }

    #[test]
    fn test_update_still_matching_is_replace() {
        let changes = vec![ChangeEvent::update(
            "tasks",
            2.into(),
            None,
            2.into(),
            json!({"id": 2, "title": "yael2"}),
        )];
        let current = [row(1, "noam"), row(2, "yael2"), row(3, "yoni")];

        let outcome = compute_diff(&ids(&[1, 2, 3]), &ids(&[1, 2, 3]), &rows(&current), &changes);

        assert_eq!(
            outcome.messages,
            vec![DiffMessage::replace(2.into(), json!({"id": 2, "title": "yael2"}))]
        );
        assert_eq!(outcome.identities, ids(&[1, 2, 3]));
    }

    #[test]
    fn test_insert_is_add() {
        let changes = vec![ChangeEvent::insert(
            "tasks",
            4.into(),
            json!({"id": 4, "title": "maayan"}),
        )];
        let matching = vec![row(4, "maayan")];
        let current = merge_unbounded(&ids(&[1, 2, 3]), &matching, &changes);
        assert_eq!(current, ids(&[1, 2, 3, 4]));

        let outcome = compute_diff(&ids(&[1, 2, 3]), &current, &rows(&matching), &changes);
        assert_eq!(
            outcome.messages,
            vec![DiffMessage::Add(json!({"id": 4, "title": "maayan"}))]
        );
        assert_eq!(outcome.identities, ids(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_delete_is_remove() {
        let changes = vec![ChangeEvent::delete("tasks", 1.into(), None)];
        let current = merge_unbounded(&ids(&[1, 2, 3]), &[], &changes);
        assert_eq!(current, ids(&[2, 3]));

        let outcome = compute_diff(&ids(&[1, 2, 3]), &current, &HashMap::new(), &changes);
        assert_eq!(outcome.messages, vec![DiffMessage::remove(1.into())]);
    }

    #[test]
    fn test_identity_change_is_single_replace() {
        let changes = vec![ChangeEvent::update(
            "tasks",
            1.into(),
            None,
            99.into(),
            json!({"id": 99, "title": "noam"}),
        )];
        let matching = vec![row(99, "noam")];
        let current = merge_unbounded(&ids(&[1, 2, 3]), &matching, &changes);
        assert_eq!(current, ids(&[99, 2, 3]));

        let outcome = compute_diff(&ids(&[1, 2, 3]), &current, &rows(&matching), &changes);
        assert_eq!(
            outcome.messages,
            vec![DiffMessage::replace(1.into(), json!({"id": 99, "title": "noam"}))]
        );
    }

    #[test]
    fn test_chained_identity_change() {
        let changes = vec![
            ChangeEvent::update("tasks", 1.into(), None, 5.into(), json!({"id": 5})),
            ChangeEvent::update("tasks", 5.into(), None, 6.into(), json!({"id": 6})),
        ];
        let matching = vec![(Identity::Int(6), json!({"id": 6}))];
        let current = merge_unbounded(&ids(&[1, 2]), &matching, &changes);
        assert_eq!(current, ids(&[6, 2]));

        let outcome = compute_diff(&ids(&[1, 2]), &current, &rows(&matching), &changes);
        assert_eq!(
            outcome.messages,
            vec![DiffMessage::replace(1.into(), json!({"id": 6}))]
        );
    }

    #[test]
    fn test_update_leaving_filter_is_remove() {
        let changes = vec![ChangeEvent::update(
            "tasks",
            3.into(),
            None,
            3.into(),
            json!({"id": 3, "title": "gone"}),
        )];
        let current = merge_unbounded(&ids(&[1, 2, 3]), &[], &changes);
        let outcome = compute_diff(&ids(&[1, 2, 3]), &current, &HashMap::new(), &changes);
        assert_eq!(outcome.messages, vec![DiffMessage::remove(3.into())]);
        assert_eq!(outcome.identities, ids(&[1, 2]));
    }

    #[test]
    fn test_bounded_window_shift() {
        // limit 2: inserting 0 at the front pushes 2 out of the window
        let changes = vec![ChangeEvent::insert("tasks", 0.into(), json!({"id": 0}))];
        let current_rows = vec![row(0, "a"), row(1, "b")];
        let current: Vec<Identity> = current_rows.iter().map(|(id, _)| id.clone()).collect();

        let outcome = compute_diff(&ids(&[1, 2]), &current, &rows(&current_rows), &changes);
        assert_eq!(
            outcome.messages,
            vec![
                DiffMessage::remove(2.into()),
                DiffMessage::Add(json!({"id": 0, "title": "a"})),
            ]
        );
        assert_eq!(outcome.identities, ids(&[0, 1]));
    }

    #[test]
    fn test_unrelated_change_is_empty() {
        let changes = vec![ChangeEvent::update(
            "tasks",
            7.into(),
            None,
            7.into(),
            json!({"id": 7}),
        )];
        let current = merge_unbounded(&ids(&[1, 2]), &[], &changes);
        let outcome = compute_diff(&ids(&[1, 2]), &current, &HashMap::new(), &changes);
        assert!(outcome.is_empty());
        assert_eq!(outcome.identities, ids(&[1, 2]));
    }
}
