//! Shared fixtures: an in-memory dataset that answers queries and produces
//! change events for every mutation.

#![allow(dead_code)]

use livequery::{
    ChangeEvent, Direction, Identity, QueryEvaluator, QuerySpec, Record, Result, SecurityContext,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

/// Filter value replaced by the subscriber's user id.
pub const CURRENT_USER: &str = "$user";

/// Rows per entity, in insertion order.
///
/// Filters are objects of `field: value` pairs, all of which must match.
/// A value `{"$contains": "x"}` matches strings containing `x`; the value
/// `"$user"` matches the evaluating context's user id.
#[derive(Default)]
pub struct Dataset {
    rows: RwLock<HashMap<String, Vec<Record>>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, entity: &str, rows: Vec<Record>) {
        self.rows.write().insert(entity.to_string(), rows);
    }

    pub fn rows(&self, entity: &str) -> Vec<Record> {
        self.rows.read().get(entity).cloned().unwrap_or_default()
    }

    pub fn insert(&self, entity: &str, row: Record) -> ChangeEvent {
        let identity = id_of(&row);
        self.rows
            .write()
            .entry(entity.to_string())
            .or_default()
            .push(row.clone());
        ChangeEvent::insert(entity, identity, row)
    }

    /// Apply `edit` to the row with `identity`; the edit may change the id.
    pub fn update(&self, entity: &str, identity: Identity, edit: impl FnOnce(&mut Record)) -> ChangeEvent {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(entity)
            .and_then(|rows| rows.iter_mut().find(|r| id_of(r) == identity))
            .expect("row to update");
        let prior = row.clone();
        edit(row);
        ChangeEvent::update(entity, identity, Some(prior), id_of(row), row.clone())
    }

    pub fn delete(&self, entity: &str, identity: Identity) -> ChangeEvent {
        let mut rows = self.rows.write();
        let rows = rows.get_mut(entity).expect("entity");
        let at = rows.iter().position(|r| id_of(r) == identity).expect("row to delete");
        let prior = rows.remove(at);
        ChangeEvent::delete(entity, identity, Some(prior))
    }
}

impl QueryEvaluator for Dataset {
    fn evaluate(
        &self,
        entity_key: &str,
        query: &QuerySpec,
        context: &SecurityContext,
    ) -> Result<Vec<Record>> {
        let rows = self.rows.read();
        let mut matching: Vec<Record> = rows
            .get(entity_key)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches(&query.filter, row, context))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !query.order_by.is_empty() {
            matching.sort_by(|a, b| {
                for term in &query.order_by {
                    let ord = compare(&a[&term.field], &b[&term.field]);
                    let ord = match term.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        Ok(matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }
}

fn matches(filter: &Value, row: &Record, context: &SecurityContext) -> bool {
    let Some(terms) = filter.as_object() else {
        return true;
    };
    terms.iter().all(|(field, expected)| {
        let actual = &row[field.as_str()];
        if let Some(needle) = expected.get("$contains").and_then(Value::as_str) {
            return actual.as_str().map(|s| s.contains(needle)).unwrap_or(false);
        }
        if expected.as_str() == Some(CURRENT_USER) {
            return actual.as_str() == context.user_id.as_deref();
        }
        actual == expected
    })
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

pub fn id_of(row: &Record) -> Identity {
    Identity::from_value(&row["id"]).expect("row id")
}

pub fn ids(rows: &[Record]) -> Vec<i64> {
    rows.iter().filter_map(|r| r["id"].as_i64()).collect()
}

/// Rows 1..=6 of the "tasks" entity used across tests.
pub fn seed_tasks(dataset: &Dataset) {
    let titles = ["noam", "yael", "yoni", "maayan", "itamar", "ofri"];
    dataset.seed(
        "tasks",
        titles
            .iter()
            .enumerate()
            .map(|(i, title)| serde_json::json!({"id": i as i64 + 1, "title": title, "done": false}))
            .collect(),
    );
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}
