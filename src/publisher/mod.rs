//! Change publisher: turns committed mutations into per-channel diffs.
//!
//! For every change batch the publisher
//! 1. selects registrations watching the changed entity type,
//! 2. re-evaluates each query under the context it was registered with,
//! 3. diffs the result against the stored identity list,
//! 4. publishes the diff as one unit and stores the new identity list.
//!
//! A registration that fails at any step is logged and skipped; the others
//! still get their diffs.

mod diff;
mod feed;
mod live;

pub use diff::{compute_diff, merge_unbounded, DiffOutcome};
pub use feed::ChangeFeed;
pub use live::{LiveQueryPublisher, PublishReport};

use crate::error::Result;
use crate::types::{Identity, QuerySpec, Record, SecurityContext, DEFAULT_ID_FIELD};

/// The storage/query layer the publisher re-evaluates queries against.
pub trait QueryEvaluator: Send + Sync {
    /// Every row matching `query` visible to `context`, in query order,
    /// with limit and page applied.
    fn evaluate(
        &self,
        entity_key: &str,
        query: &QuerySpec,
        context: &SecurityContext,
    ) -> Result<Vec<Record>>;

    /// Rows among `identities` that match `query`, ignoring pagination.
    ///
    /// Used for unbounded queries, where only the changed rows need to be
    /// looked at.
    fn evaluate_identities(
        &self,
        entity_key: &str,
        query: &QuerySpec,
        identities: &[Identity],
        context: &SecurityContext,
    ) -> Result<Vec<Record>> {
        let unbounded = QuerySpec {
            limit: None,
            page: None,
            ..query.clone()
        };
        let mut rows = Vec::new();
        for record in self.evaluate(entity_key, &unbounded, context)? {
            if identities.contains(&self.identity_of(entity_key, &record)?) {
                rows.push(record);
            }
        }
        Ok(rows)
    }

    /// Identity of a row returned by this evaluator.
    fn identity_of(&self, _entity_key: &str, record: &Record) -> Result<Identity> {
        Identity::from_record(record, &[DEFAULT_ID_FIELD.to_string()])
    }
}

/// Publisher configuration.
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Registrations re-evaluated at once for one change batch.
    /// Default: 1 (sequential)
    pub max_concurrent_evaluations: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: 1,
        }
    }
}
