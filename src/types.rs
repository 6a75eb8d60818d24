//! Core types for the live query engine.

use crate::error::{LiveQueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A record as it crosses the wire: a JSON object.
pub type Record = Value;

/// Field used as the identity when an entity does not name its own.
pub const DEFAULT_ID_FIELD: &str = "id";

/// The unique key used to match a record across old and new result sets.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Int(i64),
    Text(String),
    Composite(Vec<Identity>),
}

impl Identity {
    /// Convert a JSON value into an identity. Objects and null have none.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Identity::Int(i),
                None => Identity::Text(n.to_string()),
            }),
            Value::String(s) => Some(Identity::Text(s.clone())),
            Value::Bool(b) => Some(Identity::Text(b.to_string())),
            Value::Array(items) => items
                .iter()
                .map(Identity::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Identity::Composite),
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Extract the identity of `record` from the given id fields.
    ///
    /// A single field yields its value; several fields yield a composite in
    /// field order.
    pub fn from_record(record: &Record, id_fields: &[String]) -> Result<Self> {
        let field_identity = |field: &str| {
            record
                .get(field)
                .and_then(Identity::from_value)
                .ok_or_else(|| LiveQueryError::MissingIdentity(field.to_string()))
        };

        match id_fields {
            [] => field_identity(DEFAULT_ID_FIELD),
            [single] => field_identity(single),
            many => many
                .iter()
                .map(|f| field_identity(f))
                .collect::<Result<Vec<_>>>()
                .map(Identity::Composite),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Int(i) => write!(f, "{}", i),
            Identity::Text(s) => write!(f, "{}", s),
            Identity::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Identity::Int(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity::Text(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity::Text(value)
    }
}

/// Entity metadata the client needs to apply diffs: its key and the fields
/// that make up a record's identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub key: String,
    pub id_fields: Vec<String>,
}

impl EntityDescriptor {
    /// Entity identified by its `id` field.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id_fields: vec![DEFAULT_ID_FIELD.to_string()],
        }
    }

    pub fn with_id_fields(mut self, fields: Vec<String>) -> Self {
        self.id_fields = fields;
        self
    }

    pub fn identity_of(&self, record: &Record) -> Result<Identity> {
        Identity::from_record(record, &self.id_fields)
    }
}

/// Sort direction for one ordering term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One ordering term of a query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A watched query: filter, ordering and pagination.
///
/// The filter is opaque to the engine and interpreted only by the
/// [`QueryEvaluator`](crate::publisher::QueryEvaluator).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub filter: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// 1-based page number, only meaningful together with `limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
}

impl QuerySpec {
    /// Query matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    /// Whether the result is a window (limit/offset) rather than every match.
    pub fn is_bounded(&self) -> bool {
        self.limit.is_some()
    }

    /// Number of matches skipped before the window starts.
    pub fn offset(&self) -> usize {
        match (self.limit, self.page) {
            (Some(limit), Some(page)) if page > 1 => limit * (page - 1),
            _ => 0,
        }
    }

    /// Stable serialized form, used for channel derivation and storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LiveQueryError::Deserialization(e.to_string()))
    }
}

/// Who is asking. Captured when a query is registered and replayed for every
/// re-evaluation of that query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Stable name of the subject, used in channel derivation.
    pub fn subject(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

/// Kind of committed mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One committed mutation to a tracked entity type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_key: String,
    pub operation: ChangeOperation,
    /// Identity before the mutation (update, delete).
    pub old_identity: Option<Identity>,
    /// Identity after the mutation (insert, update).
    pub identity: Option<Identity>,
    pub prior: Option<Record>,
    pub record: Option<Record>,
}

impl ChangeEvent {
    pub fn insert(entity_key: impl Into<String>, identity: Identity, record: Record) -> Self {
        Self {
            entity_key: entity_key.into(),
            operation: ChangeOperation::Insert,
            old_identity: None,
            identity: Some(identity),
            prior: None,
            record: Some(record),
        }
    }

    /// An update; `old_identity` differs from `identity` when the identity
    /// field itself changed.
    pub fn update(
        entity_key: impl Into<String>,
        old_identity: Identity,
        prior: Option<Record>,
        identity: Identity,
        record: Record,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            operation: ChangeOperation::Update,
            old_identity: Some(old_identity),
            identity: Some(identity),
            prior,
            record: Some(record),
        }
    }

    pub fn delete(entity_key: impl Into<String>, identity: Identity, prior: Option<Record>) -> Self {
        Self {
            entity_key: entity_key.into(),
            operation: ChangeOperation::Delete,
            old_identity: Some(identity),
            identity: None,
            prior,
            record: None,
        }
    }

    /// The identity the row had before this change, if it existed.
    pub fn before(&self) -> Option<&Identity> {
        match self.operation {
            ChangeOperation::Insert => None,
            _ => self.old_identity.as_ref().or(self.identity.as_ref()),
        }
    }

    /// The identity the row has after this change, if it still exists.
    pub fn after(&self) -> Option<&Identity> {
        match self.operation {
            ChangeOperation::Delete => None,
            _ => self.identity.as_ref(),
        }
    }

    /// Every identity touched by this change, old and new.
    pub fn touched(&self) -> impl Iterator<Item = &Identity> {
        self.before().into_iter().chain(self.after())
    }
}
