//! Registration store: the durable record of every watched query.
//!
//! A [`Registration`] remembers which query a channel watches, the security
//! context it was registered under and the identities that matched the last
//! time a diff was delivered. Two backends are provided:
//! - [`InMemoryRegistrationStore`] for a single server process
//! - [`FileRegistrationStore`] for several processes sharing one directory
//!
//! Concurrent writers to one registration are last-write-wins. The change
//! publisher always recomputes against live data, so a stale identity list
//! heals on the next mutation.

mod file;
mod memory;

pub use file::{FileRegistrationStore, FileStoreConfig};
pub use memory::InMemoryRegistrationStore;

use crate::error::{LiveQueryError, Result};
use crate::types::{Identity, QuerySpec, SecurityContext};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every live query channel id.
pub const CHANNEL_PREFIX: &str = "lq-";

/// A watched query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Channel the query's diffs are published on.
    pub id: String,
    pub entity_key: String,
    /// Serialized [`QuerySpec`]; parsed lazily so a corrupt entry only
    /// affects itself.
    pub query: String,
    /// Ordered identities that matched at the last delivered diff.
    pub identities: Vec<Identity>,
    /// Context the query was registered under.
    pub context: SecurityContext,
}

impl Registration {
    pub fn new(
        entity_key: impl Into<String>,
        query: &QuerySpec,
        context: SecurityContext,
        identities: Vec<Identity>,
    ) -> Result<Self> {
        let entity_key = entity_key.into();
        let query = query.to_json()?;
        Ok(Self {
            id: channel_id(&entity_key, &context, &query),
            entity_key,
            query,
            identities,
            context,
        })
    }

    /// Parse the stored query.
    pub fn query(&self) -> Result<QuerySpec> {
        QuerySpec::from_json(&self.query).map_err(|e| LiveQueryError::MalformedRegistration {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Derive the channel id for a query registered under `context`.
///
/// The same subject asking the same query of the same entity always lands on
/// the same channel; anyone else gets a different one.
pub fn channel_id(entity_key: &str, context: &SecurityContext, query_json: &str) -> String {
    let mut roles: Vec<&str> = context.roles.iter().map(String::as_str).collect();
    roles.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(entity_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.subject().as_bytes());
    hasher.update([0u8]);
    hasher.update(roles.join(",").as_bytes());
    hasher.update([0u8]);
    hasher.update(query_json.as_bytes());
    let digest = hasher.finalize();

    format!("{}{}", CHANNEL_PREFIX, hex::encode(&digest[..16]))
}

/// Backend holding registrations.
pub trait RegistrationStore: Send + Sync {
    /// Insert or replace a registration.
    fn add(&self, registration: Registration) -> Result<()>;

    /// Remove a registration. Returns whether it existed.
    fn remove(&self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<Registration>>;

    /// Every registration.
    fn list(&self) -> Result<Vec<Registration>>;

    /// Registrations watching one entity type.
    fn list_for_entity(&self, entity_key: &str) -> Result<Vec<Registration>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.entity_key == entity_key)
            .collect())
    }

    fn identities(&self, id: &str) -> Result<Option<Vec<Identity>>> {
        Ok(self.get(id)?.map(|r| r.identities))
    }

    /// Replace the identity list. Returns false if the registration is gone.
    fn set_identities(&self, id: &str, identities: Vec<Identity>) -> Result<bool>;
}
