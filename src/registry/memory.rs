//! In-process registration store.

use super::{Registration, RegistrationStore};
use crate::error::Result;
use crate::types::Identity;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct Inner {
    /// Registrations by channel id.
    registrations: HashMap<String, Registration>,
    /// Entity key to channel ids.
    by_entity: HashMap<String, BTreeSet<String>>,
}

/// Registration store kept in memory. Lost on restart.
#[derive(Default)]
pub struct InMemoryRegistrationStore {
    inner: RwLock<Inner>,
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistrationStore for InMemoryRegistrationStore {
    fn add(&self, registration: Registration) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(previous) = inner.registrations.get(&registration.id) {
            if previous.entity_key != registration.entity_key {
                if let Some(ids) = inner.by_entity.get_mut(&previous.entity_key) {
                    ids.remove(&registration.id);
                }
            }
        }
        inner
            .by_entity
            .entry(registration.entity_key.clone())
            .or_default()
            .insert(registration.id.clone());
        inner
            .registrations
            .insert(registration.id.clone(), registration);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(removed) = inner.registrations.remove(id) else {
            return Ok(false);
        };
        if let Some(ids) = inner.by_entity.get_mut(&removed.entity_key) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_entity.remove(&removed.entity_key);
            }
        }
        Ok(true)
    }

    fn get(&self, id: &str) -> Result<Option<Registration>> {
        Ok(self.inner.read().registrations.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Registration>> {
        Ok(self.inner.read().registrations.values().cloned().collect())
    }

    fn list_for_entity(&self, entity_key: &str) -> Result<Vec<Registration>> {
        let inner = self.inner.read();
        Ok(inner
            .by_entity
            .get(entity_key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.registrations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn set_identities(&self, id: &str, identities: Vec<Identity>) -> Result<bool> {
        match self.inner.write().registrations.get_mut(id) {
            Some(registration) => {
                registration.identities = identities;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
