use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RegistryError;

/// Id-keyed arena of live entities in one namespace.
///
/// The registry owns its entries; callers get an `Arc` for the duration of one
/// operation. Every method takes the lock once, so a lookup racing a removal
/// sees either the entry or `NotFound`, never a partially inserted value.
pub struct Registry<T: ?Sized> {
    namespace: &'static str,
    entries: Mutex<BTreeMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Fails with [`RegistryError::AlreadyExists`] when `id` is taken.
    pub fn ensure_vacant(&self, id: &str) -> Result<(), RegistryError> {
        if self.entries().contains_key(id) {
            return Err(self.already_exists(id));
        }
        Ok(())
    }

    /// Register `entity` under `id`. Never replaces an existing entry.
    pub fn insert(&self, id: impl Into<String>, entity: Arc<T>) -> Result<(), RegistryError> {
        let id = id.into();
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(self.already_exists(&id));
        }
        entries.insert(id, entity);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<T>, RegistryError> {
        self.entries()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                namespace: self.namespace,
                id: id.to_string(),
            })
    }

    /// Remove `id`, returning the entry if it was still present.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.entries().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Current entries in id order.
    pub fn snapshot(&self) -> Vec<(String, Arc<T>)> {
        self.entries()
            .iter()
            .map(|(id, entity)| (id.clone(), entity.clone()))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(String, Arc<T>)> {
        std::mem::take(&mut *self.entries()).into_iter().collect()
    }

    fn already_exists(&self, id: &str) -> RegistryError {
        RegistryError::AlreadyExists {
            namespace: self.namespace,
            id: id.to_string(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespace", &self.namespace)
            .field("len", &self.len())
            .finish()
    }
}
