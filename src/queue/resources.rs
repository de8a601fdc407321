use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::sync::lock;

pub type Resource = Arc<dyn Any + Send + Sync>;

#[derive(Debug)]
struct Entry {
    resource: Resource,
    holders: usize,
}

/// Transient resources of in-flight items (open streams, parsed
/// documents), kept out of the serializable item and keyed by item id.
///
/// Item ids are correlation ids, so every instance of one study maps to the
/// same entry: one shared handle per id. Each clone and each further insert
/// for the id is a holder, and the entry is dropped when the last holder is
/// dequeued.
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `resource` to `id` and return the handle now in effect.
    ///
    /// When the id already holds a resource that one is kept, the caller
    /// becomes another holder and gets the existing handle back.
    pub fn insert(&self, id: impl Into<String>, resource: Resource) -> Resource {
        let id = id.into();
        let mut entries = lock(&self.entries);
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.holders += 1;
                debug!(item_id = %id, holders = entry.holders, "joined existing item resource");
                entry.resource.clone()
            }
            None => {
                entries.insert(
                    id,
                    Entry {
                        resource: resource.clone(),
                        holders: 1,
                    },
                );
                resource
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Resource> {
        lock(&self.entries).get(id).map(|entry| entry.resource.clone())
    }

    /// Typed access; None when absent or of another type
    pub fn get_as<T: Any + Send + Sync>(&self, id: &str) -> Option<Arc<T>> {
        self.get(id)?.downcast::<T>().ok()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Register one more holder; no-op for ids without a resource
    pub(crate) fn share(&self, id: &str) {
        if let Some(entry) = lock(&self.entries).get_mut(id) {
            entry.holders += 1;
        }
    }

    /// Drop one holder. Returns true when that released the resource.
    pub(crate) fn release(&self, id: &str) -> bool {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            entries.remove(id);
            debug!(item_id = id, "released item resources");
            true
        } else {
            false
        }
    }
}
