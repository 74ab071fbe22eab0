//! In-memory persistence backend.

use super::{ChangeSet, PersistenceManager};
use crate::changelog::ChangeLog;
use crate::error::{Result, StateError};
use crate::state::{ItemState, ItemStatus, NodeReferences, SharedItem};
use crate::types::{ItemId, NodeReferencesId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Persisted contents.
#[derive(Clone, Default)]
struct Contents {
    items: HashMap<ItemId, ItemState>,
    references: HashMap<NodeReferencesId, NodeReferences>,
}

/// Backend keeping everything in process memory.
///
/// A batch is validated and applied to a copy of the contents which then
/// replaces the live contents, so readers never observe half a batch.
#[derive(Default)]
pub struct MemoryPersistenceManager {
    contents: RwLock<Contents>,
    loads: AtomicU64,
    stores: AtomicU64,
    fail_next_store: AtomicBool,
}

impl MemoryPersistenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful item loads served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of batches applied.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::SeqCst)
    }

    /// Make the next `store` fail without applying anything.
    pub fn fail_next_store(&self) {
        self.fail_next_store.store(true, Ordering::SeqCst);
    }

    pub fn item_count(&self) -> usize {
        self.contents.read().items.len()
    }

    /// Write an item directly, bypassing change logs.
    pub fn put(&self, mut state: ItemState) {
        state.set_status(ItemStatus::Existing);
        self.contents
            .write()
            .items
            .insert(state.id().clone(), state);
    }

    /// Remove an item directly, bypassing change logs.
    pub fn remove(&self, id: &ItemId) -> Option<ItemState> {
        self.contents.write().items.remove(id)
    }

    /// Apply an owned batch. Modified and deleted items must exist.
    pub fn apply(&self, set: &ChangeSet) -> Result<()> {
        let mut contents = self.contents.write();
        let missing = set
            .modified
            .iter()
            .map(ItemState::id)
            .chain(set.deleted.iter())
            .find(|id| !contents.items.contains_key(*id));
        if let Some(id) = missing {
            return Err(StateError::Persistence(format!(
                "cannot update {}: item does not exist",
                id
            )));
        }

        let mut next = contents.clone();
        for state in set.written() {
            let mut state = state.clone();
            state.set_status(ItemStatus::Existing);
            next.items.insert(state.id().clone(), state);
        }
        for id in &set.deleted {
            next.items.remove(id);
        }
        for refs in &set.references {
            if refs.has_references() {
                next.references.insert(refs.id(), refs.clone());
            } else {
                next.references.remove(&refs.id());
            }
        }
        *contents = next;
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PersistenceManager for MemoryPersistenceManager {
    fn load(&self, id: &ItemId) -> Result<ItemState> {
        let state = self
            .contents
            .read()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| StateError::NoSuchItem(id.clone()))?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(state)
    }

    fn exists(&self, id: &ItemId) -> Result<bool> {
        Ok(self.contents.read().items.contains_key(id))
    }

    fn store(&self, log: &ChangeLog<SharedItem>) -> Result<()> {
        if self.fail_next_store.swap(false, Ordering::SeqCst) {
            return Err(StateError::Persistence("injected store failure".into()));
        }
        self.apply(&ChangeSet::from_log(log))
    }

    fn load_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        self.contents
            .read()
            .references
            .get(id)
            .cloned()
            .ok_or(StateError::NoSuchReferences(*id))
    }

    fn exists_references(&self, id: &NodeReferencesId) -> Result<bool> {
        Ok(self.contents.read().references.contains_key(id))
    }
}
