//! Persistence backends.
//!
//! The manager consumes a backend through [`PersistenceManager`]. Two
//! implementations ship with the crate:
//! - [`MemoryPersistenceManager`]: maps behind a lock, for embedding and tests
//! - [`FilePersistenceManager`]: one checksummed file per item and reference
//!   record, with a write-ahead [`ChangeJournal`] making each batch
//!   replayable after a crash

mod file;
mod journal;
mod memory;

pub use file::FilePersistenceManager;
pub use journal::{ChangeJournal, JournalEntry, JournalEntryStatus};
pub use memory::MemoryPersistenceManager;

use crate::changelog::ChangeLog;
use crate::error::Result;
use crate::state::{ItemState, NodeReferences, SharedItem};
use crate::types::{ItemId, NodeReferencesId};
use serde::{Deserialize, Serialize};

/// Durable store for item states and reference records.
pub trait PersistenceManager: Send + Sync {
    /// Load a persisted item. Fails with a not-found error if absent.
    fn load(&self, id: &ItemId) -> Result<ItemState>;

    fn exists(&self, id: &ItemId) -> Result<bool>;

    /// A fresh, not yet durable state for `id` (status `New`).
    fn create_new(&self, id: &ItemId) -> ItemState {
        ItemState::empty(id)
    }

    /// Durably apply every added, modified and deleted item and every
    /// modified reference record in `log`.
    fn store(&self, log: &ChangeLog<SharedItem>) -> Result<()>;

    /// Load a reference record. Fails with a not-found error if absent.
    fn load_references(&self, id: &NodeReferencesId) -> Result<NodeReferences>;

    fn exists_references(&self, id: &NodeReferencesId) -> Result<bool>;
}

/// Owned snapshot of a shared change log, as a backend applies it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<ItemState>,
    pub modified: Vec<ItemState>,
    pub deleted: Vec<ItemId>,
    pub references: Vec<NodeReferences>,
}

impl ChangeSet {
    /// Copy the current contents of every shared state in `log`.
    pub fn from_log(log: &ChangeLog<SharedItem>) -> Self {
        Self {
            added: log.added_states().map(|s| s.read().clone()).collect(),
            modified: log.modified_states().map(|s| s.read().clone()).collect(),
            deleted: log
                .deleted_states()
                .map(|s| s.read().id().clone())
                .collect(),
            references: log.modified_references().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.references.is_empty()
    }

    /// Items written by this batch, added first.
    pub fn written(&self) -> impl Iterator<Item = &ItemState> {
        self.added.iter().chain(self.modified.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{shared, NodeReferences};
    use crate::types::{NodeId, PropertyId};

    #[test]
    fn test_change_set_snapshot() {
        let root = NodeId::generate();
        let mut log: ChangeLog<SharedItem> = ChangeLog::new(ItemId::Node(root));
        log.added(shared(ItemState::new_node(NodeId::generate(), "nt:base".into(), Some(root))));
        log.modified(shared(ItemState::new_node(root, "rep:root".into(), None)));
        log.deleted(shared(ItemState::new_property(
            PropertyId::new(root, "old"),
            Default::default(),
            false,
        )));
        log.modified_refs(NodeReferences::new(NodeReferencesId(root)));

        let set = ChangeSet::from_log(&log);
        assert_eq!(set.added.len(), 1);
        assert_eq!(set.modified.len(), 1);
        assert_eq!(set.deleted, vec![ItemId::Property(PropertyId::new(root, "old"))]);
        assert_eq!(set.references.len(), 1);
        assert_eq!(set.written().count(), 2);
        assert!(!set.is_empty());
    }
}
