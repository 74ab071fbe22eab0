//! Read-mostly providers answering for identities outside the persisted tree.

use crate::error::{Result, StateError};
use crate::state::{shared, ItemState, ItemStatus, NodeReferences, SharedItem};
use crate::types::{ItemId, NodeId, NodeReferencesId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A provider of virtual item states, e.g. a generated subtree.
pub trait VirtualItemStateProvider: Send + Sync {
    /// True if `id` is one of this provider's virtual roots.
    fn is_virtual_root(&self, id: &ItemId) -> bool;

    /// Id of the node this provider's subtree hangs off.
    fn virtual_root_id(&self) -> NodeId;

    /// True if this provider owns `id`.
    fn has_item_state(&self, id: &ItemId) -> bool;

    fn get_item_state(&self, id: &ItemId) -> Result<SharedItem>;

    fn has_node_references(&self, id: &NodeReferencesId) -> bool;

    fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences>;

    /// Accept a reference-record update. Returns false if the target is not
    /// in this provider's subtree.
    ///
    /// Called while the manager holds its write lock; must not call back
    /// into the manager.
    fn set_node_references(&self, refs: &NodeReferences) -> bool;
}

/// Virtual subtree held entirely in memory.
pub struct MemoryVirtualProvider {
    root: NodeId,
    items: RwLock<HashMap<ItemId, SharedItem>>,
    references: RwLock<HashMap<NodeReferencesId, NodeReferences>>,
}

impl MemoryVirtualProvider {
    /// Create a provider whose virtual root is `root`.
    pub fn new(root: ItemState) -> Result<Self> {
        let root_id = match root.id() {
            ItemId::Node(id) => *id,
            other => {
                return Err(StateError::ItemState(format!(
                    "virtual root {} must be a node",
                    other
                )))
            }
        };
        let provider = Self {
            root: root_id,
            items: RwLock::new(HashMap::new()),
            references: RwLock::new(HashMap::new()),
        };
        provider.insert(root);
        Ok(provider)
    }

    /// Add or replace an item in the virtual subtree.
    pub fn insert(&self, mut state: ItemState) -> SharedItem {
        state.set_status(ItemStatus::Existing);
        let id = state.id().clone();
        let handle = shared(state);
        self.items.write().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, id: &ItemId) -> Option<SharedItem> {
        self.items.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl VirtualItemStateProvider for MemoryVirtualProvider {
    fn is_virtual_root(&self, id: &ItemId) -> bool {
        id.as_node() == Some(&self.root)
    }

    fn virtual_root_id(&self) -> NodeId {
        self.root
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        self.items.read().contains_key(id)
    }

    fn get_item_state(&self, id: &ItemId) -> Result<SharedItem> {
        self.items
            .read()
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| StateError::NoSuchItem(id.clone()))
    }

    fn has_node_references(&self, id: &NodeReferencesId) -> bool {
        self.references.read().contains_key(id)
    }

    fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        self.references
            .read()
            .get(id)
            .cloned()
            .ok_or(StateError::NoSuchReferences(*id))
    }

    fn set_node_references(&self, refs: &NodeReferences) -> bool {
        if !self.has_item_state(&ItemId::Node(refs.target())) {
            return false;
        }
        let mut references = self.references.write();
        if refs.has_references() {
            references.insert(refs.id(), refs.clone());
        } else {
            references.remove(&refs.id());
        }
        true
    }
}
