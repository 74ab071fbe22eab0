//! Node and property item states.

use crate::types::{ItemId, Name, NodeDefId, NodeId, PropDefId, PropertyId, PropertyType, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Handle to the single shared copy of an item.
pub type SharedItem = Arc<RwLock<ItemState>>;

/// Wrap a state into a shared handle.
pub fn shared(state: ItemState) -> SharedItem {
    Arc::new(RwLock::new(state))
}

/// Lifecycle status of an item state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Not yet persisted.
    New,
    /// Persisted and in sync.
    Existing,
    /// Persisted; modified by a session but not yet saved.
    ExistingModified,
    /// Persisted; removed by a session but not yet saved.
    ExistingRemoved,
    /// The persisted copy moved on underneath an overlay.
    StaleModified,
    /// The persisted copy vanished underneath an overlay.
    StaleDestroyed,
    /// Was persisted and is now gone.
    Destroyed,
    /// Abandoned without ever being persisted in its current form.
    Discarded,
}

impl ItemStatus {
    /// True for states carrying unsaved session changes.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ItemStatus::New | ItemStatus::ExistingModified | ItemStatus::ExistingRemoved
        )
    }

    pub fn is_stale(self) -> bool {
        matches!(self, ItemStatus::StaleModified | ItemStatus::StaleDestroyed)
    }

    /// True once the state must no longer be served.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Destroyed | ItemStatus::Discarded)
    }
}

/// Entry in a node's ordered child list. `index` is 1-based among same-name siblings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildNodeEntry {
    pub name: Name,
    pub id: NodeId,
    pub index: u32,
}

/// Node-specific item data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub parent: Option<NodeId>,
    pub node_type: Name,
    pub mixin_types: BTreeSet<Name>,
    pub definition_id: Option<NodeDefId>,
    child_node_entries: Vec<ChildNodeEntry>,
    property_names: BTreeSet<Name>,
}

impl NodeState {
    pub fn new(node_type: Name, parent: Option<NodeId>) -> Self {
        Self {
            parent,
            node_type,
            mixin_types: BTreeSet::new(),
            definition_id: None,
            child_node_entries: Vec::new(),
            property_names: BTreeSet::new(),
        }
    }

    pub fn child_node_entries(&self) -> &[ChildNodeEntry] {
        &self.child_node_entries
    }

    /// Look up a child by name and same-name-sibling index.
    pub fn child_node_entry(&self, name: &Name, index: u32) -> Option<&ChildNodeEntry> {
        self.child_node_entries
            .iter()
            .find(|e| &e.name == name && e.index == index)
    }

    pub fn child_node_entry_by_id(&self, id: &NodeId) -> Option<&ChildNodeEntry> {
        self.child_node_entries.iter().find(|e| &e.id == id)
    }

    pub fn has_child_node_entry(&self, id: &NodeId) -> bool {
        self.child_node_entry_by_id(id).is_some()
    }

    /// Append a child; returns the entry with its assigned sibling index.
    pub fn add_child_node_entry(&mut self, name: Name, id: NodeId) -> ChildNodeEntry {
        let index = self
            .child_node_entries
            .iter()
            .filter(|e| e.name == name)
            .count() as u32
            + 1;
        let entry = ChildNodeEntry { name, id, index };
        self.child_node_entries.push(entry.clone());
        entry
    }

    /// Remove a child by id. Later same-name siblings shift down by one.
    pub fn remove_child_node_entry(&mut self, id: &NodeId) -> Option<ChildNodeEntry> {
        let pos = self.child_node_entries.iter().position(|e| &e.id == id)?;
        let removed = self.child_node_entries.remove(pos);
        self.reindex(&removed.name);
        Some(removed)
    }

    /// Rename a child in place, keeping its position.
    pub fn rename_child_node_entry(&mut self, id: &NodeId, new_name: Name) -> bool {
        let old_name = match self.child_node_entries.iter_mut().find(|e| &e.id == id) {
            Some(entry) => std::mem::replace(&mut entry.name, new_name.clone()),
            None => return false,
        };
        self.reindex(&old_name);
        self.reindex(&new_name);
        true
    }

    /// Move `id` before `before`, or to the end when `before` is None.
    pub fn reorder_child_node_entry(&mut self, id: &NodeId, before: Option<&NodeId>) -> bool {
        let pos = match self.child_node_entries.iter().position(|e| &e.id == id) {
            Some(pos) => pos,
            None => return false,
        };
        if before == Some(id) {
            return true;
        }
        let entry = self.child_node_entries.remove(pos);
        let name = entry.name.clone();
        match before {
            Some(before) => match self.child_node_entries.iter().position(|e| &e.id == before) {
                Some(target) => self.child_node_entries.insert(target, entry),
                None => {
                    self.child_node_entries.insert(pos, entry);
                    return false;
                }
            },
            None => self.child_node_entries.push(entry),
        }
        self.reindex(&name);
        true
    }

    fn reindex(&mut self, name: &Name) {
        let mut next = 1;
        for entry in self.child_node_entries.iter_mut().filter(|e| &e.name == name) {
            entry.index = next;
            next += 1;
        }
    }

    pub fn property_names(&self) -> impl Iterator<Item = &Name> {
        self.property_names.iter()
    }

    pub fn has_property_name(&self, name: &Name) -> bool {
        self.property_names.contains(name)
    }

    pub fn add_property_name(&mut self, name: Name) -> bool {
        self.property_names.insert(name)
    }

    pub fn remove_property_name(&mut self, name: &Name) -> bool {
        self.property_names.remove(name)
    }
}

/// Property-specific item data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyState {
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub definition_id: Option<PropDefId>,
    values: Vec<Value>,
}

impl PropertyState {
    pub fn new(property_type: PropertyType, multi_valued: bool) -> Self {
        Self {
            property_type,
            multi_valued,
            definition_id: None,
            values: Vec::new(),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn set_values(&mut self, values: Vec<Value>) {
        self.values = values;
    }

    /// Nodes targeted by reference values.
    pub fn reference_targets(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.values.iter().filter_map(Value::as_reference)
    }
}

/// Node or property payload of an item state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ItemData {
    Node(NodeState),
    Property(PropertyState),
}

/// Versioned, mutable representation of one node or property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    id: ItemId,
    status: ItemStatus,
    mod_count: u64,
    data: ItemData,
}

impl ItemState {
    pub fn new_node(id: NodeId, node_type: Name, parent: Option<NodeId>) -> Self {
        Self {
            id: ItemId::Node(id),
            status: ItemStatus::New,
            mod_count: 0,
            data: ItemData::Node(NodeState::new(node_type, parent)),
        }
    }

    pub fn new_property(id: PropertyId, property_type: PropertyType, multi_valued: bool) -> Self {
        Self {
            id: ItemId::Property(id),
            status: ItemStatus::New,
            mod_count: 0,
            data: ItemData::Property(PropertyState::new(property_type, multi_valued)),
        }
    }

    /// Empty state of the right kind for `id`.
    pub fn empty(id: &ItemId) -> Self {
        match id {
            ItemId::Node(id) => Self::new_node(*id, Name::default(), None),
            ItemId::Property(id) => {
                Self::new_property(id.clone(), PropertyType::Undefined, false)
            }
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }

    /// Number of durable modifications applied to this copy.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    pub(crate) fn touch(&mut self) {
        self.mod_count += 1;
    }

    pub fn is_node(&self) -> bool {
        matches!(self.data, ItemData::Node(_))
    }

    pub fn data(&self) -> &ItemData {
        &self.data
    }

    pub fn as_node(&self) -> Option<&NodeState> {
        match &self.data {
            ItemData::Node(node) => Some(node),
            ItemData::Property(_) => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut NodeState> {
        match &mut self.data {
            ItemData::Node(node) => Some(node),
            ItemData::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyState> {
        match &self.data {
            ItemData::Property(prop) => Some(prop),
            ItemData::Node(_) => None,
        }
    }

    pub fn as_property_mut(&mut self) -> Option<&mut PropertyState> {
        match &mut self.data {
            ItemData::Property(prop) => Some(prop),
            ItemData::Node(_) => None,
        }
    }

    /// Parent node: a node's parent, or a property's owning node.
    pub fn parent_id(&self) -> Option<NodeId> {
        match (&self.id, &self.data) {
            (ItemId::Property(id), _) => Some(id.parent),
            (ItemId::Node(_), ItemData::Node(node)) => node.parent,
            (ItemId::Node(_), ItemData::Property(_)) => None,
        }
    }

    /// Overwrite item data from `other`, keeping identity, status and mod count.
    pub fn copy_from(&mut self, other: &ItemState) {
        self.data = other.data.clone();
    }
}
