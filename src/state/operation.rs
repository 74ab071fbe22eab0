//! Logical operations recorded alongside item state changes.

use crate::types::{ItemId, Name, NodeId, PropertyId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a recorded operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op({})", self.0)
    }
}

/// What a session did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    AddNode {
        parent: NodeId,
        node: NodeId,
        name: Name,
        node_type: Name,
    },
    AddProperty {
        parent: NodeId,
        property: PropertyId,
    },
    Remove {
        item: ItemId,
        parent: Option<NodeId>,
    },
    SetPropertyValue {
        property: PropertyId,
    },
    Move {
        node: NodeId,
        src_parent: NodeId,
        dest_parent: NodeId,
    },
    ReorderNodes {
        parent: NodeId,
        node: NodeId,
        before: Option<NodeId>,
    },
    SetMixins {
        node: NodeId,
    },
}

/// A recorded operation. Two operations are equal only if they are the
/// same recording, never by content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: OperationId(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Items that must be part of the same save for this operation to be
    /// applied consistently.
    pub fn affected_items(&self) -> Vec<ItemId> {
        match &self.kind {
            OperationKind::AddNode { parent, node, .. } => {
                vec![ItemId::Node(*parent), ItemId::Node(*node)]
            }
            OperationKind::AddProperty { parent, property } => {
                vec![ItemId::Node(*parent), ItemId::Property(property.clone())]
            }
            OperationKind::Remove { item, parent } => {
                let mut items = vec![item.clone()];
                if let Some(parent) = parent {
                    items.push(ItemId::Node(*parent));
                }
                items
            }
            OperationKind::SetPropertyValue { property } => {
                vec![ItemId::Property(property.clone())]
            }
            OperationKind::Move {
                node,
                src_parent,
                dest_parent,
            } => {
                let mut items = vec![ItemId::Node(*node), ItemId::Node(*src_parent)];
                if dest_parent != src_parent {
                    items.push(ItemId::Node(*dest_parent));
                }
                items
            }
            OperationKind::ReorderNodes { parent, .. } => vec![ItemId::Node(*parent)],
            OperationKind::SetMixins { node } => vec![ItemId::Node(*node)],
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
