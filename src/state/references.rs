//! Back-reference records kept for nodes targeted by REFERENCE properties.

use crate::types::{NodeId, NodeReferencesId, PropertyId};
use serde::{Deserialize, Serialize};

/// The set of REFERENCE properties pointing at one target node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReferences {
    id: NodeReferencesId,
    references: Vec<PropertyId>,
}

impl NodeReferences {
    pub fn new(id: NodeReferencesId) -> Self {
        Self {
            id,
            references: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeReferencesId {
        self.id
    }

    pub fn target(&self) -> NodeId {
        self.id.target()
    }

    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }

    pub fn references(&self) -> &[PropertyId] {
        &self.references
    }

    /// Record a referring property. A property may be recorded more than once
    /// when it is multi-valued and holds the target repeatedly.
    pub fn add_reference(&mut self, property: PropertyId) {
        self.references.push(property);
    }

    /// Drop one occurrence of `property`.
    pub fn remove_reference(&mut self, property: &PropertyId) -> bool {
        match self.references.iter().position(|p| p == property) {
            Some(pos) => {
                self.references.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear_all_references(&mut self) {
        self.references.clear();
    }

    /// Replace all recorded references with those of `other`.
    pub fn copy_from(&mut self, other: &NodeReferences) {
        self.references = other.references.clone();
    }
}
