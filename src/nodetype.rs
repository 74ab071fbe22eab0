//! Node type registry interface used by the root bootstrap.

use crate::error::{Result, StateError};
use crate::types::{names, Name, NodeDefId, PropDefId, PropertyType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Definition of a property allowed on a node type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropDef {
    pub id: PropDefId,
    pub name: Name,
    pub required_type: PropertyType,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub mandatory: bool,
}

/// Aggregated view of a node type and everything it inherits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveNodeType {
    pub name: Name,
    #[serde(default)]
    pub property_defs: Vec<PropDef>,
}

impl EffectiveNodeType {
    /// The definition applying to a property with this name, type and
    /// multiplicity. `Undefined` on either side matches any type.
    pub fn applicable_property_def(
        &self,
        name: &Name,
        property_type: PropertyType,
        multiple: bool,
    ) -> Result<&PropDef> {
        self.property_defs
            .iter()
            .find(|def| {
                &def.name == name
                    && def.multiple == multiple
                    && (def.required_type == property_type
                        || def.required_type == PropertyType::Undefined
                        || property_type == PropertyType::Undefined)
            })
            .ok_or_else(|| {
                StateError::ConstraintViolation(format!(
                    "no applicable definition for property {} on {}",
                    name, self.name
                ))
            })
    }
}

/// Registry of node types.
pub trait NodeTypeRegistry: Send + Sync {
    /// Definition id assigned to the root node.
    fn root_node_definition(&self) -> Result<NodeDefId>;

    fn effective_node_type(&self, name: &Name) -> Result<EffectiveNodeType>;
}

/// Serialized form of a [`StaticNodeTypeRegistry`].
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RegistryDocument {
    root_definition: NodeDefId,
    node_types: Vec<EffectiveNodeType>,
}

/// Registry over a fixed set of node types.
#[derive(Clone, Debug)]
pub struct StaticNodeTypeRegistry {
    root_definition: NodeDefId,
    node_types: HashMap<Name, EffectiveNodeType>,
}

impl StaticNodeTypeRegistry {
    pub fn new(root_definition: NodeDefId) -> Self {
        Self {
            root_definition,
            node_types: HashMap::new(),
        }
    }

    pub fn register(&mut self, node_type: EffectiveNodeType) {
        self.node_types.insert(node_type.name.clone(), node_type);
    }

    /// Load from a JSON document:
    /// `{"root_definition": "...", "node_types": [{"name": ..., "property_defs": [...]}]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: RegistryDocument = serde_json::from_str(json)
            .map_err(|e| StateError::Deserialization(e.to_string()))?;
        let mut registry = Self::new(doc.root_definition);
        for node_type in doc.node_types {
            registry.register(node_type);
        }
        Ok(registry)
    }
}

impl Default for StaticNodeTypeRegistry {
    fn default() -> Self {
        let mut registry = Self::new(NodeDefId("rep:root/rootDef".to_string()));
        registry.register(EffectiveNodeType {
            name: Name::from(names::REP_ROOT),
            property_defs: vec![PropDef {
                id: PropDefId("nt:base/jcr:primaryType".to_string()),
                name: Name::from(names::JCR_PRIMARY_TYPE),
                required_type: PropertyType::Name,
                multiple: false,
                mandatory: true,
            }],
        });
        registry
    }
}

impl NodeTypeRegistry for StaticNodeTypeRegistry {
    fn root_node_definition(&self) -> Result<NodeDefId> {
        Ok(self.root_definition.clone())
    }

    fn effective_node_type(&self, name: &Name) -> Result<EffectiveNodeType> {
        self.node_types
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::NoSuchNodeType(name.clone()))
    }
}
