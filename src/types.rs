//! Core identity and value types for the item state layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counter mixed into generated node ids.
static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Path-independent identifier of a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// Derive a stable id from a well-known name.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"node:");
        hasher.update(name.as_bytes());
        Self::from_digest(&hasher.finalize())
    }

    /// Mint a fresh id, unique within this process.
    pub fn generate() -> Self {
        let count = NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(count.to_le_bytes());
        hasher.update(Timestamp::now().0.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        Self::from_digest(&hasher.finalize())
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        NodeId(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(NodeId(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Qualified item or type name, e.g. `jcr:primaryType`.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(pub String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Name(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name(s.to_string())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known names used by the root bootstrap.
pub mod names {
    /// Node type of the repository root.
    pub const REP_ROOT: &str = "rep:root";
    /// Mandatory property holding a node's primary type.
    pub const JCR_PRIMARY_TYPE: &str = "jcr:primaryType";
}

/// Property identity: derived from the parent node and the property name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyId {
    pub parent: NodeId,
    pub name: Name,
}

impl PropertyId {
    pub fn new(parent: NodeId, name: impl Into<Name>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

impl fmt::Debug for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyId({}/{})", &self.parent.to_hex()[..8], self.name)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Identity of either a node or a property.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn denotes_node(&self) -> bool {
        matches!(self, ItemId::Node(_))
    }

    /// The node id, if this denotes a node.
    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            ItemId::Node(id) => Some(id),
            ItemId::Property(_) => None,
        }
    }

    /// The property id, if this denotes a property.
    pub fn as_property(&self) -> Option<&PropertyId> {
        match self {
            ItemId::Node(_) => None,
            ItemId::Property(id) => Some(id),
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "{:?}", id),
            ItemId::Property(id) => write!(f, "{:?}", id),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "{}", id),
            ItemId::Property(id) => write!(f, "{}", id),
        }
    }
}

/// Identity of the reference record kept for a target node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeReferencesId(pub NodeId);

impl NodeReferencesId {
    pub fn target(&self) -> NodeId {
        self.0
    }
}

impl fmt::Debug for NodeReferencesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeReferencesId({}...)", &self.0.to_hex()[..8])
    }
}

impl fmt::Display for NodeReferencesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refs:{}", self.0)
    }
}

/// Id of an applicable node definition in the node type registry.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NodeDefId(pub String);

/// Id of an applicable property definition in the node type registry.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PropDefId(pub String);

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Declared type of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Undefined,
    String,
    Binary,
    Long,
    Double,
    Date,
    Boolean,
    Name,
    Reference,
}

impl Default for PropertyType {
    fn default() -> Self {
        PropertyType::Undefined
    }
}

/// Internal representation of a single property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Name(Name),
    Reference(NodeId),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(Timestamp),
    Binary(Vec<u8>),
}

impl Value {
    /// The property type this value carries.
    pub fn property_type(&self) -> PropertyType {
        match self {
            Value::String(_) => PropertyType::String,
            Value::Name(_) => PropertyType::Name,
            Value::Reference(_) => PropertyType::Reference,
            Value::Long(_) => PropertyType::Long,
            Value::Double(_) => PropertyType::Double,
            Value::Boolean(_) => PropertyType::Boolean,
            Value::Date(_) => PropertyType::Date,
            Value::Binary(_) => PropertyType::Binary,
        }
    }

    /// Target node, if this is a reference value.
    pub fn as_reference(&self) -> Option<NodeId> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }
}
