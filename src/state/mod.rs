//! Item states: shared copies, session overlays, reference records and
//! the logical operations sessions record against them.

mod item;
mod local;
mod operation;
mod references;

pub use item::{
    shared, ChildNodeEntry, ItemData, ItemState, ItemStatus, NodeState, PropertyState, SharedItem,
};
pub use local::LocalItem;
pub use operation::{Operation, OperationId, OperationKind};
pub use references::NodeReferences;
