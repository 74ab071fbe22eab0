//! # Tree State
//!
//! The shared item state layer of a hierarchical content repository. It
//! keeps one authoritative in-memory copy of every loaded node and
//! property, lets sessions read through it, and commits their change logs
//! atomically against a persistence backend.
//!
//! ## Core Concepts
//!
//! - **Item states**: versioned node and property data with a lifecycle status
//! - **Local items**: session-private overlays connected to shared copies
//! - **Change logs**: the unit of work a save commits
//! - **Shared item state manager**: cache, read path and commit protocol
//! - **Virtual providers**: subtrees served from outside the persisted tree
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use treestate::{
//!     ChangeLog, ItemId, LocalItem, MemoryPersistenceManager, RepositoryConfig,
//!     SharedItemStateManager, StaticNodeTypeRegistry,
//! };
//!
//! let manager = SharedItemStateManager::new(
//!     RepositoryConfig::default(),
//!     Arc::new(MemoryPersistenceManager::new()),
//!     &StaticNodeTypeRegistry::default(),
//! )?;
//!
//! let root = manager.get_item_state(&ItemId::Node(manager.root_id()))?;
//! let mut local = LocalItem::overlaying(&root);
//! local.state_mut().as_node_mut().unwrap().mixin_types.insert("mix:referenceable".into());
//!
//! let mut log = ChangeLog::new(ItemId::Node(manager.root_id()));
//! log.modified(local);
//! manager.store(&mut log, None)?;
//! ```

pub mod cache;
pub mod changelog;
pub mod config;
pub mod error;
pub mod manager;
pub mod nodetype;
pub mod observation;
pub mod persistence;
pub mod state;
pub mod types;
pub mod virtual_provider;

// Re-exports
pub use cache::ItemStateCache;
pub use changelog::{ChangeLog, PersistedHook, TrackedState};
pub use config::{FilePersistenceConfig, RepositoryConfig, DEFAULT_ROOT_NAME};
pub use error::{Result, StateError};
pub use manager::{ItemStateEvent, SharedItemStateManager, StateTransition};
pub use nodetype::{EffectiveNodeType, NodeTypeRegistry, PropDef, StaticNodeTypeRegistry};
pub use observation::{
    ChannelObservationSink, EventBundle, EventStateCollection, ItemStateProvider,
    ObservationEvent, ObservationSink,
};
pub use persistence::{
    ChangeJournal, ChangeSet, FilePersistenceManager, JournalEntry, JournalEntryStatus,
    MemoryPersistenceManager, PersistenceManager,
};
pub use state::{
    shared, ChildNodeEntry, ItemData, ItemState, ItemStatus, LocalItem, NodeReferences,
    NodeState, Operation, OperationId, OperationKind, PropertyState, SharedItem,
};
pub use types::*;
pub use virtual_provider::{MemoryVirtualProvider, VirtualItemStateProvider};
