//! Configuration for the shared item state manager and its backends.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name the default root node id is derived from.
pub const DEFAULT_ROOT_NAME: &str = "rep:root";

/// Manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Workspace this manager is the authority for.
    pub workspace: String,

    /// Identity of the workspace root node.
    pub root_node_id: NodeId,

    /// Cache size above which unreferenced entries are swept.
    pub cache_soft_limit: usize,

    /// Max wait for the read/write lock (None = wait forever).
    pub lock_timeout: Option<Duration>,

    /// Buffered transition events per subscriber before it is dropped.
    pub event_buffer_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            root_node_id: NodeId::from_name(DEFAULT_ROOT_NAME),
            cache_soft_limit: 10_000,
            lock_timeout: Some(Duration::from_secs(30)),
            event_buffer_size: 1000,
        }
    }
}

/// File backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePersistenceConfig {
    /// Base directory for item and reference files.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync every written file before the journal entry is committed.
    pub sync_writes: bool,
}

impl Default for FilePersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./workspace"),
            create_if_missing: true,
            sync_writes: true,
        }
    }
}
