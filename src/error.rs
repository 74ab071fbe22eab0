//! Error types for the item state layer.

use crate::types::{ItemId, Name, NodeId, NodeReferencesId};
use thiserror::Error;

/// Main error type for item state operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No such item state: {0}")]
    NoSuchItem(ItemId),

    #[error("No such node references: {0}")]
    NoSuchReferences(NodeReferencesId),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Target node {0} of REFERENCE property does not exist")]
    DanglingReference(NodeId),

    #[error("Interrupted while acquiring {0} lock")]
    LockInterrupted(&'static str),

    #[error("No such node type: {0}")]
    NoSuchNodeType(Name),

    #[error("Item state error: {0}")]
    ItemState(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,
}

impl StateError {
    /// True if the requested item or reference record was absent everywhere.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NoSuchItem(_) | StateError::NoSuchReferences(_))
    }

    /// True if a change log failed validation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StateError::ConstraintViolation(_))
    }

    /// True if repeating the same call may succeed.
    ///
    /// Only lock acquisition qualifies; the failed call left no trace.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::LockInterrupted(_))
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateError::Deserialization(e.to_string())
    }
}

/// Result type for item state operations.
pub type Result<T> = std::result::Result<T, StateError>;
