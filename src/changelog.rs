//! Change log: the unit of work a save commits.
//!
//! A change log classifies item states into three disjoint, insertion-ordered
//! sets (added, modified, deleted) keyed by identity, and keeps the ordered
//! set of logical operations that produced them. It is generic over the
//! tracked state so the same container carries session-local overlays
//! ([`LocalItem`]) and the shared handles ([`SharedItem`]) derived from them
//! during a commit.

use crate::error::{Result, StateError};
use crate::state::{ItemState, LocalItem, NodeReferences, Operation, OperationId, SharedItem};
use crate::types::{ItemId, NodeId};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;

/// Anything a change log can track.
pub trait TrackedState {
    fn item_id(&self) -> ItemId;
}

impl TrackedState for LocalItem {
    fn item_id(&self) -> ItemId {
        self.id().clone()
    }
}

impl TrackedState for SharedItem {
    fn item_id(&self) -> ItemId {
        self.read().id().clone()
    }
}

impl TrackedState for ItemState {
    fn item_id(&self) -> ItemId {
        self.id().clone()
    }
}

/// Receiver of the notification that a change log was durably applied.
pub trait PersistedHook<S> {
    fn persisted(&self, target: &ItemId, log: &ChangeLog<S>);
}

/// Registers changes made to item states and reference records.
pub struct ChangeLog<S> {
    target: ItemId,
    added: IndexMap<ItemId, S>,
    modified: IndexMap<ItemId, S>,
    deleted: IndexMap<ItemId, S>,
    operations: IndexMap<OperationId, Operation>,
    modified_refs: IndexMap<NodeId, NodeReferences>,
}

impl<S: TrackedState> ChangeLog<S> {
    /// Create an empty change log rooted at `target`.
    pub fn new(target: ItemId) -> Self {
        Self {
            target,
            added: IndexMap::new(),
            modified: IndexMap::new(),
            deleted: IndexMap::new(),
            operations: IndexMap::new(),
            modified_refs: IndexMap::new(),
        }
    }

    // --- Recording ---

    /// Record an operation. Re-adding the same operation is a no-op.
    pub fn add_operation(&mut self, operation: Operation) -> bool {
        if self.operations.contains_key(&operation.id()) {
            return false;
        }
        self.operations.insert(operation.id(), operation);
        true
    }

    /// A state has been added.
    ///
    /// Re-adding an identity that was deleted in this unit of work turns the
    /// pair into a modification of the persisted item; an identity already
    /// modified stays modified.
    pub fn added(&mut self, state: S) {
        let id = state.item_id();
        if self.deleted.shift_remove(&id).is_some() || self.modified.contains_key(&id) {
            self.modified.insert(id, state);
        } else {
            self.added.insert(id, state);
        }
    }

    /// A state has been modified. New and deleted states stay where they are.
    pub fn modified(&mut self, state: S) {
        let id = state.item_id();
        if self.added.contains_key(&id) || self.deleted.contains_key(&id) {
            return;
        }
        self.modified.insert(id, state);
    }

    /// A state has been deleted.
    ///
    /// A state that was added in this unit of work vanishes from the log
    /// entirely; otherwise it moves from modified (if there) to deleted.
    pub fn deleted(&mut self, state: S) {
        let id = state.item_id();
        if self.added.shift_remove(&id).is_some() {
            return;
        }
        self.modified.shift_remove(&id);
        self.deleted.insert(id, state);
    }

    /// A reference record has been modified.
    pub fn modified_refs(&mut self, refs: NodeReferences) {
        self.modified_refs.insert(refs.target(), refs);
    }

    // --- Set algebra ---

    /// Remove every state, operation and reference record present in `sub`.
    pub fn remove_all<T>(&mut self, sub: &ChangeLog<T>) {
        for id in sub.added.keys() {
            self.added.shift_remove(id);
        }
        for id in sub.modified.keys() {
            self.modified.shift_remove(id);
        }
        for id in sub.deleted.keys() {
            self.deleted.shift_remove(id);
        }
        for id in sub.operations.keys() {
            self.operations.shift_remove(id);
        }
        for target in sub.modified_refs.keys() {
            self.modified_refs.shift_remove(target);
        }
    }

    /// Pull in every candidate operation touching an item already in scope.
    ///
    /// Scope is fixed by the state sets at call time; accepting an operation
    /// does not widen it.
    pub fn collect_operations(&mut self, candidates: impl IntoIterator<Item = Operation>) {
        let affected = self.affected_ids();
        for operation in candidates {
            if operation
                .affected_items()
                .iter()
                .any(|id| affected.contains(id))
            {
                self.add_operation(operation);
            }
        }
    }

    /// Fail if some operation reaches an item outside this unit of work,
    /// e.g. a move whose source and destination parents are not both saved.
    pub fn check_is_self_contained(&self) -> Result<()> {
        let affected = self.affected_ids();
        for operation in self.operations.values() {
            if let Some(outside) = operation
                .affected_items()
                .into_iter()
                .find(|id| !affected.contains(id))
            {
                return Err(StateError::ConstraintViolation(format!(
                    "change log is not self contained: {:?} also affects {}",
                    operation.id(),
                    outside
                )));
            }
        }
        Ok(())
    }

    /// Notify the hook that this log has been durably applied.
    pub fn persisted(&self, hook: &dyn PersistedHook<S>) {
        hook.persisted(&self.target, self);
    }

    /// Clear all states, operations and reference records.
    pub fn reset(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.deleted.clear();
        self.operations.clear();
        self.modified_refs.clear();
    }

    fn affected_ids(&self) -> HashSet<ItemId> {
        self.added
            .keys()
            .chain(self.modified.keys())
            .chain(self.deleted.keys())
            .cloned()
            .collect()
    }
}

impl<S> ChangeLog<S> {
    pub fn target(&self) -> &ItemId {
        &self.target
    }

    /// True iff no operation was recorded. Tracked states alone do not make
    /// a log non-empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn added_states(&self) -> impl Iterator<Item = &S> {
        self.added.values()
    }

    pub fn modified_states(&self) -> impl Iterator<Item = &S> {
        self.modified.values()
    }

    pub fn deleted_states(&self) -> impl Iterator<Item = &S> {
        self.deleted.values()
    }

    pub fn added_states_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.added.values_mut()
    }

    pub fn modified_states_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.modified.values_mut()
    }

    pub fn deleted_states_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.deleted.values_mut()
    }

    /// Every tracked state: added, then modified, then deleted.
    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.added
            .values_mut()
            .chain(self.modified.values_mut())
            .chain(self.deleted.values_mut())
    }

    pub fn is_added(&self, id: &ItemId) -> bool {
        self.added.contains_key(id)
    }

    pub fn is_modified(&self, id: &ItemId) -> bool {
        self.modified.contains_key(id)
    }

    pub fn is_deleted(&self, id: &ItemId) -> bool {
        self.deleted.contains_key(id)
    }

    /// True if `id` is tracked in any of the three sets.
    pub fn has(&self, id: &ItemId) -> bool {
        self.is_added(id) || self.is_modified(id) || self.is_deleted(id)
    }

    /// The tracked state for `id`, unless it was deleted.
    pub fn get(&self, id: &ItemId) -> Option<&S> {
        self.added.get(id).or_else(|| self.modified.get(id))
    }

    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut S> {
        match self.added.get_mut(id) {
            Some(state) => Some(state),
            None => self.modified.get_mut(id),
        }
    }

    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn modified_references(&self) -> impl Iterator<Item = &NodeReferences> {
        self.modified_refs.values()
    }

    pub fn modified_references_count(&self) -> usize {
        self.modified_refs.len()
    }
}

impl ChangeLog<LocalItem> {
    /// Push every tracked local item into its connected shared copy.
    pub fn push(&self) -> Result<()> {
        for item in self
            .added
            .values()
            .chain(self.modified.values())
            .chain(self.deleted.values())
        {
            item.push()?;
        }
        Ok(())
    }

    /// Disconnect every tracked local item from its shared copy.
    pub fn disconnect(&mut self) {
        for item in self.states_mut() {
            item.disconnect();
        }
    }

    /// Adopt the shared statuses after a successful save.
    pub fn settle(&mut self) -> Result<()> {
        for item in self.states_mut() {
            item.settle()?;
        }
        Ok(())
    }
}

impl<S> fmt::Display for ChangeLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{#added={}, #modified={}, #deleted={}, #operations={}, #refs={}}}",
            self.added.len(),
            self.modified.len(),
            self.deleted.len(),
            self.operations.len(),
            self.modified_refs.len()
        )
    }
}

impl<S> fmt::Debug for ChangeLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeLog")
            .field("target", &self.target)
            .field("added", &self.added.keys().collect::<Vec<_>>())
            .field("modified", &self.modified.keys().collect::<Vec<_>>())
            .field("deleted", &self.deleted.keys().collect::<Vec<_>>())
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}
