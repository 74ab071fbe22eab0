//! Session-local item states overlaying shared ones.
//!
//! A [`LocalItem`] owns a private copy of an item state. It may be
//! *connected* to the shared copy of the same identity; the connection is
//! recorded here only, the shared copy never points back. Staleness is
//! detected by comparing the shared copy's modification count against the
//! count observed when the overlay was last synchronized.

use super::item::{ItemState, ItemStatus, SharedItem};
use crate::error::{Result, StateError};
use crate::types::ItemId;
use std::sync::Arc;

/// Session-private shadow of an item.
#[derive(Debug)]
pub struct LocalItem {
    state: ItemState,
    overlayed: Option<SharedItem>,
    /// Shared mod count at the last connect/pull.
    base_mod_count: u64,
}

impl LocalItem {
    /// A local item with no shared counterpart yet (typically `New`).
    pub fn new(state: ItemState) -> Self {
        Self {
            state,
            overlayed: None,
            base_mod_count: 0,
        }
    }

    /// A local copy of `shared`, connected to it.
    pub fn overlaying(shared: &SharedItem) -> Self {
        let guard = shared.read();
        let mut state = guard.clone();
        state.set_status(ItemStatus::Existing);
        Self {
            base_mod_count: guard.mod_count(),
            state,
            overlayed: Some(Arc::clone(shared)),
        }
    }

    pub fn id(&self) -> &ItemId {
        self.state.id()
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    /// Mutable access for session edits.
    ///
    /// Callers record the change in their change log; the status is not
    /// adjusted here.
    pub fn state_mut(&mut self) -> &mut ItemState {
        &mut self.state
    }

    pub fn status(&self) -> ItemStatus {
        self.state.status()
    }

    pub fn is_connected(&self) -> bool {
        self.overlayed.is_some()
    }

    pub fn overlayed_state(&self) -> Option<&SharedItem> {
        self.overlayed.as_ref()
    }

    /// Connect this overlay to the shared copy of the same identity.
    pub fn connect(&mut self, shared: SharedItem) -> Result<()> {
        if let Some(current) = &self.overlayed {
            if Arc::ptr_eq(current, &shared) {
                return Ok(());
            }
            return Err(StateError::ItemState(format!(
                "item {} is already connected to another shared state",
                self.id()
            )));
        }
        let shared_id = shared.read().id().clone();
        if &shared_id != self.id() {
            return Err(StateError::ItemState(format!(
                "cannot connect {} to shared state {}",
                self.id(),
                shared_id
            )));
        }
        self.base_mod_count = shared.read().mod_count();
        self.overlayed = Some(shared);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.overlayed = None;
    }

    /// Copy local data into the connected shared copy.
    pub fn push(&self) -> Result<()> {
        let shared = self.connected()?;
        shared.write().copy_from(&self.state);
        Ok(())
    }

    /// Copy the shared copy's data into this overlay and resync.
    pub fn pull(&mut self) -> Result<()> {
        let shared = Arc::clone(self.connected()?);
        let guard = shared.read();
        self.state.copy_from(&guard);
        self.state.set_status(ItemStatus::Existing);
        self.base_mod_count = guard.mod_count();
        Ok(())
    }

    /// Adopt the shared copy's status after a successful save.
    pub fn settle(&mut self) -> Result<()> {
        let shared = Arc::clone(self.connected()?);
        let guard = shared.read();
        self.state.set_status(guard.status());
        self.base_mod_count = guard.mod_count();
        Ok(())
    }

    /// Recompute the stale flags against the shared copy.
    pub fn refresh_status(&mut self) -> ItemStatus {
        if let Some(shared) = &self.overlayed {
            let guard = shared.read();
            if guard.status().is_terminal() {
                self.state.set_status(ItemStatus::StaleDestroyed);
            } else if guard.mod_count() != self.base_mod_count {
                self.state.set_status(ItemStatus::StaleModified);
            }
        }
        self.state.status()
    }

    fn connected(&self) -> Result<&SharedItem> {
        self.overlayed.as_ref().ok_or_else(|| {
            StateError::ItemState(format!("item {} is not connected", self.id()))
        })
    }
}
