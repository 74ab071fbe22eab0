//! Broadcast of shared item state transitions.

use crate::types::ItemId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle transition of a shared item state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTransition {
    /// A new item became durable.
    Created,
    /// A durable item was changed.
    Modified,
    /// A durable item was removed.
    Destroyed,
    /// An item was abandoned without becoming durable, or could not be
    /// restored after a failed commit.
    Discarded,
}

/// One transition of one item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStateEvent {
    pub id: ItemId,
    pub transition: StateTransition,
}

/// Fans transition events out to subscribers with bounded buffers.
///
/// A subscriber whose buffer is full, or whose receiver is gone, is
/// dropped.
pub(crate) struct TransitionNotifier {
    subscribers: RwLock<HashMap<u64, Sender<ItemStateEvent>>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl TransitionNotifier {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<ItemStateEvent> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.buffer_size);
        self.subscribers.write().insert(id, sender);
        receiver
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub(crate) fn notify(&self, id: &ItemId, transition: StateTransition) {
        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read();
            if subscribers.is_empty() {
                return;
            }
            let event = ItemStateEvent {
                id: id.clone(),
                transition,
            };
            for (sub_id, sender) in subscribers.iter() {
                match sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        dropped.push(*sub_id);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write();
            for sub_id in dropped {
                subscribers.remove(&sub_id);
                tracing::debug!(subscriber = sub_id, "dropped transition subscriber");
            }
        }
    }
}
