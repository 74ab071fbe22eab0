//! Observation hooks driven by the commit protocol.
//!
//! The manager calls, in order: [`ObservationSink::create_event_state_collection`],
//! [`EventStateCollection::create_event_states`], [`EventStateCollection::prepare`]
//! and, only once the commit is durable, [`EventStateCollection::dispatch`].

use crate::changelog::ChangeLog;
use crate::error::Result;
use crate::state::{ItemStatus, LocalItem, NodeReferences, SharedItem};
use crate::types::{ItemId, NodeId, NodeReferencesId, PropertyId, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Read access to shared item states, as seen from inside a commit.
pub trait ItemStateProvider {
    fn get_item_state(&self, id: &ItemId) -> Result<SharedItem>;
    fn has_item_state(&self, id: &ItemId) -> bool;
    fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences>;
    fn has_node_references(&self, id: &NodeReferencesId) -> bool;
}

/// Factory for per-commit event batches.
pub trait ObservationSink: Send + Sync {
    fn create_event_state_collection(&self) -> Box<dyn EventStateCollection>;
}

/// Events of one commit, built before and delivered after it.
pub trait EventStateCollection: Send {
    /// Derive events from the local change log while it still reflects the
    /// pre-commit shared state.
    fn create_event_states(
        &mut self,
        root: &NodeId,
        log: &ChangeLog<LocalItem>,
        provider: &dyn ItemStateProvider,
    ) -> Result<()>;

    fn prepare(&mut self) -> Result<()>;

    /// Deliver the events. Runs after the manager released its write lock.
    fn dispatch(self: Box<Self>);
}

/// A change observed by listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationEvent {
    NodeAdded {
        id: NodeId,
        parent: Option<NodeId>,
    },
    NodeRemoved {
        id: NodeId,
        parent: Option<NodeId>,
    },
    NodeMoved {
        id: NodeId,
        from: Option<NodeId>,
        to: Option<NodeId>,
    },
    PropertyAdded {
        id: PropertyId,
    },
    PropertyChanged {
        id: PropertyId,
    },
    PropertyRemoved {
        id: PropertyId,
    },
}

/// One delivered batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBundle {
    pub root: NodeId,
    pub prepared_at: Timestamp,
    pub events: Vec<ObservationEvent>,
}

/// Sink delivering each committed batch on a bounded channel.
pub struct ChannelObservationSink {
    sender: Sender<EventBundle>,
}

impl ChannelObservationSink {
    /// Create a sink and the receiver its bundles arrive on.
    pub fn new(buffer_size: usize) -> (Self, Receiver<EventBundle>) {
        let (sender, receiver) = bounded(buffer_size);
        (Self { sender }, receiver)
    }
}

impl ObservationSink for ChannelObservationSink {
    fn create_event_state_collection(&self) -> Box<dyn EventStateCollection> {
        Box::new(ChannelEventCollection {
            sender: self.sender.clone(),
            root: None,
            events: Vec::new(),
            prepared_at: None,
        })
    }
}

struct ChannelEventCollection {
    sender: Sender<EventBundle>,
    root: Option<NodeId>,
    events: Vec<ObservationEvent>,
    prepared_at: Option<Timestamp>,
}

impl EventStateCollection for ChannelEventCollection {
    fn create_event_states(
        &mut self,
        root: &NodeId,
        log: &ChangeLog<LocalItem>,
        provider: &dyn ItemStateProvider,
    ) -> Result<()> {
        self.root = Some(*root);

        for item in log.added_states() {
            self.events.push(match item.id() {
                ItemId::Node(id) => ObservationEvent::NodeAdded {
                    id: *id,
                    parent: item.state().parent_id(),
                },
                ItemId::Property(id) => ObservationEvent::PropertyAdded { id: id.clone() },
            });
        }

        for item in log.modified_states() {
            match item.id() {
                ItemId::Node(id) => {
                    // Only a parent change is observable on the node itself.
                    let to = item.state().parent_id();
                    let from = shared_parent(provider, item.id()).or(to);
                    if from != to {
                        self.events.push(ObservationEvent::NodeMoved { id: *id, from, to });
                    }
                }
                ItemId::Property(id) => {
                    self.events
                        .push(ObservationEvent::PropertyChanged { id: id.clone() });
                }
            }
        }

        for item in log.deleted_states() {
            self.events.push(match item.id() {
                ItemId::Node(id) => ObservationEvent::NodeRemoved {
                    id: *id,
                    parent: shared_parent(provider, item.id()).or(item.state().parent_id()),
                },
                ItemId::Property(id) => ObservationEvent::PropertyRemoved { id: id.clone() },
            });
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepared_at = Some(Timestamp::now());
        Ok(())
    }

    fn dispatch(self: Box<Self>) {
        let (root, prepared_at) = match (self.root, self.prepared_at) {
            (Some(root), Some(at)) => (root, at),
            _ => return,
        };
        if self.events.is_empty() {
            return;
        }
        let bundle = EventBundle {
            root,
            prepared_at,
            events: self.events,
        };
        match self.sender.try_send(bundle) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("observation buffer full, dropping event bundle");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Parent recorded on the current shared copy, if it is still live.
fn shared_parent(provider: &dyn ItemStateProvider, id: &ItemId) -> Option<NodeId> {
    let shared = provider.get_item_state(id).ok()?;
    let guard = shared.read();
    if guard.status() == ItemStatus::Discarded {
        return None;
    }
    guard.parent_id()
}
