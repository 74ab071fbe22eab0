//! Shared item state manager.
//!
//! The single authority over the shared, in-memory copies of a workspace's
//! item states. Sessions read through it and commit their change logs into
//! it. Reads take the manager's read lock; a commit holds the write lock
//! for its whole duration, backend I/O and rollback included.
//!
//! # Read precedence
//!
//! 1. a virtual provider claiming the identity as one of its virtual roots
//! 2. the cache, then the persistence backend
//! 3. a virtual provider owning the identity
//!
//! # Commit
//!
//! [`SharedItemStateManager::store`] validates reference targets, connects
//! every local item to a shared counterpart, prepares observation events,
//! pushes local data into the shared copies and hands the shared log to the
//! backend. If the backend fails, every touched shared copy is reloaded from
//! the backend or discarded, so the cache never claims a write that did not
//! happen. Events are dispatched only after a successful write.

mod events;

pub use events::{ItemStateEvent, StateTransition};

use crate::cache::ItemStateCache;
use crate::changelog::{ChangeLog, PersistedHook};
use crate::config::RepositoryConfig;
use crate::error::{Result, StateError};
use crate::nodetype::{NodeTypeRegistry, PropDef};
use crate::observation::{EventStateCollection, ItemStateProvider, ObservationSink};
use crate::persistence::PersistenceManager;
use crate::state::{shared, ItemState, ItemStatus, LocalItem, NodeReferences, SharedItem};
use crate::types::{
    names, ItemId, Name, NodeDefId, NodeId, NodeReferencesId, PropertyId, PropertyType, Value,
};
use crate::virtual_provider::VirtualItemStateProvider;
use crossbeam_channel::Receiver;
use events::TransitionNotifier;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Authority over the shared item states of one workspace.
pub struct SharedItemStateManager {
    config: RepositoryConfig,
    backend: Arc<dyn PersistenceManager>,
    /// Guards check-cache / load / insert as one step.
    cache: Mutex<ItemStateCache>,
    /// Pinned root node; never swept.
    root: SharedItem,
    virtual_providers: Vec<Arc<dyn VirtualItemStateProvider>>,
    rw_lock: RwLock<()>,
    notifier: TransitionNotifier,
}

impl SharedItemStateManager {
    /// Open the manager over `backend`, creating and persisting the root
    /// node if the backend has none.
    pub fn new(
        config: RepositoryConfig,
        backend: Arc<dyn PersistenceManager>,
        registry: &dyn NodeTypeRegistry,
    ) -> Result<Self> {
        let root_id = ItemId::Node(config.root_node_id);
        let mut cache = ItemStateCache::new();

        let (root, root_property) = if backend.exists(&root_id)? {
            let root = cache.retrieve_or_load(&root_id, || backend.load(&root_id))?;
            (root, None)
        } else {
            let (root, property) =
                Self::create_root_node_state(config.root_node_id, backend.as_ref(), registry)?;
            (root, Some(property))
        };

        let manager = Self {
            notifier: TransitionNotifier::new(config.event_buffer_size),
            config,
            backend,
            cache: Mutex::new(cache),
            root,
            virtual_providers: Vec::new(),
            rw_lock: RwLock::new(()),
        };

        if let Some(property) = root_property {
            manager.persist_root(property)?;
        }
        Ok(manager)
    }

    /// Register a virtual item state provider.
    ///
    /// Takes `&mut self`, so registration can only happen before the
    /// manager is shared between threads.
    pub fn add_virtual_provider(&mut self, provider: Arc<dyn VirtualItemStateProvider>) {
        self.virtual_providers.push(provider);
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn root_id(&self) -> NodeId {
        self.config.root_node_id
    }

    /// The shared root node state.
    pub fn root(&self) -> &SharedItem {
        &self.root
    }

    /// Receive created/modified/destroyed/discarded transitions of shared
    /// item states. A subscriber that falls `event_buffer_size` events
    /// behind is dropped.
    pub fn subscribe(&self) -> Receiver<ItemStateEvent> {
        self.notifier.subscribe()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_cached(&self, id: &ItemId) -> bool {
        self.cache.lock().is_cached(id)
    }

    // --- Read path ---

    pub fn get_item_state(&self, id: &ItemId) -> Result<SharedItem> {
        let _guard = self.acquire_read_lock()?;
        self.item_state(id)
    }

    /// True if any source has the item. Never fails; errors and an
    /// unavailable lock count as absent.
    pub fn has_item_state(&self, id: &ItemId) -> bool {
        match self.acquire_read_lock() {
            Ok(_guard) => self.has_item(id),
            Err(e) => {
                debug!(item = %id, error = %e, "has_item_state treated as absent");
                false
            }
        }
    }

    pub fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        let _guard = self.acquire_read_lock()?;
        self.node_references(id)
    }

    /// True if a reference record exists for `id`. Never fails.
    pub fn has_node_references(&self, id: &NodeReferencesId) -> bool {
        match self.acquire_read_lock() {
            Ok(_guard) => self.has_references(id),
            Err(e) => {
                debug!(target_node = %id, error = %e, "has_node_references treated as absent");
                false
            }
        }
    }

    /// Check that every reference record in `log` that carries references
    /// points at an item that exists or is part of the log.
    pub fn check_targets_exist(&self, log: &ChangeLog<LocalItem>) -> Result<()> {
        let _guard = self.acquire_read_lock()?;
        self.partition_references(log).map(|_| ())
    }

    // --- Commit ---

    /// Commit a session's change log.
    ///
    /// On success every local item is connected to its shared counterpart
    /// and has adopted the shared status. On failure every local item is
    /// disconnected and the shared copies are reloaded or discarded.
    ///
    /// Prepared events are dispatched after the write lock is released, so
    /// listeners may read back through the manager. Virtual providers receive
    /// their reference records while the lock is still held.
    pub fn store(
        &self,
        local: &mut ChangeLog<LocalItem>,
        sink: Option<&dyn ObservationSink>,
    ) -> Result<()> {
        let guard = self.acquire_write_lock()?;

        let (persisted_refs, virtual_refs) = self.partition_references(local)?;
        let mut shared_log: ChangeLog<SharedItem> = ChangeLog::new(local.target().clone());
        for refs in persisted_refs {
            shared_log.modified_refs(refs);
        }

        let events = match self.persist(local, &mut shared_log, sink) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, log = %shared_log, "store failed, rolling back shared states");
                self.rollback(local, &shared_log);
                return Err(e);
            }
        };

        shared_log.persisted(self);
        if let Err(e) = local.settle() {
            warn!(error = %e, "could not settle local states after store");
        }

        for refs in &virtual_refs {
            if !self
                .virtual_providers
                .iter()
                .any(|provider| provider.set_node_references(refs))
            {
                debug!(target_node = %refs.id(), "no virtual provider accepted references");
            }
        }

        drop(guard);
        if let Some(events) = events {
            events.dispatch();
        }
        Ok(())
    }

    // --- Maintenance ---

    /// Evict every cached state except the pinned root.
    pub fn dispose(&self) {
        let mut cache = self.cache.lock();
        cache.evict_all();
        cache.cache(Arc::clone(&self.root));
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "SharedItemStateManager (workspace={}, root={}, providers={})",
            self.config.workspace,
            self.config.root_node_id,
            self.virtual_providers.len()
        )?;
        writeln!(out)?;
        write!(out, "[cache] ")?;
        self.cache.lock().dump(out)
    }

    // --- Locking ---

    fn acquire_read_lock(&self) -> Result<RwLockReadGuard<'_, ()>> {
        match self.config.lock_timeout {
            Some(timeout) => self
                .rw_lock
                .try_read_for(timeout)
                .ok_or(StateError::LockInterrupted("read")),
            None => Ok(self.rw_lock.read()),
        }
    }

    fn acquire_write_lock(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        match self.config.lock_timeout {
            Some(timeout) => self
                .rw_lock
                .try_write_for(timeout)
                .ok_or(StateError::LockInterrupted("write")),
            None => Ok(self.rw_lock.write()),
        }
    }

    // --- Unlocked internals; callers hold the read or write lock ---

    fn item_state(&self, id: &ItemId) -> Result<SharedItem> {
        if let Some(provider) = self.virtual_root_provider(id) {
            return provider.get_item_state(id);
        }

        match self.non_virtual_item_state(id) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        match self.owning_provider(id) {
            Some(provider) => provider.get_item_state(id),
            None => Err(StateError::NoSuchItem(id.clone())),
        }
    }

    fn has_item(&self, id: &ItemId) -> bool {
        if self.virtual_root_provider(id).is_some() {
            return true;
        }
        if self.cache.lock().is_cached(id) {
            return true;
        }
        match self.backend.exists(id) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!(item = %id, error = %e, "backend existence check failed"),
        }
        self.owning_provider(id).is_some()
    }

    fn non_virtual_item_state(&self, id: &ItemId) -> Result<SharedItem> {
        let mut cache = self.cache.lock();
        let handle = cache.retrieve_or_load(id, || {
            let state = self.backend.load(id)?;
            debug!(item = %id, "loaded item state");
            Ok(state)
        })?;

        if cache.len() > self.config.cache_soft_limit {
            let evicted = cache.sweep(self.config.cache_soft_limit);
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "swept unreferenced item states");
            }
        }
        Ok(handle)
    }

    fn node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        match self.backend.exists_references(id) {
            Ok(true) => match self.backend.load_references(id) {
                Ok(refs) => return Ok(refs),
                Err(e) => debug!(target_node = %id, error = %e, "backend reference load failed"),
            },
            Ok(false) => {}
            Err(e) => debug!(target_node = %id, error = %e, "backend reference check failed"),
        }

        match self
            .virtual_providers
            .iter()
            .find(|provider| provider.has_node_references(id))
        {
            Some(provider) => provider.get_node_references(id),
            None => Err(StateError::NoSuchReferences(*id)),
        }
    }

    fn has_references(&self, id: &NodeReferencesId) -> bool {
        if self.backend.exists_references(id).unwrap_or(false) {
            return true;
        }
        self.virtual_providers
            .iter()
            .any(|provider| provider.has_node_references(id))
    }

    fn virtual_root_provider(&self, id: &ItemId) -> Option<&Arc<dyn VirtualItemStateProvider>> {
        self.virtual_providers
            .iter()
            .find(|provider| provider.is_virtual_root(id))
    }

    fn owning_provider(&self, id: &ItemId) -> Option<&Arc<dyn VirtualItemStateProvider>> {
        self.virtual_providers
            .iter()
            .find(|provider| provider.has_item_state(id))
    }

    /// Split the log's reference records into those for the backend and
    /// those whose target a virtual provider owns. Fails if a backend
    /// record carries references to a node that exists nowhere or that the
    /// same log deletes.
    ///
    /// Provider-owned targets are not checked for existence.
    fn partition_references(
        &self,
        log: &ChangeLog<LocalItem>,
    ) -> Result<(Vec<NodeReferences>, Vec<NodeReferences>)> {
        let mut persisted = Vec::new();
        let mut virtual_refs = Vec::new();

        for refs in log.modified_references() {
            let target = ItemId::Node(refs.target());
            if self.owning_provider(&target).is_some() {
                virtual_refs.push(refs.clone());
                continue;
            }
            if refs.has_references()
                && (log.is_deleted(&target)
                    || (log.get(&target).is_none() && !self.has_item(&target)))
            {
                return Err(StateError::DanglingReference(refs.target()));
            }
            persisted.push(refs.clone());
        }
        Ok((persisted, virtual_refs))
    }

    /// Connect, prepare events, push and write. Everything that can fail
    /// before the commit is durable happens here.
    fn persist(
        &self,
        local: &mut ChangeLog<LocalItem>,
        shared_log: &mut ChangeLog<SharedItem>,
        sink: Option<&dyn ObservationSink>,
    ) -> Result<Option<Box<dyn EventStateCollection>>> {
        for item in local.modified_states_mut() {
            let shared = self.item_state(item.id())?;
            item.connect(Arc::clone(&shared))?;
            shared_log.modified(shared);
        }
        for item in local.deleted_states_mut() {
            let shared = self.item_state(item.id())?;
            item.connect(Arc::clone(&shared))?;
            shared_log.deleted(shared);
        }
        for item in local.added_states_mut() {
            let shared = self.create_instance(item.state());
            item.connect(Arc::clone(&shared))?;
            shared_log.added(shared);
        }

        let events = match sink {
            Some(sink) => {
                let mut events = sink.create_event_state_collection();
                events.create_event_states(&self.root_id(), local, &LockedView(self))?;
                events.prepare()?;
                Some(events)
            }
            None => None,
        };

        local.push()?;

        let started = Instant::now();
        self.backend.store(shared_log)?;
        info!(
            workspace = %self.config.workspace,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "persisting change log {} done",
            shared_log
        );
        Ok(events)
    }

    /// Restore the shared copies touched by a failed commit.
    fn rollback(&self, local: &mut ChangeLog<LocalItem>, shared_log: &ChangeLog<SharedItem>) {
        local.disconnect();

        for item in shared_log
            .modified_states()
            .chain(shared_log.deleted_states())
        {
            let id = item.read().id().clone();
            match self.backend.load(&id) {
                Ok(persisted) => item.write().copy_from(&persisted),
                Err(e) => {
                    warn!(item = %id, error = %e, "reload after failed store failed, discarding");
                    self.discard(item);
                }
            }
        }
        for item in shared_log.added_states() {
            self.discard(item);
        }
    }

    fn discard(&self, item: &SharedItem) {
        let id = {
            let mut state = item.write();
            state.set_status(ItemStatus::Discarded);
            state.id().clone()
        };
        self.cache.lock().evict_instance(item);
        self.notifier.notify(&id, StateTransition::Discarded);
    }

    /// Fresh shared instance carrying a copy of `local`'s data.
    fn create_instance(&self, local: &ItemState) -> SharedItem {
        let mut state = self.backend.create_new(local.id());
        state.copy_from(local);
        state.set_status(ItemStatus::New);
        shared(state)
    }

    // --- Bootstrap ---

    /// Build the root node and its mandatory primary type property.
    fn create_root_node_state(
        root_id: NodeId,
        backend: &dyn PersistenceManager,
        registry: &dyn NodeTypeRegistry,
    ) -> Result<(SharedItem, SharedItem)> {
        let (definition, primary_type) = Self::resolve_root_definitions(registry).map_err(|e| {
            error!(error = %e, "internal error: failed to create root node");
            StateError::ItemState(format!("failed to create root node: {}", e))
        })?;

        let root_item = ItemId::Node(root_id);
        let mut root = backend.create_new(&root_item);
        root.set_status(ItemStatus::New);
        let node = root
            .as_node_mut()
            .ok_or_else(|| StateError::ItemState(format!("{} is not a node state", root_item)))?;
        node.node_type = Name::from(names::REP_ROOT);
        node.parent = None;
        node.definition_id = Some(definition);
        node.add_property_name(primary_type.name.clone());

        let property_item = ItemId::Property(PropertyId::new(root_id, primary_type.name.clone()));
        let mut property = backend.create_new(&property_item);
        property.set_status(ItemStatus::New);
        let data = property.as_property_mut().ok_or_else(|| {
            StateError::ItemState(format!("{} is not a property state", property_item))
        })?;
        data.property_type = primary_type.required_type;
        data.multi_valued = primary_type.multiple;
        data.definition_id = Some(primary_type.id.clone());
        data.set_values(vec![Value::Name(Name::from(names::REP_ROOT))]);

        Ok((shared(root), shared(property)))
    }

    fn resolve_root_definitions(registry: &dyn NodeTypeRegistry) -> Result<(NodeDefId, PropDef)> {
        let definition = registry.root_node_definition()?;
        let root_type = registry.effective_node_type(&Name::from(names::REP_ROOT))?;
        let primary_type = root_type
            .applicable_property_def(
                &Name::from(names::JCR_PRIMARY_TYPE),
                PropertyType::Name,
                false,
            )?
            .clone();
        Ok((definition, primary_type))
    }

    /// Write the freshly built root directly, outside any session commit.
    fn persist_root(&self, property: SharedItem) -> Result<()> {
        let mut log: ChangeLog<SharedItem> = ChangeLog::new(ItemId::Node(self.root_id()));
        log.added(Arc::clone(&self.root));
        log.added(property);

        self.backend.store(&log).map_err(|e| {
            error!(error = %e, "failed to persist root node");
            e
        })?;
        log.persisted(self);
        info!(workspace = %self.config.workspace, root = %self.root_id(), "created root node");
        Ok(())
    }
}

impl PersistedHook<SharedItem> for SharedItemStateManager {
    /// Settle shared statuses and keep the cache in step with what the
    /// backend now holds.
    fn persisted(&self, _target: &ItemId, log: &ChangeLog<SharedItem>) {
        for item in log.added_states() {
            let id = {
                let mut state = item.write();
                state.set_status(ItemStatus::Existing);
                state.id().clone()
            };
            self.cache.lock().cache(Arc::clone(item));
            self.notifier.notify(&id, StateTransition::Created);
        }
        for item in log.modified_states() {
            let id = {
                let mut state = item.write();
                state.set_status(ItemStatus::Existing);
                state.touch();
                state.id().clone()
            };
            self.notifier.notify(&id, StateTransition::Modified);
        }
        for item in log.deleted_states() {
            let id = {
                let mut state = item.write();
                state.set_status(ItemStatus::Destroyed);
                state.id().clone()
            };
            self.cache.lock().evict_instance(item);
            self.notifier.notify(&id, StateTransition::Destroyed);
        }
    }
}

impl ItemStateProvider for SharedItemStateManager {
    fn get_item_state(&self, id: &ItemId) -> Result<SharedItem> {
        SharedItemStateManager::get_item_state(self, id)
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        SharedItemStateManager::has_item_state(self, id)
    }

    fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        SharedItemStateManager::get_node_references(self, id)
    }

    fn has_node_references(&self, id: &NodeReferencesId) -> bool {
        SharedItemStateManager::has_node_references(self, id)
    }
}

/// Read access for code running while the manager's lock is already held.
struct LockedView<'a>(&'a SharedItemStateManager);

impl ItemStateProvider for LockedView<'_> {
    fn get_item_state(&self, id: &ItemId) -> Result<SharedItem> {
        self.0.item_state(id)
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        self.0.has_item(id)
    }

    fn get_node_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        self.0.node_references(id)
    }

    fn has_node_references(&self, id: &NodeReferencesId) -> bool {
        self.0.has_references(id)
    }
}
