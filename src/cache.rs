//! Identity map holding the single shared copy of each loaded item.
//!
//! The cache owns strong handles. An entry becomes *unreferenced* once the
//! cache holds the only handle to it; unreferenced entries are what
//! [`ItemStateCache::sweep`] reclaims, least recently used first.

use crate::error::Result;
use crate::state::{ItemState, ItemStatus, SharedItem};
use crate::types::ItemId;
use lru::LruCache;
use std::io::Write;
use std::sync::Arc;

/// Cache of shared item states keyed by identity.
pub struct ItemStateCache {
    entries: LruCache<ItemId, SharedItem>,
}

impl ItemStateCache {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }

    /// Insert or replace the shared entry for the state's identity.
    /// Returns the replaced handle, if any.
    pub fn cache(&mut self, state: SharedItem) -> Option<SharedItem> {
        let id = state.read().id().clone();
        self.entries.put(id, state)
    }

    /// Look up the shared entry, refreshing its recency.
    pub fn retrieve(&mut self, id: &ItemId) -> Option<SharedItem> {
        self.entries.get(id).map(Arc::clone)
    }

    pub fn is_cached(&self, id: &ItemId) -> bool {
        self.entries.contains(id)
    }

    /// Return the cached entry, or load and insert one.
    ///
    /// Runs entirely under `&mut self`, so two callers serialized by the
    /// owner's lock never create two shared copies of one identity.
    pub fn retrieve_or_load<F>(&mut self, id: &ItemId, load: F) -> Result<SharedItem>
    where
        F: FnOnce() -> Result<ItemState>,
    {
        if let Some(state) = self.retrieve(id) {
            return Ok(state);
        }
        let mut state = load()?;
        state.set_status(ItemStatus::Existing);
        let handle = crate::state::shared(state);
        self.entries.put(id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn evict(&mut self, id: &ItemId) -> Option<SharedItem> {
        self.entries.pop(id)
    }

    /// Evict the entry for `handle`'s identity only if it is that very
    /// instance.
    pub fn evict_instance(&mut self, handle: &SharedItem) -> bool {
        let id = handle.read().id().clone();
        let same = self
            .entries
            .peek(&id)
            .map_or(false, |cached| Arc::ptr_eq(cached, handle));
        if same {
            self.entries.pop(&id);
        }
        same
    }

    pub fn evict_all(&mut self) {
        self.entries.clear();
    }

    /// True if only the cache holds `handle`.
    pub fn is_unreferenced(handle: &SharedItem) -> bool {
        Arc::strong_count(handle) == 1
    }

    /// Evict unreferenced, non-new entries, least recently used first,
    /// until at most `target_len` entries remain. Returns evicted ids.
    pub fn sweep(&mut self, target_len: usize) -> Vec<ItemId> {
        if self.entries.len() <= target_len {
            return Vec::new();
        }
        let excess = self.entries.len() - target_len;
        let candidates: Vec<ItemId> = self
            .entries
            .iter()
            .rev()
            .filter(|(_, handle)| {
                Self::is_unreferenced(handle)
                    && handle
                        .try_read()
                        .map(|s| s.status() != ItemStatus::New)
                        .unwrap_or(false)
            })
            .take(excess)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &candidates {
            self.entries.pop(id);
        }
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached identities, most recently used first.
    pub fn ids(&self) -> Vec<ItemId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Write a diagnostic listing of the cache.
    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "ItemStateCache ({} entries)", self.entries.len())?;
        for (id, handle) in self.entries.iter() {
            let status = handle
                .try_read()
                .map(|s| format!("{:?}", s.status()))
                .unwrap_or_else(|| "<locked>".to_string());
            writeln!(
                out,
                "  {} status={} handles={}",
                id,
                status,
                Arc::strong_count(handle)
            )?;
        }
        Ok(())
    }
}

impl Default for ItemStateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::state::shared;
    use crate::types::NodeId;

    fn existing(id: NodeId) -> SharedItem {
        let mut state = ItemState::new_node(id, "nt:base".into(), None);
        state.set_status(ItemStatus::Existing);
        shared(state)
    }

    #[test]
    fn test_cache_and_retrieve_same_instance() {
        let mut cache = ItemStateCache::new();
        let id = NodeId::generate();
        let handle = existing(id);
        cache.cache(Arc::clone(&handle));

        let retrieved = cache.retrieve(&ItemId::Node(id)).unwrap();
        assert!(Arc::ptr_eq(&handle, &retrieved));
    }

    #[test]
    fn test_evict() {
        let mut cache = ItemStateCache::new();
        let id = NodeId::generate();
        cache.cache(existing(id));

        assert!(cache.is_cached(&ItemId::Node(id)));
        assert!(cache.evict(&ItemId::Node(id)).is_some());
        assert!(!cache.is_cached(&ItemId::Node(id)));
        assert!(cache.retrieve(&ItemId::Node(id)).is_none());
    }

    #[test]
    fn test_retrieve_or_load_loads_once() {
        let mut cache = ItemStateCache::new();
        let id = NodeId::generate();
        let item = ItemId::Node(id);
        let mut loads = 0;

        let first = cache
            .retrieve_or_load(&item, || {
                loads += 1;
                Ok(ItemState::new_node(id, "nt:base".into(), None))
            })
            .unwrap();
        let second = cache
            .retrieve_or_load(&item, || {
                loads += 1;
                Ok(ItemState::new_node(id, "nt:base".into(), None))
            })
            .unwrap();

        assert_eq!(loads, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().status(), ItemStatus::Existing);
    }

    #[test]
    fn test_failed_load_caches_nothing() {
        let mut cache = ItemStateCache::new();
        let item = ItemId::Node(NodeId::generate());
        let err = cache
            .retrieve_or_load(&item, || Err(StateError::NoSuchItem(item.clone())))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_skips_referenced_and_new() {
        let mut cache = ItemStateCache::new();
        let held = existing(NodeId::generate());
        cache.cache(Arc::clone(&held));

        let new_id = NodeId::generate();
        cache.cache(shared(ItemState::new_node(new_id, "nt:base".into(), None)));

        let loose: Vec<_> = (0..3).map(|_| NodeId::generate()).collect();
        for id in &loose {
            cache.cache(existing(*id));
        }

        let evicted = cache.sweep(0);
        assert_eq!(evicted.len(), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.is_cached(held.read().id()));
        assert!(cache.is_cached(&ItemId::Node(new_id)));
    }

    #[test]
    fn test_sweep_lru_first_and_bounded() {
        let mut cache = ItemStateCache::new();
        let ids: Vec<_> = (0..4).map(|_| NodeId::generate()).collect();
        for id in &ids {
            cache.cache(existing(*id));
        }
        // Touch the oldest so it becomes most recent.
        cache.retrieve(&ItemId::Node(ids[0]));

        let evicted = cache.sweep(2);
        assert_eq!(evicted, vec![ItemId::Node(ids[1]), ItemId::Node(ids[2])]);
        assert!(cache.is_cached(&ItemId::Node(ids[0])));
    }

    #[test]
    fn test_evict_instance_only_matching() {
        let mut cache = ItemStateCache::new();
        let id = NodeId::generate();
        let cached = existing(id);
        cache.cache(Arc::clone(&cached));

        let impostor = existing(id);
        assert!(!cache.evict_instance(&impostor));
        assert!(cache.is_cached(&ItemId::Node(id)));

        assert!(cache.evict_instance(&cached));
        assert!(!cache.is_cached(&ItemId::Node(id)));
    }
}
