use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AssetData, AssetSource};

/// Decoded models keyed by source, shared by the loaders a host creates.
///
/// The cache is an explicit object: hosts decide its capacity, hand clones of
/// it to their loaders and evict entries when a model changes upstream.
#[derive(Debug, Clone)]
pub struct AssetCache {
    inner: Arc<Mutex<CacheState>>,
}

#[derive(Debug)]
struct CacheState {
    capacity: usize,
    clock: u64,
    entries: HashMap<AssetSource, CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    data: Arc<AssetData>,
    last_used: u64,
}

impl AssetCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                capacity: capacity.max(1),
                clock: 0,
                entries: HashMap::new(),
            })),
        }
    }

    pub fn get(&self, source: &AssetSource) -> Option<Arc<AssetData>> {
        let mut state = self.inner.lock();
        state.clock += 1;
        let now = state.clock;
        state.entries.get_mut(source).map(|entry| {
            entry.last_used = now;
            Arc::clone(&entry.data)
        })
    }

    /// Stores a model, evicting the least recently used entry when full.
    pub fn insert(&self, source: AssetSource, data: Arc<AssetData>) {
        let mut state = self.inner.lock();
        state.clock += 1;
        let now = state.clock;
        if !state.entries.contains_key(&source) && state.entries.len() >= state.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                log::debug!("evicting {oldest} from asset cache");
                state.entries.remove(&oldest);
            }
        }
        state.entries.insert(
            source,
            CacheEntry {
                data,
                last_used: now,
            },
        );
    }

    pub fn evict(&self, source: &AssetSource) -> bool {
        self.inner.lock().entries.remove(source).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> AssetSource {
        AssetSource::new(name)
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = AssetCache::new(2);
        cache.insert(source("a.obj"), Arc::default());
        cache.insert(source("b.obj"), Arc::default());
        assert!(cache.get(&source("a.obj")).is_some());
        cache.insert(source("c.obj"), Arc::default());

        assert!(cache.get(&source("a.obj")).is_some());
        assert!(cache.get(&source("b.obj")).is_none());
        assert!(cache.get(&source("c.obj")).is_some());
    }

    #[test]
    fn clones_share_entries() {
        let cache = AssetCache::new(4);
        let other = cache.clone();
        cache.insert(source("a.obj"), Arc::default());
        assert_eq!(other.len(), 1);
        assert!(other.evict(&source("a.obj")));
        assert!(cache.is_empty());
    }
}
