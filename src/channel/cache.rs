//! Resource definition cache consulted before any network round-trip

use crate::channel::resource::ResourceKey;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;

/// Cache of resource definitions keyed by provider uuid and name
pub trait ResourceCache: Send + Sync + fmt::Debug {
    /// Cached definition, if any
    fn get(&self, key: &ResourceKey) -> Option<Bytes>;

    /// Store a definition
    fn put(&self, key: ResourceKey, definition: Bytes);

    /// Drop every definition of a provider
    fn evict_provider(&self, provider_uuid: &str);
}

/// In-memory [`ResourceCache`]
#[derive(Debug, Default)]
pub struct MemoryResourceCache {
    entries: DashMap<ResourceKey, Bytes>,
}

impl MemoryResourceCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached definitions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceCache for MemoryResourceCache {
    fn get(&self, key: &ResourceKey) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: ResourceKey, definition: Bytes) {
        self.entries.insert(key, definition);
    }

    fn evict_provider(&self, provider_uuid: &str) {
        self.entries.retain(|key, _| key.provider_uuid != provider_uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_evict() {
        let cache = MemoryResourceCache::new();
        let a = ResourceKey::new("p1", "A.class");
        let b = ResourceKey::new("p2", "A.class");
        cache.put(a.clone(), Bytes::from_static(b"a"));
        cache.put(b.clone(), Bytes::from_static(b"b"));

        assert_eq!(cache.get(&a), Some(Bytes::from_static(b"a")));
        cache.evict_provider("p1");
        assert_eq!(cache.get(&a), None);
        assert_eq!(cache.get(&b), Some(Bytes::from_static(b"b")));
        assert_eq!(cache.len(), 1);
    }
}
