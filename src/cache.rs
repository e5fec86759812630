//! The pluggable key/value store a [`Loader`] keeps issued results in.
//!
//! [`Loader`]: crate::Loader

use std::collections::HashMap;
use std::hash::Hash;

/// The storage contract a [`Loader`] caches against. The loader stores one
/// shared result handle per cache key and only ever needs these four
/// operations; anything that implements them is a valid backend, including
/// one that drops entries whenever it likes.
///
/// An implementation is free to evict entries at any point, even between a
/// load and the dispatch that fulfills it. Eviction only means the next
/// load for that key misses and fetches fresh; result handles that were
/// already given out are unaffected.
///
/// There is no ordering or capacity requirement. The default backend is
/// [`HashMapCache`], an unbounded in-memory map.
///
/// [`Loader`]: crate::Loader
pub trait CacheMap<K, V> {
    /// Look up the value stored for `key`, if any.
    fn get(&self, key: &K) -> Option<V>;

    /// Store `value` under `key`, replacing any existing entry.
    fn put(&mut self, key: K, value: V);

    /// Remove the entry for `key`, if any.
    fn delete(&mut self, key: &K);

    /// Remove every entry.
    fn clear(&mut self);
}

/// The default [`CacheMap`] backend: an unbounded in-memory hash map.
#[derive(Debug, Clone)]
pub struct HashMapCache<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> HashMapCache<K, V> {
    pub fn new() -> Self {
        HashMapCache {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> Default for HashMapCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V: Clone> CacheMap<K, V> for HashMapCache<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    fn delete(&mut self, key: &K) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}
