//! Keyed memoization stores for operations, requests and results.
//!
//! Two shapes: [`DataCache`] maps one hashable key to one value,
//! [`MultiKeyDataCache`] maps an ordered key tuple (structural equality,
//! not reference equality). Entries live for the process lifetime; the
//! corpus of distinct sub-queries per session is bounded and nothing is
//! persisted, so there is no eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Single-key memoization store.
pub struct DataCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for DataCache<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> DataCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, or `None`. Never fails.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(key).cloned()
    }

    /// Insert `value` under `key`. Idempotent for equal values;
    /// re-inserting a different value overwrites.
    pub fn put(&self, key: K, value: V) {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner).insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memoization store keyed by an ordered tuple of keys, e.g.
/// `(subject, filter)` for intersections.
pub struct MultiKeyDataCache<K, V> {
    inner: RwLock<HashMap<Vec<K>, V>>,
}

impl<K, V> Default for MultiKeyDataCache<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> MultiKeyDataCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keys: &[K]) -> Option<V> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(keys).cloned()
    }

    pub fn put(&self, keys: Vec<K>, value: V) {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner).insert(keys, value);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_then_put_round_trip() {
        let cache: DataCache<String, u32> = DataCache::new();
        assert_eq!(cache.get(&"a".to_string()), None);
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn put_is_idempotent_and_overwrites() {
        let cache: DataCache<String, u32> = DataCache::new();
        cache.put("a".to_string(), 1);
        cache.put("a".to_string(), 1);
        assert_eq!(cache.len(), 1);
        cache.put("a".to_string(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn multi_key_equality_is_structural() {
        let cache: MultiKeyDataCache<String, u32> = MultiKeyDataCache::new();
        cache.put(vec!["s".to_string(), "f".to_string()], 7);

        // Fresh keys with equal contents hit the same entry.
        let lookup = [String::from("s"), String::from("f")];
        assert_eq!(cache.get(&lookup), Some(7));
        assert_eq!(cache.get(&[String::from("f"), String::from("s")]), None);
    }
}
