//! Capacity-bounded concurrent map with least-recently-used eviction.
//!
//! Used for both the session state cache and the per-session lock table.
//! Recency is a logical clock stamped on every read and write; eviction scans
//! for the oldest stamp, which is fine at the few-thousand-entry scale these
//! tables run at.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct Slot<V> {
    value: V,
    last_used: u64,
}

#[derive(Debug)]
pub struct BoundedCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Slot<V>>,
    capacity: usize,
    clock: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Clone of the cached value, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let tick = self.tick();
        self.entries.get_mut(key).map(|mut slot| {
            slot.last_used = tick;
            slot.value.clone()
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let tick = self.tick();
        self.entries.insert(
            key.clone(),
            Slot {
                value,
                last_used: tick,
            },
        );
        self.evict_over_capacity(&key, |_| true);
    }

    /// Existing value for `key`, or a fresh one from `make`. Eviction only
    /// removes entries for which `can_evict` holds.
    pub fn get_or_insert_with<F, P>(&self, key: K, make: F, can_evict: P) -> V
    where
        F: FnOnce() -> V,
        P: Fn(&V) -> bool,
    {
        let tick = self.tick();
        let value = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().last_used = tick;
                occupied.get().value.clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(Slot {
                    value: make(),
                    last_used: tick,
                })
                .value
                .clone(),
        };
        self.evict_over_capacity(&key, can_evict);
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    fn evict_over_capacity<P>(&self, keep: &K, can_evict: P)
    where
        P: Fn(&V) -> bool,
    {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep && can_evict(&entry.value().value))
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                // Everything else is pinned; tolerate temporary overflow.
                break;
            };
            self.entries
                .remove_if(&victim, |_, slot| can_evict(&slot.value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key(&"a"));
        assert!(!cache.contains_key(&"b"));
        assert!(cache.contains_key(&"c"));
    }

    #[test]
    fn test_pinned_entries_survive_pressure() {
        let cache: BoundedCache<&str, Arc<()>> = BoundedCache::new(1);
        let pinned = cache.get_or_insert_with("held", || Arc::new(()), |v| Arc::strong_count(v) == 1);
        let _other = cache.get_or_insert_with("next", || Arc::new(()), |v| Arc::strong_count(v) == 1);

        // "held" is referenced outside the cache, so it cannot be dropped.
        assert!(cache.contains_key(&"held"));
        assert_eq!(cache.len(), 2);

        drop(pinned);
        drop(_other);
        let _third = cache.get_or_insert_with("third", || Arc::new(()), |v| Arc::strong_count(v) == 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&"third"));
    }

    #[test]
    fn test_get_or_insert_returns_existing() {
        let cache = BoundedCache::new(4);
        cache.insert("k", 10);
        let value = cache.get_or_insert_with("k", || 99, |_| true);
        assert_eq!(value, 10);
    }
}
