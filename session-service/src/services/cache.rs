//! Bounded in-process cache with per-entry expiry.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get(key).and_then(|slot| {
            if slot.expires_at > now {
                Some(slot.value.clone())
            } else {
                None
            }
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, slot| slot.expires_at <= now);
        }
        hit
    }

    /// Insert with the cache TTL, capped by `max_age` when given. A full cache
    /// is swept first; if it is still full the value is not cached.
    pub fn set(&self, key: K, value: V, max_age: Option<Duration>) {
        let ttl = max_age.map_or(self.ttl, |age| age.min(self.ttl));
        if ttl.is_zero() {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.sweep();
            if self.entries.len() >= self.capacity {
                tracing::debug!(capacity = self.capacity, "Cache full, skipping insert");
                return;
            }
        }
        self.entries.insert(
            key,
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Periodic sweep that stops once the cache itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_invalidate() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("a".to_string(), 1, None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(5), 10);
        cache.set(1u8, "x", None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&1u8), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_respected() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set(1, 1, None);
        cache.set(2, 2, None);
        cache.set(3, 3, None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&3), None);

        // Overwriting an existing key is always allowed.
        cache.set(1, 10, None);
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn zero_max_age_is_not_cached() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set(1, 1, Some(Duration::ZERO));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn sweeper_stops_when_cache_dropped() {
        let cache = Arc::new(TtlCache::<u8, u8>::new(Duration::from_millis(1), 4));
        let handle = cache.spawn_sweeper(Duration::from_millis(5));
        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper exits")
            .expect("sweeper does not panic");
    }
}
