use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::issue::IssuedIdentity;

pub type CertificateCache = BoundedCache<IssuedIdentity>;

pub type TrackedIdentity = Tracked<IssuedIdentity>;

struct CacheEntry<V> {
    value: Arc<V>,
    expires_at: Instant,
    weight: u64,
    refs: AtomicUsize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn is_pinned(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }
}

/// Handle to a cache entry that keeps the entry from being evicted while held.
pub struct Tracked<V> {
    entry: Arc<CacheEntry<V>>,
}

impl<V> Tracked<V> {
    fn track(entry: Arc<CacheEntry<V>>) -> Self {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    pub fn value(&self) -> &Arc<V> {
        &self.entry.value
    }

    pub fn expires_at(&self) -> Instant {
        self.entry.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.entry.is_expired(Instant::now())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry.value, &other.entry.value)
    }
}

impl<V> Deref for Tracked<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.entry.value
    }
}

impl<V> Clone for Tracked<V> {
    fn clone(&self) -> Self {
        Self::track(Arc::clone(&self.entry))
    }
}

impl<V> Drop for Tracked<V> {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<V> fmt::Debug for Tracked<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("weight", &self.entry.weight)
            .field("refs", &self.entry.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct CacheState<V> {
    entries: LruCache<String, Arc<CacheEntry<V>>>,
    total_weight: u64,
}

/// LRU cache bounded by item count and total weight, with TTL expiry.
///
/// Entries referenced by a live [`Tracked`] handle are skipped by eviction, so the
/// cache may sit above budget until those handles are dropped.
pub struct BoundedCache<V> {
    state: Mutex<CacheState<V>>,
    max_items: usize,
    max_weight: u64,
    evictions: AtomicU64,
}

impl<V> BoundedCache<V> {
    pub fn new(max_items: usize, max_weight: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_weight: 0,
            }),
            max_items,
            max_weight,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Tracked<V>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (expired, pinned) = {
            let entry = state.entries.peek(key)?;
            (entry.is_expired(now), entry.is_pinned())
        };
        if expired {
            // Expired entries are never promoted; pinned ones stay until released.
            if !pinned {
                if let Some(stale) = state.entries.pop(key) {
                    state.total_weight = state.total_weight.saturating_sub(stale.weight);
                }
            }
            return None;
        }
        state
            .entries
            .get(key)
            .map(|entry| Tracked::track(Arc::clone(entry)))
    }

    pub fn set(&self, key: &str, value: Arc<V>, weight: u64, ttl: Duration) -> Tracked<V> {
        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            value,
            expires_at: now.checked_add(ttl).unwrap_or(now),
            weight,
            refs: AtomicUsize::new(0),
        });
        let tracked = Tracked::track(Arc::clone(&entry));

        let mut state = self.state.lock();
        if let Some(replaced) = state.entries.put(key.to_string(), entry) {
            state.total_weight = state.total_weight.saturating_sub(replaced.weight);
        }
        state.total_weight = state.total_weight.saturating_add(weight);
        self.evict_locked(&mut state);
        tracked
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.pop(key) {
            Some(removed) => {
                state.total_weight = state.total_weight.saturating_sub(removed.weight);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_weight(&self) -> u64 {
        self.state.lock().total_weight
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn over_budget(&self, state: &CacheState<V>) -> bool {
        state.entries.len() > self.max_items || state.total_weight > self.max_weight
    }

    fn evict_locked(&self, state: &mut CacheState<V>) {
        while self.over_budget(state) {
            // Walk from the LRU end; only pinned entries are skipped.
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| !entry.is_pinned())
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                tracing::debug!(
                    items = state.entries.len(),
                    weight = state.total_weight,
                    "every cached entry is pinned; cache left above budget"
                );
                return;
            };
            if let Some(evicted) = state.entries.pop(&victim) {
                state.total_weight = state.total_weight.saturating_sub(evicted.weight);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(host = %victim, "evicted cached leaf certificate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::BoundedCache;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn cache(max_items: usize, max_weight: u64) -> BoundedCache<String> {
        BoundedCache::new(max_items, max_weight)
    }

    #[test]
    fn get_returns_same_value_instance() {
        let cache = cache(4, 1_000);
        let stored = cache.set("api.example.com", Arc::new("leaf".to_string()), 10, HOUR);
        let found = cache.get("api.example.com").expect("cached entry");
        assert!(found.ptr_eq(&stored));
        assert_eq!(found.as_str(), "leaf");
    }

    #[test]
    fn evicts_least_recently_used_over_item_budget() {
        let cache = cache(2, 1_000);
        drop(cache.set("a.example.com", Arc::new("a".to_string()), 1, HOUR));
        drop(cache.set("b.example.com", Arc::new("b".to_string()), 1, HOUR));
        drop(cache.get("a.example.com").expect("touch a"));
        drop(cache.set("c.example.com", Arc::new("c".to_string()), 1, HOUR));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b.example.com").is_none());
        assert!(cache.get("a.example.com").is_some());
        assert!(cache.get("c.example.com").is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn evicts_until_within_weight_budget() {
        let cache = cache(100, 100);
        drop(cache.set("a.example.com", Arc::new("a".to_string()), 40, HOUR));
        drop(cache.set("b.example.com", Arc::new("b".to_string()), 40, HOUR));
        drop(cache.set("c.example.com", Arc::new("c".to_string()), 90, HOUR));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_weight(), 90);
        assert!(cache.get("c.example.com").is_some());
    }

    #[test]
    fn pinned_entries_survive_eviction_until_released() {
        let cache = cache(1, 1_000);
        let pinned_a = cache.set("a.example.com", Arc::new("a".to_string()), 1, HOUR);
        let pinned_b = cache.set("b.example.com", Arc::new("b".to_string()), 1, HOUR);

        assert_eq!(cache.len(), 2, "pinned entries may exceed the item budget");

        drop(pinned_a);
        drop(pinned_b);
        drop(cache.set("c.example.com", Arc::new("c".to_string()), 1, HOUR));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("c.example.com").is_some());
    }

    #[test]
    fn cloned_handles_keep_entry_pinned() {
        let cache = cache(1, 1_000);
        let first = cache.set("a.example.com", Arc::new("a".to_string()), 1, HOUR);
        let second = first.clone();
        drop(first);
        drop(cache.set("b.example.com", Arc::new("b".to_string()), 1, HOUR));
        assert_eq!(cache.len(), 2);
        drop(second);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = cache(4, 1_000);
        drop(cache.set(
            "api.example.com",
            Arc::new("leaf".to_string()),
            10,
            Duration::from_millis(5),
        ));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("api.example.com").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_weight(), 0);
    }

    #[test]
    fn replacing_an_entry_adjusts_weight() {
        let cache = cache(4, 1_000);
        drop(cache.set("api.example.com", Arc::new("old".to_string()), 30, HOUR));
        drop(cache.set("api.example.com", Arc::new("new".to_string()), 50, HOUR));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_weight(), 50);
        assert_eq!(
            cache.get("api.example.com").expect("entry").as_str(),
            "new"
        );
        assert!(cache.remove("api.example.com"));
        assert!(cache.is_empty());
        assert_eq!(cache.total_weight(), 0);
    }

    #[test]
    fn expired_pinned_entry_is_not_promoted_by_a_miss() {
        let cache = cache(2, 1_000);
        let stale = cache.set(
            "stale.example.com",
            Arc::new("stale".to_string()),
            1,
            Duration::from_millis(5),
        );
        drop(cache.set("live.example.com", Arc::new("live".to_string()), 1, HOUR));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get("stale.example.com").is_none());
        assert_eq!(cache.len(), 2, "pinned expired entry stays until released");
        drop(stale);

        drop(cache.set("new.example.com", Arc::new("new".to_string()), 1, HOUR));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("live.example.com").is_some());
        assert!(cache.get("new.example.com").is_some());
    }

    #[test]
    fn eviction_cost_does_not_grow_with_cache_size() {
        fn time_evicting_inserts(capacity: usize) -> Duration {
            let cache = BoundedCache::new(capacity, u64::MAX);
            for index in 0..capacity {
                drop(cache.set(&format!("fill-{index}.example.com"), Arc::new(()), 1, HOUR));
            }
            let started = Instant::now();
            for index in 0..2_000 {
                drop(cache.set(&format!("new-{index}.example.com"), Arc::new(()), 1, HOUR));
            }
            assert_eq!(cache.len(), capacity);
            started.elapsed()
        }

        let small = time_evicting_inserts(100);
        let large = time_evicting_inserts(50_000);
        assert!(
            large < small * 20 + Duration::from_millis(100),
            "evicting inserts took {large:?} on a large cache vs {small:?} on a small one"
        );
    }
}
