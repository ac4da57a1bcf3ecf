//! Fixed-capacity LRU cache with optional per-entry TTL
//!
//! Recency is tracked with an arena-backed doubly-linked list (indices into a
//! slot vector), giving O(1) get/set/delete under a single mutex. Expiry uses
//! a periodic janitor task plus a lazy check on `get`: an expired entry is
//! reported as a miss and removed on sight, and the janitor sweeps whatever
//! lookups never touch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cadence of the background expiry sweep.
const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

struct Slot<V> {
    key: String,
    value: V,
    expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<V> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
}

impl<V> Inner<V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    fn slot(&self, idx: usize) -> &Slot<V> {
        self.slots[idx].as_ref().unwrap()
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<V> {
        self.slots[idx].as_mut().unwrap()
    }

    /// Unlink a slot from the recency list.
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let s = self.slot(idx);
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let s = self.slot_mut(idx);
        s.prev = None;
        s.next = None;
    }

    /// Link a slot in as most-recently-used.
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let s = self.slot_mut(idx);
            s.prev = None;
            s.next = old_head;
        }
        if let Some(h) = old_head {
            self.slot_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove_idx(&mut self, idx: usize) -> Slot<V> {
        self.detach(idx);
        let slot = self.slots[idx].take().unwrap();
        self.map.remove(&slot.key);
        self.free.push(idx);
        slot
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            let slot = self.remove_idx(tail);
            debug!(key = %slot.key, "Evicting least-recently-used cache entry");
        }
    }

    fn alloc(&mut self, slot: Slot<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn set(&mut self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);

        if let Some(&idx) = self.map.get(key) {
            let s = self.slot_mut(idx);
            s.value = value;
            s.expires_at = expires_at;
            self.detach(idx);
            self.push_front(idx);
            return;
        }

        if self.map.len() >= self.capacity {
            self.evict_lru();
        }

        let idx = self.alloc(Slot {
            key: key.to_string(),
            value,
            expires_at,
            prev: None,
            next: None,
        });
        self.map.insert(key.to_string(), idx);
        self.push_front(idx);
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .map
            .values()
            .copied()
            .filter(|&idx| matches!(self.slot(idx).expires_at, Some(at) if at <= now))
            .collect();
        for idx in expired {
            let slot = self.remove_idx(idx);
            debug!(key = %slot.key, "Expired cache entry swept");
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }
}

pub struct LruCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + 'static> LruCache<V> {
    /// Create a cache holding at most `capacity` entries. Must be called from
    /// within a tokio runtime; the expiry janitor is spawned immediately.
    pub fn new(capacity: usize) -> Self {
        let inner = Arc::new(Mutex::new(Inner::new(capacity)));
        let janitor = Self::spawn_janitor(Arc::downgrade(&inner));
        Self {
            inner,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    fn spawn_janitor(inner: std::sync::Weak<Mutex<Inner<V>>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match inner.upgrade() {
                    Some(inner) => inner.lock().sweep_expired(),
                    None => return,
                }
            }
        })
    }
}

impl<V> LruCache<V> {
    /// Insert or replace `key`. The entry becomes most-recently-used; a `ttl`
    /// of `None` or zero never expires. Inserting over capacity evicts the
    /// least-recently-used entry.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.inner.lock().set(key, value, ttl);
    }

    /// Look up `key`, marking it most-recently-used. An expired entry is a
    /// miss and is removed here rather than waiting for the janitor.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.lock();
        let idx = *inner.map.get(key)?;
        if matches!(inner.slot(idx).expires_at, Some(at) if at <= Instant::now()) {
            inner.remove_idx(idx);
            return None;
        }
        inner.detach(idx);
        inner.push_front(idx);
        Some(inner.slot(idx).value.clone())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.remove_idx(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries but keep the cache (and its janitor) usable.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Halt the background janitor. Entries still expire lazily on `get`.
    pub fn stop(&self) {
        if let Some(handle) = self.janitor.lock().take() {
            handle.abort();
        }
    }
}

impl<V> Drop for LruCache<V> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let cache = LruCache::new(4);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("missing"), None);
    }

    #[tokio::test]
    async fn test_overwrite_moves_to_front() {
        let cache = LruCache::new(2);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);
        cache.set("a", 10u32, None);
        // "b" is now least-recently-used and gets evicted.
        cache.set("c", 3u32, None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let cache = LruCache::new(3);
        for i in 0..10u32 {
            cache.set(&format!("k{i}"), i, None);
            assert!(cache.len() <= 3);
        }
        // Only the three most recent survive.
        assert_eq!(cache.get("k9"), Some(9));
        assert_eq!(cache.get("k8"), Some(8));
        assert_eq!(cache.get("k7"), Some(7));
        assert_eq!(cache.get("k6"), None);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let cache = LruCache::new(2);
        cache.set("a", 1u32, None);
        cache.set("b", 2u32, None);
        assert_eq!(cache.get("a"), Some(1));
        // "b" is LRU now, so inserting "c" evicts it.
        cache.set("c", 3u32, None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_a_miss() {
        let cache = LruCache::new(4);
        cache.set("short", 1u32, Some(Duration::from_millis(20)));
        cache.set("forever", 2u32, None);
        assert_eq!(cache.get("short"), Some(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("forever"), Some(2));
    }

    #[tokio::test]
    async fn test_janitor_sweeps_untouched_entries() {
        let cache = LruCache::new(4);
        cache.set("stale", 1u32, Some(Duration::from_millis(20)));
        // Never call get; the sweep must reclaim it on its own.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let cache = LruCache::new(4);
        cache.set("a", 1u32, Some(Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("a"), Some(1));
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = LruCache::new(4);
        cache.set("a", 1u32, None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test]
    async fn test_reset_keeps_cache_usable() {
        let cache = LruCache::new(4);
        cache.set("a", 1u32, None);
        cache.reset();
        assert!(cache.is_empty());
        cache.set("b", 2u32, None);
        assert_eq!(cache.get("b"), Some(2));
    }
}
