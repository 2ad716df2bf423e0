//! Capacity-bounded keyed state shared by every admission stage.
//!
//! [`BoundedStore`] replaces the unbounded per-key maps that every stage would
//! otherwise accumulate under real-world cardinality growth. It is a fixed
//! capacity map with least-recently-used eviction, optional per-entry TTL, and
//! an eviction callback.
//!
//! # Locking
//!
//! Keys are spread over independently locked shards, so batches touching
//! disjoint keys never contend and a batch touching one key only serializes on
//! that key's shard. Capacity is global: a slot is reserved through an atomic
//! counter before a new key is inserted, and when the store is full the entry
//! with the oldest recency stamp across all shards is evicted first. Shards are
//! locked one at a time; no code path holds two shard locks at once.
//!
//! # Callbacks
//!
//! Eviction callbacks run after the shard lock is released and before the
//! insertion that triggered them completes. They must not call back into the
//! same store.

pub mod lru;

pub use lru::LruMap;

use crate::clock::SharedClock;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Why an entry left the store without an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Evicted to make room for a new key.
    Capacity,
    /// Its TTL elapsed.
    Expired,
}

/// Callback invoked for every evicted or expired entry.
pub type EvictionCallback<K, V> = Arc<dyn Fn(&K, &V, EvictionReason) + Send + Sync>;

/// Sizing parameters for a [`BoundedStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Maximum number of entries across all shards (minimum 1).
    pub capacity: usize,
    /// Number of independently locked shards.
    pub shards: usize,
    /// Idle time after which an entry expires. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl StoreConfig {
    /// Creates a config for `capacity` entries with default sharding and no TTL.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shards: DEFAULT_SHARDS,
            ttl: None,
        }
    }

    /// Sets the shard count.
    #[must_use]
    pub const fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Sets the idle TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Current number of entries.
    pub len: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Entries removed after their TTL elapsed.
    pub expirations: u64,
}

/// Sharded, capacity-bounded LRU map safe for concurrent use.
pub struct BoundedStore<K, V> {
    shards: Box<[Mutex<LruMap<K, V>>]>,
    hasher: RandomState,
    capacity: usize,
    len: AtomicUsize,
    stamp: AtomicU64,
    ttl: Option<Duration>,
    clock: SharedClock,
    on_evict: Option<EvictionCallback<K, V>>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> BoundedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: StoreConfig, clock: SharedClock) -> Self {
        let capacity = config.capacity.max(1);
        let shard_count = config.shards.clamp(1, capacity);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruMap::new(capacity)))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            capacity,
            len: AtomicUsize::new(0),
            stamp: AtomicU64::new(0),
            ttl: config.ttl,
            clock,
            on_evict: None,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Installs the eviction callback.
    #[must_use]
    pub fn with_eviction_callback(mut self, callback: EvictionCallback<K, V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries, including expired entries not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns current counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            len: self.len(),
            capacity: self.capacity,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Returns a clone of a live value and marks it most recently used.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = self.clock.now();
        let expired = {
            let mut shard = self.shard(key).lock();
            if shard.is_expired(key, now) {
                shard.remove_entry(key)
            } else {
                let stamp = self.next_stamp();
                let value = shard.get_mut_stamped(key, stamp).cloned();
                if value.is_some() {
                    shard.refresh_expiry(key, now);
                }
                return value;
            }
        };
        if let Some((k, v)) = expired {
            self.release(&k, &v, EvictionReason::Expired);
        }
        None
    }

    /// Returns a clone of a live value without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = self.clock.now();
        let shard = self.shard(key).lock();
        if shard.is_expired(key, now) {
            return None;
        }
        shard.peek(key).cloned()
    }

    /// Applies `read` to a live value under its shard lock, without touching
    /// recency.
    pub fn read<R>(&self, key: &K, read: impl FnOnce(&V) -> R) -> Option<R> {
        let now = self.clock.now();
        let shard = self.shard(key).lock();
        if shard.is_expired(key, now) {
            return None;
        }
        shard.peek(key).map(read)
    }

    /// Returns `true` if a live entry exists. Does not touch recency.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.shard(key).lock().contains_live(key, now)
    }

    /// Inserts or replaces a value using the store's TTL.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.put_with_ttl(key, value, self.ttl)
    }

    /// Inserts or replaces a value with an explicit TTL.
    ///
    /// Inserting a new key into a full store evicts the least recently used
    /// entry first.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        let now = self.clock.now();
        {
            let mut shard = self.shard(&key).lock();
            if shard.contains_key(&key) {
                return shard.insert_stamped(key, value, self.next_stamp(), now, ttl);
            }
        }

        self.reserve_slot();
        let mut shard = self.shard(&key).lock();
        if shard.contains_key(&key) {
            // Another writer inserted the key while the slot was reserved.
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        shard.insert_stamped(key, value, self.next_stamp(), now, ttl)
    }

    /// Inserts `value` only if no live entry exists. Returns `true` on insert.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = self.clock.now();
        let expired = {
            let mut shard = self.shard(&key).lock();
            if shard.contains_live(&key, now) {
                return false;
            }
            shard.remove_entry(&key)
        };
        if let Some((k, v)) = expired {
            self.release(&k, &v, EvictionReason::Expired);
        }

        self.reserve_slot();
        let mut shard = self.shard(&key).lock();
        if shard.contains_key(&key) {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        shard.insert_stamped(key, value, self.next_stamp(), now, self.ttl);
        true
    }

    /// Runs `update` on the entry for `key` under its shard lock, creating the
    /// entry with `init` first if it is absent or expired.
    ///
    /// `update` must not access this store.
    pub fn upsert<R>(&self, key: K, init: impl FnOnce() -> V, update: impl FnOnce(&mut V) -> R) -> R {
        let now = self.clock.now();
        let expired = {
            let mut shard = self.shard(&key).lock();
            if shard.is_expired(&key, now) {
                shard.remove_entry(&key)
            } else {
                let stamp = self.next_stamp();
                if let Some(value) = shard.get_mut_stamped(&key, stamp) {
                    let result = update(value);
                    shard.refresh_expiry(&key, now);
                    return result;
                }
                None
            }
        };
        if let Some((k, v)) = expired {
            self.release(&k, &v, EvictionReason::Expired);
        }

        self.reserve_slot();
        let mut shard = self.shard(&key).lock();
        let stamp = self.next_stamp();
        if let Some(value) = shard.get_mut_stamped(&key, stamp) {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return update(value);
        }
        let mut value = init();
        let result = update(&mut value);
        shard.insert_stamped(key, value, stamp, now, self.ttl);
        result
    }

    /// Removes an entry without invoking the eviction callback.
    pub fn delete(&self, key: &K) -> Option<V> {
        let removed = self.shard(key).lock().remove(key);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Visits every entry mutably, one shard lock at a time.
    pub fn for_each_mut(&self, mut visit: impl FnMut(&K, &mut V)) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            for (key, value) in shard.iter_mut() {
                visit(key, value);
            }
        }
    }

    /// Maps every entry to a value, one shard lock at a time.
    pub fn collect<T>(&self, mut map: impl FnMut(&K, &V) -> T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let shard = shard.lock();
            out.extend(shard.iter().map(|(k, v)| map(k, v)));
        }
        out
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        for shard in self.shards.iter() {
            let drained = shard.lock().drain_expired(now);
            purged += drained.len();
            for (k, v) in drained {
                self.release(&k, &v, EvictionReason::Expired);
            }
        }
        purged
    }

    fn shard(&self, key: &K) -> &Mutex<LruMap<K, V>> {
        let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves room for one new entry, evicting until a slot is free.
    fn reserve_slot(&self) {
        loop {
            let current = self.len.load(Ordering::Acquire);
            if current < self.capacity {
                if self
                    .len
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if !self.evict_lru() {
                // Every counted slot belongs to an insertion still in flight.
                std::thread::yield_now();
            }
        }
    }

    /// Evicts the entry with the oldest stamp across all shards.
    fn evict_lru(&self) -> bool {
        let victim = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(index, shard)| shard.lock().oldest_stamp().map(|stamp| (stamp, index)))
            .min();
        let Some((_, index)) = victim else {
            return false;
        };
        let evicted = self.shards[index].lock().pop_oldest();
        match evicted {
            Some((k, v)) => {
                self.release(&k, &v, EvictionReason::Capacity);
                true
            }
            None => false,
        }
    }

    fn release(&self, key: &K, value: &V, reason: EvictionReason) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        match reason {
            EvictionReason::Capacity => self.evictions.fetch_add(1, Ordering::Relaxed),
            EvictionReason::Expired => self.expirations.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(callback) = &self.on_evict {
            callback(key, value, reason);
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedStore")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards.len())
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
