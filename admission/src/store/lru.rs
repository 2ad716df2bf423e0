//! Single-owner LRU map with optional per-entry expiry.
//!
//! Recency is tracked with monotonically increasing stamps kept in a
//! `BTreeMap`, so every operation is `O(log n)`. The map can either stamp
//! entries itself ([`LruMap::put`]) or accept stamps from an owner that orders
//! several maps against one clock (the sharded store).
//!
//! Each entry keeps its own idle TTL. Touching an entry slides its deadline by
//! that TTL, never by another entry's.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot<V> {
    value: V,
    stamp: u64,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Capacity-bounded map that evicts its least recently used entry.
#[derive(Debug)]
pub struct LruMap<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_stamp: u64,
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a map holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// Number of entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces an entry, evicting the least recently used entry
    /// when a new key would exceed capacity. Returns the evicted entry.
    pub fn put(&mut self, key: K, value: V, now: Instant, ttl: Option<Duration>) -> Option<(K, V)> {
        let evicted = if self.entries.contains_key(&key) || self.entries.len() < self.capacity {
            None
        } else {
            self.pop_oldest()
        };
        let stamp = self.tick();
        self.insert_stamped(key, value, stamp, now, ttl);
        evicted
    }

    /// Returns `true` if a live entry exists, without touching recency.
    #[must_use]
    pub fn contains_live(&self, key: &K, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|slot| !slot.is_expired(now))
    }

    /// Returns `true` if any entry (live or expired) exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns `true` if the entry exists and its deadline has passed.
    #[must_use]
    pub fn is_expired(&self, key: &K, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|slot| slot.is_expired(now))
    }

    /// Reads an entry without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_entry(key).map(|(_, v)| v)
    }

    /// Removes an entry, returning the stored key as well.
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        let slot = self.entries.remove(key)?;
        let stored = self.order.remove(&slot.stamp)?;
        Some((stored, slot.value))
    }

    /// Stamp of the least recently used entry.
    #[must_use]
    pub fn oldest_stamp(&self) -> Option<u64> {
        self.order.keys().next().copied()
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }

    /// Removes every expired entry.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| self.remove_entry(key))
            .collect()
    }

    /// Pops expired entries from the least recently used end, stopping at the
    /// first live one. Exact when every entry is written with the same TTL,
    /// since recency order then equals expiry order.
    pub fn pop_expired_lru(&mut self, now: Instant) -> usize {
        let mut popped = 0;
        while let Some((_, key)) = self.order.first_key_value() {
            if !self.is_expired(key, now) {
                break;
            }
            self.pop_oldest();
            popped += 1;
        }
        popped
    }

    /// Visits every entry in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, slot)| (k, &slot.value))
    }

    /// Visits every entry mutably in unspecified order, without touching recency.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut().map(|(k, slot)| (k, &mut slot.value))
    }

    pub(crate) fn insert_stamped(
        &mut self,
        key: K,
        value: V,
        stamp: u64,
        now: Instant,
        ttl: Option<Duration>,
    ) -> Option<V> {
        let previous = self.entries.remove(&key).map(|slot| {
            self.order.remove(&slot.stamp);
            slot.value
        });
        self.order.insert(stamp, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                stamp,
                ttl,
                expires_at: ttl.map(|t| now + t),
            },
        );
        previous
    }

    pub(crate) fn get_mut_stamped(&mut self, key: &K, stamp: u64) -> Option<&mut V> {
        let slot = self.entries.get_mut(key)?;
        if let Some(stored) = self.order.remove(&slot.stamp) {
            self.order.insert(stamp, stored);
        }
        slot.stamp = stamp;
        Some(&mut slot.value)
    }

    /// Restarts the entry's idle TTL from `now`.
    pub(crate) fn refresh_expiry(&mut self, key: &K, now: Instant) {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.expires_at = slot.ttl.map(|t| now + t);
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }
}
