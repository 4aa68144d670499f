use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use web_time::Instant;

struct Slot<V> {
    value: V,
    inserted_at: Instant,
}

/// Thread-safe map whose entries silently vanish once their TTL has elapsed.
///
/// Expiry is lazy: reads drop the entry they hit if it is stale, and
/// [`ExpiringCache::sweep_at`] clears everything stale in bulk. There is no
/// explicit cancellation; TTL is the only way an entry goes away on its own.
pub struct ExpiringCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, slot: &Slot<V>, now: Instant) -> bool {
        now.saturating_duration_since(slot.inserted_at) >= self.ttl
    }

    /// Inserts `value`, replacing any prior entry. Returns the replaced value
    /// if it was still live.
    pub fn insert_at(&self, key: K, value: V, now: Instant) -> Option<V> {
        let previous = self.lock().insert(
            key,
            Slot {
                value,
                inserted_at: now,
            },
        )?;
        (!self.expired(&previous, now)).then_some(previous.value)
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut guard = self.lock();
        let slot = guard.get(key)?;
        if self.expired(slot, now) {
            guard.remove(key);
            return None;
        }
        Some(slot.value.clone())
    }

    /// Removes and returns the entry if it is still live.
    pub fn take_at(&self, key: &K, now: Instant) -> Option<V> {
        let slot = self.lock().remove(key)?;
        (!self.expired(&slot, now)).then_some(slot.value)
    }

    pub fn contains_at(&self, key: &K, now: Instant) -> bool {
        self.get_at(key, now).is_some()
    }

    /// True if any live entry satisfies `predicate`.
    pub fn any_at(&self, now: Instant, mut predicate: impl FnMut(&K, &V) -> bool) -> bool {
        let guard = self.lock();
        guard
            .iter()
            .any(|(key, slot)| !self.expired(slot, now) && predicate(key, &slot.value))
    }

    /// Drops every stale entry. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, slot| now.saturating_duration_since(slot.inserted_at) < self.ttl);
        before - guard.len()
    }

    /// Raw entry count, stale entries included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
