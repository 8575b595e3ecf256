//! Recency-ordered index shared by both cache tiers.
//!
//! Every touch takes a fresh tick from a per-index counter, so two entries
//! never share a recency and "least recently used" is always one entry.

use std::collections::{BTreeMap, HashMap};

use crate::cache::SliceKey;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    tick: u64,
    access_count: u64,
}

#[derive(Debug)]
pub(crate) struct LruIndex<V> {
    slots: HashMap<SliceKey, Slot<V>>,
    order: BTreeMap<u64, SliceKey>,
    tick: u64,
}

impl<V> Default for LruIndex<V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }
}

impl<V> LruIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &SliceKey) -> Option<&mut V> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.tick);
        self.order.insert(tick, key.clone());
        slot.tick = tick;
        slot.access_count += 1;
        Some(&mut slot.value)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &SliceKey) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    pub fn access_count(&self, key: &SliceKey) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.access_count)
    }

    pub fn contains(&self, key: &SliceKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Insert as most recently used, returning any replaced value.
    pub fn insert(&mut self, key: SliceKey, value: V) -> Option<V> {
        let tick = self.next_tick();
        let previous = self.remove(&key);
        self.order.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot {
                value,
                tick,
                access_count: 0,
            },
        );
        previous
    }

    pub fn remove(&mut self, key: &SliceKey) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.value)
    }

    /// Remove the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(SliceKey, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.value))
    }

    #[cfg(test)]
    pub fn lru_key(&self) -> Option<&SliceKey> {
        self.order.first_key_value().map(|(_, key)| key)
    }

    /// Keys matching `pred`, least recently used first.
    pub fn keys_where(&self, mut pred: impl FnMut(&SliceKey, &V) -> bool) -> Vec<SliceKey> {
        self.order
            .values()
            .filter(|key| self.slots.get(*key).is_some_and(|slot| pred(*key, &slot.value)))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }
}
