//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeMap;

/// A (Key, Value) cache, that keeps the largest keys (by Ord trait) up to the size limit specified
/// dropping the smallest key on insert if full.
#[derive(Debug)]
pub struct KeySortedCache<K, V> {
    limit: usize,
    value_by_key: BTreeMap<K, V>,
}

impl<K: Ord, V> KeySortedCache<K, V> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            value_by_key: BTreeMap::new(),
        }
    }

    /// Returns the evicted (smallest) entry if the insert went over the limit.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.value_by_key.insert(key, value);
        if self.value_by_key.len() > self.limit {
            self.value_by_key.pop_first()
        } else {
            None
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.value_by_key.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.value_by_key.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.value_by_key.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> + '_ {
        self.value_by_key.iter_mut()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.value_by_key.remove(key)
    }

    pub fn first_key_value(&self) -> Option<(&K, &V)> {
        self.value_by_key.first_key_value()
    }

    pub fn pop_first(&mut self) -> Option<(K, V)> {
        self.value_by_key.pop_first()
    }

    pub fn len(&self) -> usize {
        self.value_by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value_by_key.is_empty()
    }

    pub fn retain(&mut self, f: impl FnMut(&K, &mut V) -> bool) {
        self.value_by_key.retain(f)
    }

    pub fn clear(&mut self) {
        self.value_by_key.clear()
    }
}
