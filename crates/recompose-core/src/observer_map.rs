//! Many-to-many map from observed objects to their observers.
//!
//! Entries are bucketed by allocation identity rather than by the key's own
//! `Hash`, so a key whose hash changes after insertion (a mutable model object
//! hashing its fields) is still found through the `Rc` it was inserted with.

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::collections::map::HashMap;
use crate::collections::PtrKey;

struct Bucket<K: ?Sized, V> {
    key: Rc<K>,
    values: SmallVec<[V; 4]>,
}

pub struct ObserverMap<K: ?Sized, V> {
    buckets: HashMap<PtrKey, Bucket<K, V>>,
}

impl<K: ?Sized, V> Default for ObserverMap<K, V> {
    fn default() -> Self {
        Self {
            buckets: HashMap::default(),
        }
    }
}

impl<K: ?Sized, V: Clone + PartialEq> ObserverMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `value` with `key`. Returns false when the pair was
    /// already present.
    pub fn add(&mut self, key: &Rc<K>, value: V) -> bool {
        let bucket = self
            .buckets
            .entry(PtrKey::of(key))
            .or_insert_with(|| Bucket {
                key: Rc::clone(key),
                values: SmallVec::new(),
            });
        if bucket.values.contains(&value) {
            return false;
        }
        bucket.values.push(value);
        true
    }

    /// Removes one pair. Keys left without values are dropped.
    pub fn remove(&mut self, key: &Rc<K>, value: &V) -> bool {
        let id = PtrKey::of(key);
        let Some(bucket) = self.buckets.get_mut(&id) else {
            return false;
        };
        let Some(position) = bucket.values.iter().position(|entry| entry == value) else {
            return false;
        };
        bucket.values.remove(position);
        if bucket.values.is_empty() {
            self.buckets.remove(&id);
        }
        true
    }

    /// Removes `key` and returns the values it was associated with.
    pub fn remove_key(&mut self, key: &Rc<K>) -> Vec<V> {
        self.buckets
            .remove(&PtrKey::of(key))
            .map(|bucket| bucket.values.into_vec())
            .unwrap_or_default()
    }

    /// Removes `value` from every key.
    pub fn remove_value(&mut self, value: &V) {
        self.remove_values_if(|entry| entry == value);
    }

    pub fn remove_values_if(&mut self, mut predicate: impl FnMut(&V) -> bool) {
        self.buckets.retain(|_, bucket| {
            bucket.values.retain(|entry| !predicate(entry));
            !bucket.values.is_empty()
        });
    }

    pub fn get(&self, key: &Rc<K>) -> &[V] {
        self.buckets
            .get(&PtrKey::of(key))
            .map(|bucket| bucket.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &Rc<K>) -> bool {
        self.buckets.contains_key(&PtrKey::of(key))
    }

    pub fn contains(&self, key: &Rc<K>, value: &V) -> bool {
        self.get(key).contains(value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Rc<K>> + '_ {
        self.buckets.values().map(|bucket| &bucket.key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl<K: ?Sized + PartialEq, V> ObserverMap<K, V> {
    /// Finds values for a key that is equal to `key` but may be a different
    /// allocation. Linear in the number of keys; independent of `K`'s hash.
    pub fn get_equal(&self, key: &K) -> &[V] {
        self.buckets
            .values()
            .find(|bucket| *bucket.key == *key)
            .map(|bucket| bucket.values.as_slice())
            .unwrap_or(&[])
    }
}

impl<K: ?Sized, V: fmt::Debug> fmt::Debug for ObserverMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.buckets
                    .iter()
                    .map(|(id, bucket)| (id.addr(), bucket.values.as_slice())),
            )
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/observer_map_tests.rs"]
mod tests;
