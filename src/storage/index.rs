use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::storage::data::RecordKey;

/// A secondary index from one column value to the composite keys holding it.
///
/// Keys under each value are kept in a `BTreeSet`, so a lookup yields them in
/// `RecordKey` order (target, epiweek, location).
#[derive(Debug, Clone)]
pub struct SecondaryIndex<V> {
    entries: HashMap<V, BTreeSet<RecordKey>>,
}

impl<V: Eq + Hash> SecondaryIndex<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds `key` under `value`
    pub fn insert(&mut self, value: V, key: RecordKey) {
        self.entries.entry(value).or_default().insert(key);
    }

    /// Removes `key` from under `value`, dropping the value once it is empty.
    /// Returns true if the key was present.
    pub fn remove(&mut self, value: &V, key: &RecordKey) -> bool {
        let Some(keys) = self.entries.get_mut(value) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.entries.remove(value);
        }
        removed
    }

    /// Returns the keys stored under `value`, in key order
    pub fn get(&self, value: &V) -> impl Iterator<Item = &RecordKey> + '_ {
        self.entries.get(value).into_iter().flatten()
    }

    /// Returns the number of keys stored under `value`
    pub fn count(&self, value: &V) -> usize {
        self.entries.get(value).map_or(0, BTreeSet::len)
    }

    /// Returns the number of distinct indexed values
    pub fn cardinality(&self) -> usize {
        self.entries.len()
    }
}

impl<V: Eq + Hash> Default for SecondaryIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}
