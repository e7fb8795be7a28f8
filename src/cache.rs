use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

/// Storage for values a loader has already resolved during its unit of work.
pub trait Cache {
    type K;
    type V;

    /// Returns all the values associated with the provided keys in order with their respective
    /// keys.
    fn get(&self, keys: &[Self::K]) -> Vec<Option<&Self::V>>;

    fn insert(&mut self, key: Self::K, value: Self::V);

    fn flush(&mut self);
}

impl<K, V, S: BuildHasher> Cache for HashMap<K, V, S>
where
    K: Eq + Hash,
{
    type K = K;
    type V = V;

    fn get(&self, keys: &[Self::K]) -> Vec<Option<&Self::V>> {
        keys.iter().map(|k| HashMap::get(self, k)).collect::<Vec<_>>()
    }

    fn insert(&mut self, key: Self::K, value: Self::V) {
        HashMap::insert(self, key, value);
    }

    fn flush(&mut self) {
        self.clear();
    }
}
