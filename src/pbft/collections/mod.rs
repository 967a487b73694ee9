//! Collection types used throughout `abraxas`.
//!
//! The hash based containers default to a faster hashing function
//! than the one in the standard library, since HashDoS resistance
//! is of no concern for maps keyed by protocol metadata.

use std::hash::Hash;

#[cfg(feature = "collections_randomstate_std")]
use std::collections::hash_map::RandomState;

#[cfg(feature = "collections_randomstate_twox_hash")]
use twox_hash::RandomXxHashBuilder64 as RandomState;

/// A map which keeps track of insertion order.
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V, RandomState>;

/// The `HashMap` used by the sub-protocols of this crate.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// The `HashSet` used by the sub-protocols of this crate.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K: Hash + Eq, V>() -> HashMap<K, V> {
    HashMap::with_hasher(RandomState::default())
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K: Hash + Eq, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, RandomState::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T: Hash + Eq>() -> HashSet<T> {
    HashSet::with_hasher(RandomState::default())
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::with_hasher(RandomState::default())
}
