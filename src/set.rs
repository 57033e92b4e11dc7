//! Membership sets backing `in [...]` list comparisons.
//!
//! A set is built once by the code generator, owned by the block that
//! references it, and queried with O(log n) exact-match lookups on the hot
//! path. Keys are typed per filter use: `u64` for ports, AS numbers and IPv4
//! addresses, `u128` for IPv6 addresses.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Ordered, duplicate-free set of scalar keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSet<K: Ord> {
    keys: BTreeSet<K>,
}

/// Set of 64-bit keys: ports, AS numbers, IPv4 address words.
pub type ValueSet = MembershipSet<u64>;

/// Set of paired-word IPv6 address keys.
pub type AddrSet = MembershipSet<u128>;

impl<K: Ord> MembershipSet<K> {
    pub fn new() -> Self {
        Self { keys: BTreeSet::new() }
    }

    /// Insert a key; duplicates are absorbed. Returns whether the key was new.
    pub fn insert(&mut self, key: K) -> bool {
        self.keys.insert(key)
    }

    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K: Ord> FromIterator<K> for MembershipSet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Self { keys: iter.into_iter().collect() }
    }
}
