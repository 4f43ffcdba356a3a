use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::{
    BlacklistEntry, ChallengeEntry, ConntrackEntry, Endpoint, RateBucket, StatsMap,
};

/// Default capacity limits per map.
pub const ENDPOINT_CAPACITY: usize = 10_000;
pub const RATE_BUCKET_CAPACITY: usize = 100_000;
pub const CONNTRACK_CAPACITY: usize = 100_000;
pub const BLACKLIST_CAPACITY: usize = 50_000;
pub const CHALLENGE_CAPACITY: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("{0} is full ({1} entries)")]
    Saturated(&'static str, usize),
}

/// A fixed-capacity keyed table with O(1) lookup and per-key mutation.
///
/// Inserting a fresh key past capacity fails; replacing an existing key never
/// does. Concurrent inserts may overshoot the limit by a handful of entries,
/// which the capacity figures already tolerate.
pub struct Table<K, V, S = RandomState> {
    name: &'static str,
    capacity: usize,
    inner: DashMap<K, V, S>,
}

/// Table keyed by an integer that is already well distributed (addresses,
/// tuple hashes), skipping the sip-hash pass.
pub type NoHashTable<K, V> = Table<K, V, BuildNoHashHasher<K>>;

impl<K, V, S> Table<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone + Default,
{
    pub fn new(name: &'static str, capacity: usize) -> Table<K, V, S> {
        Table {
            name,
            capacity,
            inner: DashMap::with_capacity_and_hasher(capacity, S::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Copies the value out. The packet path works on value types, never on
    /// references into the table.
    pub fn lookup(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Exclusive access to one row, if present.
    pub fn get_mut(&self, key: &K) -> Option<RefMut<'_, K, V>> {
        self.inner.get_mut(key)
    }

    /// Insert-or-replace. Fails only when the key is fresh and the table is
    /// at capacity.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, TableError> {
        if !self.inner.contains_key(&key) && self.inner.len() >= self.capacity {
            return Err(TableError::Saturated(self.name, self.capacity));
        }
        Ok(self.inner.insert(key, value))
    }

    /// Returns the existing row or inserts one produced by `init`, subject to
    /// the capacity limit.
    pub fn load_or_insert_with(
        &self,
        key: K,
        init: impl FnOnce() -> V,
    ) -> Result<RefMut<'_, K, V>, TableError> {
        if !self.inner.contains_key(&key) && self.inner.len() >= self.capacity {
            return Err(TableError::Saturated(self.name, self.capacity));
        }
        Ok(match self.inner.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(init()),
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Bounded sweep used by the reaper: keeps rows for which `keep` returns
    /// true. Locks one shard at a time.
    pub fn retain(&self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.inner.retain(keep);
    }

    pub fn iter(&self) -> dashmap::iter::Iter<'_, K, V, S> {
        self.inner.iter()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

/// The full set of shared maps, created once at startup. The classifier and
/// the synchronizer each hold their own handle to this bundle.
pub struct Maps {
    pub endpoints: NoHashTable<u64, Endpoint>,
    pub src_rate: NoHashTable<u32, RateBucket>,
    pub conntrack: NoHashTable<u64, ConntrackEntry>,
    pub blacklist: NoHashTable<u32, BlacklistEntry>,
    pub udp_challenges: NoHashTable<u32, ChallengeEntry>,
    pub stats: StatsMap,
}

impl Maps {
    pub fn new() -> Maps {
        Maps {
            endpoints: Table::new("map_protected_endpoints", ENDPOINT_CAPACITY),
            src_rate: Table::new("map_src_rate", RATE_BUCKET_CAPACITY),
            conntrack: Table::new("map_conntrack", CONNTRACK_CAPACITY),
            blacklist: Table::new("map_blacklist", BLACKLIST_CAPACITY),
            udp_challenges: Table::new("map_udp_challenges", CHALLENGE_CAPACITY),
            stats: StatsMap::new(),
        }
    }
}

impl Default for Maps {
    fn default() -> Maps {
        Maps::new()
    }
}
