//! Identity-keyed row snapshots.
//!
//! A cache is created empty, filled by one bulk enumeration, and then
//! consulted by key. Entries are never evicted; the whole cache goes away
//! with its session.

use std::collections::HashMap;
use tracing::debug;

/// Snapshots of one kind of system row, keyed by the row's natural identity.
#[derive(Debug, Clone)]
pub struct RowCache<V> {
    name: &'static str,
    capacity: usize,
    entries: HashMap<u32, Option<V>>,
}

impl<V: Clone> RowCache<V> {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        debug!(cache = name, capacity, "creating row cache");
        Self {
            name,
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// The number of rows the cache was sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The entry for `key`, created empty if it does not exist yet.
    pub fn get_or_create(&mut self, key: u32) -> &mut Option<V> {
        self.entries.entry(key).or_insert(None)
    }

    /// The stored snapshot for `key`, if any.
    pub fn get(&self, key: u32) -> Option<&V> {
        self.entries.get(&key).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut V> {
        self.entries.get_mut(&key).and_then(Option::as_mut)
    }

    /// Store a copy of `row` under `key`, replacing any previous snapshot.
    pub fn store(&mut self, key: u32, row: &V) {
        *self.get_or_create(key) = Some(row.clone());
    }

    /// Overwrite the snapshot under `key` in place, keeping the entry's slot.
    pub fn update(&mut self, key: u32, row: &V) {
        match self.get_or_create(key) {
            Some(existing) => existing.clone_from(row),
            slot => *slot = Some(row.clone()),
        }
    }

    /// Store every row of one enumeration under the key `key_of` gives it.
    pub fn populate_all<'r, I, K>(&mut self, rows: I, key_of: K) -> usize
    where
        I: IntoIterator<Item = &'r V>,
        K: Fn(&V) -> u32,
        V: 'r,
    {
        let mut stored = 0;
        for row in rows {
            self.store(key_of(row), row);
            stored += 1;
        }
        debug!(cache = self.name, rows = stored, "row cache populated");
        stored
    }

    /// Number of keys with a stored snapshot.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// String hash used to key interface rows by name: `h = 31 * h + c` over
/// the bytes of `name`, wrapping.
pub fn netif_hash(name: &str) -> u32 {
    name.bytes()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(u32::from(c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Adapter {
        index: u32,
        name: &'static str,
    }

    #[test]
    fn test_get_or_create_then_populate() {
        let mut cache = RowCache::with_capacity("adapters", 4);
        assert!(cache.get_or_create(2).is_none());

        let rows = vec![
            Adapter { index: 1, name: "eth0" },
            Adapter { index: 2, name: "eth1" },
        ];
        assert_eq!(cache.populate_all(&rows, |a| a.index), 2);

        assert_eq!(cache.get(2), Some(&rows[1]));
        assert_eq!(cache.get_or_create(2).as_ref(), Some(&rows[1]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_missing_key_stays_empty() {
        let mut cache: RowCache<Adapter> = RowCache::with_capacity("adapters", 0);
        cache.get_or_create(9);
        assert!(cache.get(9).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_is_owned() {
        let mut cache = RowCache::with_capacity("adapters", 1);
        let mut row = Adapter { index: 1, name: "eth0" };
        cache.store(1, &row);
        row.name = "changed";

        assert_eq!(cache.get(1).map(|a| a.name), Some("eth0"));
    }

    #[test]
    fn test_capacity_is_remembered() {
        let cache: RowCache<Adapter> = RowCache::with_capacity("adapters", 3);
        assert_eq!(cache.capacity(), 3);
    }

    #[test]
    fn test_update_overwrites_existing_entry() {
        let mut cache = RowCache::with_capacity("adapters", 2);
        cache.update(1, &Adapter { index: 1, name: "eth0" });
        cache.update(1, &Adapter { index: 1, name: "eth0-renamed" });

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).map(|a| a.name), Some("eth0-renamed"));
    }

    #[test]
    fn test_netif_hash() {
        assert_eq!(netif_hash(""), 0);
        assert_eq!(netif_hash("a"), 97);
        // 31 * 'l' + 'o' = 31 * 108 + 111
        assert_eq!(netif_hash("lo"), 3459);
        assert_ne!(netif_hash("eth0"), netif_hash("eth1"));
    }
}
