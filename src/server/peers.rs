//! Announced peers and stored data, bounded by a strict LRU.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::{Datum, Id};

/// How many peers a single read returns.
const VALUES_PER_READ: usize = 8;

/// The peers (and optional datum) known for one infohash.
///
/// A rotation cursor makes successive reads return different members until
/// the set wraps.
#[derive(Debug, Default)]
pub(crate) struct PeerSet {
    addrs: Vec<SocketAddr>,
    seen: HashSet<SocketAddr>,
    cursor: usize,
    datum: Option<Datum>,
}

impl PeerSet {
    /// Add an address. Returns false if it was already present.
    fn insert(&mut self, addr: SocketAddr) -> bool {
        if !self.seen.insert(addr) {
            return false;
        }

        self.addrs.push(addr);
        true
    }

    /// Up to eight members, advancing the rotation cursor.
    fn next_values(&mut self) -> Vec<SocketAddr> {
        let count = VALUES_PER_READ.min(self.addrs.len());

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            self.cursor = (self.cursor + 1) % self.addrs.len();
            values.push(self.addrs[self.cursor]);
        }

        values
    }

    fn len(&self) -> usize {
        self.addrs.len()
    }
}

/// LRU-bounded map of infohash to peer set.
#[derive(Debug)]
pub(crate) struct PeerStore {
    sets: LruCache<Id, PeerSet>,
    max_peers_per_info_hash: usize,
}

impl PeerStore {
    pub fn new(max_info_hashes: usize, max_peers_per_info_hash: usize) -> PeerStore {
        let capacity = NonZeroUsize::new(max_info_hashes.max(1)).expect("nonzero");

        PeerStore {
            sets: LruCache::new(capacity),
            max_peers_per_info_hash,
        }
    }

    /// Number of peers known for `info_hash`.
    pub fn count(&self, info_hash: &Id) -> usize {
        self.sets.peek(info_hash).map_or(0, PeerSet::len)
    }

    /// Up to eight peers for `info_hash`; successive calls rotate through
    /// the whole set before repeating.
    pub fn values(&mut self, info_hash: &Id) -> Vec<SocketAddr> {
        self.sets
            .get_mut(info_hash)
            .map_or_else(Vec::new, PeerSet::next_values)
    }

    /// Add an address for `info_hash`. Returns true if it was new and the
    /// set had room.
    pub fn add(&mut self, info_hash: Id, addr: SocketAddr) -> bool {
        if let Some(set) = self.sets.get_mut(&info_hash) {
            if set.len() >= self.max_peers_per_info_hash {
                return false;
            }
            return set.insert(addr);
        }

        let mut set = PeerSet::default();
        let added = set.insert(addr);
        self.sets.put(info_hash, set);
        added
    }

    pub fn datum(&mut self, info_hash: &Id) -> Option<&Datum> {
        self.sets.get(info_hash).and_then(|set| set.datum.as_ref())
    }

    /// Store a datum for `info_hash`, replacing any previous one. Validation
    /// is the put handler's responsibility.
    pub fn add_datum(&mut self, info_hash: Id, datum: Datum) {
        if let Some(set) = self.sets.get_mut(&info_hash) {
            set.datum = Some(datum);
            return;
        }

        let set = PeerSet {
            datum: Some(datum),
            ..PeerSet::default()
        };
        self.sets.put(info_hash, set);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn capped_unique_and_lru_evicted() {
        let ih = Id::random();
        let ih2 = Id::random();
        let mut store = PeerStore::new(1, 2);

        assert_eq!(store.count(&ih), 0);

        assert!(store.add(ih, addr("1.2.3.4:1234")));
        assert_eq!(store.count(&ih), 1);

        assert!(store.add(ih, addr("2.3.4.5:2345")));
        assert_eq!(store.count(&ih), 2);

        // Duplicate address.
        assert!(!store.add(ih, addr("2.3.4.5:2345")));
        assert_eq!(store.count(&ih), 2);

        // At capacity.
        assert!(!store.add(ih, addr("3.4.5.6:3456")));
        assert_eq!(store.count(&ih), 2);
        assert!(!store.values(&ih).contains(&addr("3.4.5.6:3456")));

        // A second infohash evicts the first from the single LRU slot.
        assert!(store.add(ih2, addr("2.3.4.5:2345")));
        assert_eq!(store.count(&ih), 0);
        assert_eq!(store.count(&ih2), 1);
    }

    #[test]
    fn values_rotate_through_members() {
        let ih = Id::random();
        let mut store = PeerStore::new(16, 64);

        let addrs: Vec<SocketAddr> = (1..=10).map(|i| addr(&format!("10.0.0.{i}:1"))).collect();
        for a in &addrs {
            assert!(store.add(ih, *a));
        }

        let first = store.values(&ih);
        let second = store.values(&ih);
        assert_eq!(first.len(), 8);
        assert_eq!(second.len(), 8);

        // Two successive reads cover all ten members.
        let union: HashSet<SocketAddr> = first.into_iter().chain(second).collect();
        assert_eq!(union.len(), addrs.len());
    }

    #[test]
    fn values_on_unknown_infohash_is_empty() {
        let mut store = PeerStore::new(4, 4);
        assert!(store.values(&Id::random()).is_empty());
    }

    #[test]
    fn datum_slot_replaces_unconditionally() {
        let ih = Id::random();
        let mut store = PeerStore::new(4, 4);

        assert!(store.datum(&ih).is_none());

        store.add_datum(ih, Datum::immutable(Bytes::from_static(b"first")));
        assert_eq!(
            store.datum(&ih).map(|d| d.value.clone()),
            Some(Bytes::from_static(b"first"))
        );

        store.add_datum(ih, Datum::immutable(Bytes::from_static(b"second")));
        assert_eq!(
            store.datum(&ih).map(|d| d.value.clone()),
            Some(Bytes::from_static(b"second"))
        );
    }

    #[test]
    fn datum_coexists_with_peers() {
        let ih = Id::random();
        let mut store = PeerStore::new(4, 4);

        store.add(ih, addr("1.2.3.4:1"));
        store.add_datum(ih, Datum::immutable(Bytes::from_static(b"v")));

        assert_eq!(store.count(&ih), 1);
        assert!(store.datum(&ih).is_some());
    }
}
