//! Routing over a path-compressed binary trie, without buckets.
//!
//! Every known node is keyed by its 160-bit ID. A slot may hold a single
//! node directly (a compressed path); inserting a second node with a
//! different ID branches the slot out bit by bit until the two IDs
//! disagree. Lookup is an in-order traversal directed by the target's
//! bits, descending into the nearer child first, which emits nodes in
//! approximate XOR-distance order; collecting the first eight therefore
//! yields the K closest.

use std::net::SocketAddr;

use crate::common::{Id, ID_BITS};

/// K: how many nodes a lookup collects.
pub(crate) const K: usize = 8;

/// A node's entry in the trie: its ID and where to reach it. The records
/// themselves live in the routing table's address index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Contact {
    pub id: Id,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Leaf(Contact),
    Branch {
        zero: Box<Slot>,
        one: Box<Slot>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Trie {
    root: Slot,
}

impl Trie {
    pub fn new() -> Trie {
        Trie { root: Slot::Empty }
    }

    /// Insert a contact. An existing contact with the same ID is replaced.
    pub fn insert(&mut self, contact: Contact) {
        put(&mut self.root, contact, 0);
    }

    /// The up-to-[K] closest contacts to `target`.
    pub fn lookup(&self, target: &Id) -> Vec<Contact> {
        self.lookup_filtered(target, |_| true)
    }

    /// The up-to-[K] closest contacts to `target` that pass `filter`.
    pub fn lookup_filtered(&self, target: &Id, filter: impl Fn(&Contact) -> bool) -> Vec<Contact> {
        let mut found = Vec::with_capacity(K);
        traverse(&self.root, target, 0, &mut found, &filter);
        found
    }

    /// Remove the contact on the path of `id`, collapsing emptied subtrees
    /// upward.
    pub fn cut(&mut self, id: &Id) {
        if cut(&mut self.root, id, 0) {
            self.root = Slot::Empty;
        }
    }
}

fn put(slot: &mut Slot, contact: Contact, depth: usize) {
    if depth >= ID_BITS {
        // Exhausted bits: replace whatever is here.
        *slot = Slot::Leaf(contact);
        return;
    }

    match slot {
        Slot::Empty => *slot = Slot::Leaf(contact),

        Slot::Leaf(existing) if existing.id == contact.id => *slot = Slot::Leaf(contact),

        Slot::Leaf(existing) => {
            // Compression collision: branch out and re-seat both, which
            // descends until their bits diverge.
            let evicted = *existing;
            *slot = Slot::Branch {
                zero: Box::new(Slot::Empty),
                one: Box::new(Slot::Empty),
            };
            put(slot, evicted, depth);
            put(slot, contact, depth);
        }

        Slot::Branch { zero, one } => {
            let child = if contact.id.bit(depth) { one } else { zero };
            put(child, contact, depth + 1);
        }
    }
}

fn traverse(
    slot: &Slot,
    target: &Id,
    depth: usize,
    found: &mut Vec<Contact>,
    filter: &impl Fn(&Contact) -> bool,
) {
    match slot {
        Slot::Empty => {}

        Slot::Leaf(contact) => {
            if filter(contact) {
                found.push(*contact);
            }
        }

        Slot::Branch { zero, one } => {
            if found.len() >= K {
                return;
            }

            let (near, far) = if target.bit(depth) {
                (one, zero)
            } else {
                (zero, one)
            };

            traverse(near, target, depth + 1, found, filter);
            if found.len() >= K {
                return;
            }
            traverse(far, target, depth + 1, found, filter);
        }
    }
}

/// Returns true when this slot is now empty and should be removed by its
/// parent.
fn cut(slot: &mut Slot, id: &Id, depth: usize) -> bool {
    if depth >= ID_BITS {
        return true;
    }

    match slot {
        Slot::Empty => true,

        Slot::Leaf(_) => true,

        Slot::Branch { zero, one } => {
            let (chosen, other) = if id.bit(depth) {
                (one, zero)
            } else {
                (zero, one)
            };

            if cut(chosen, id, depth + 1) {
                **chosen = Slot::Empty;
                if matches!(**other, Slot::Empty) {
                    return true;
                }
            }

            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ID_SIZE;

    fn contact(id: Id) -> Contact {
        Contact {
            id,
            addr: "1.2.3.4:1234".parse().unwrap(),
        }
    }

    fn id_with_last_byte(b: u8) -> Id {
        let mut bytes = [0u8; ID_SIZE];
        bytes[19] = b;
        Id(bytes)
    }

    #[test]
    fn lookup_returns_closest_in_distance_order() {
        let mut trie = Trie::new();
        for i in 0..10 {
            trie.insert(contact(id_with_last_byte(i)));
        }

        for target in [id_with_last_byte(0x04), id_with_last_byte(0x07)] {
            let found = trie.lookup(&target);
            assert_eq!(found.len(), K);

            let distances: Vec<[u8; ID_SIZE]> =
                found.iter().map(|c| target.distance(&c.id)).collect();
            assert!(
                distances.windows(2).all(|w| w[0] <= w[1]),
                "distances not sorted for target {target}"
            );
        }
    }

    #[test]
    fn lookup_caps_at_k() {
        let mut trie = Trie::new();
        let inserted: Vec<Id> = (0..32).map(|_| Id::random()).collect();
        for id in &inserted {
            trie.insert(contact(*id));
        }

        let found = trie.lookup(&Id::random());
        assert_eq!(found.len(), K);
        for c in &found {
            assert!(inserted.contains(&c.id));
        }
    }

    #[test]
    fn insert_same_id_replaces() {
        let mut trie = Trie::new();
        let id = Id::random();

        trie.insert(contact(id));
        trie.insert(Contact {
            id,
            addr: "5.6.7.8:5678".parse().unwrap(),
        });

        let found = trie.lookup(&id);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addr, "5.6.7.8:5678".parse().unwrap());
    }

    #[test]
    fn cut_removes_and_collapses() {
        let mut trie = Trie::new();
        let ids: Vec<Id> = (0..10).map(id_with_last_byte).collect();
        for id in &ids {
            trie.insert(contact(*id));
        }

        trie.cut(&ids[3]);

        let found = trie.lookup(&ids[3]);
        assert!(found.iter().all(|c| c.id != ids[3]));
        assert_eq!(found.len(), K);
    }

    #[test]
    fn cut_last_contact_empties_trie() {
        let mut trie = Trie::new();
        let id = Id::random();
        trie.insert(contact(id));

        trie.cut(&id);
        assert!(trie.lookup(&id).is_empty());
    }

    #[test]
    fn cut_on_empty_trie_is_noop() {
        let mut trie = Trie::new();
        trie.cut(&Id::random());
        assert!(trie.lookup(&Id::random()).is_empty());
    }

    #[test]
    fn filtered_lookup_skips_rejected() {
        let mut trie = Trie::new();
        let ids: Vec<Id> = (0..4).map(id_with_last_byte).collect();
        for id in &ids {
            trie.insert(contact(*id));
        }

        let skip = ids[0];
        let found = trie.lookup_filtered(&ids[0], |c| c.id != skip);
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|c| c.id != skip));
    }
}
