//! The address index of known nodes, composed with the routing trie.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::common::trie::{Contact, Trie};
use crate::common::{Id, Node};

/// Maps UDP addresses to node records and keeps the trie in step.
///
/// The address map is the sole owner of node records. A node joins the trie
/// only once its ID is known, so trie membership is always a subset of the
/// address map and every trie entry carries a valid ID.
#[derive(Debug, Default)]
pub(crate) struct RoutingTable {
    nodes: HashMap<SocketAddr, Node>,
    trie: Trie,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable {
            nodes: HashMap::new(),
            trie: Trie::new(),
        }
    }

    /// Look up a node by its UDP address.
    pub fn find(&self, addr: &SocketAddr) -> Option<&Node> {
        self.nodes.get(addr)
    }

    pub fn find_mut(&mut self, addr: &SocketAddr) -> Option<&mut Node> {
        self.nodes.get_mut(addr)
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Get or create the node at `addr`. The ID is optional and only used
    /// when the node is created. Returns whether a new record was inserted.
    pub fn node_or_insert(&mut self, id: Option<Id>, addr: SocketAddr) -> (&mut Node, bool) {
        match self.nodes.entry(addr) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                assert!(is_valid_address(&addr), "insert of invalid address {addr}");

                if let Some(id) = id {
                    self.trie.insert(Contact { id, addr });
                }

                (entry.insert(Node::new(addr, id)), true)
            }
        }
    }

    /// Admit the node at `addr` into the trie once its ID has become known.
    pub fn update(&mut self, addr: &SocketAddr) {
        if let Some(node) = self.nodes.get(addr) {
            if let Some(id) = node.id {
                self.trie.insert(Contact { id, addr: *addr });
            }
        }
    }

    /// Remove the node at `addr` from both indexes.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Node> {
        let node = self.nodes.remove(addr)?;
        if let Some(id) = node.id {
            self.trie.cut(&id);
        }
        Some(node)
    }

    /// Visit every node record.
    pub fn visit(&self, mut f: impl FnMut(&Node)) {
        for node in self.nodes.values() {
            f(node);
        }
    }

    /// The up-to-K closest known contacts to `target`.
    pub fn closest(&self, target: &Id) -> Vec<Contact> {
        self.trie.lookup(target)
    }

    /// The up-to-K closest contacts whose node records pass `filter`.
    pub fn closest_filtered(&self, target: &Id, filter: impl Fn(&Node) -> bool) -> Vec<Contact> {
        self.trie.lookup_filtered(target, |contact| {
            self.nodes.get(&contact.addr).is_some_and(&filter)
        })
    }
}

pub(crate) fn is_valid_address(addr: &SocketAddr) -> bool {
    !addr.ip().is_unspecified() && addr.port() != 0
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(i: u8) -> SocketAddr {
        format!("1.2.3.{i}:1234").parse().unwrap()
    }

    #[test]
    fn get_or_create_by_address() {
        let mut table = RoutingTable::new();

        let (_, inserted) = table.node_or_insert(Some(Id::random()), addr(1));
        assert!(inserted);

        let (_, inserted) = table.node_or_insert(None, addr(1));
        assert!(!inserted);

        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_id_stays_out_of_trie() {
        let mut table = RoutingTable::new();
        let target = Id::random();

        table.node_or_insert(None, addr(1));
        assert!(table.closest(&target).is_empty());

        // Once the ID is learned, update admits the node.
        let id = Id::random();
        table.find_mut(&addr(1)).unwrap().id = Some(id);
        table.update(&addr(1));

        let closest = table.closest(&target);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, id);
    }

    #[test]
    fn trie_members_resolve_through_address_map() {
        let mut table = RoutingTable::new();
        for i in 1..30 {
            table.node_or_insert(Some(Id::random()), addr(i));
        }

        for contact in table.closest(&Id::random()) {
            let node = table.find(&contact.addr).expect("trie member not indexed");
            assert_eq!(node.id, Some(contact.id));
            assert_eq!(node.addr, contact.addr);
        }
    }

    #[test]
    fn remove_cuts_both_indexes() {
        let mut table = RoutingTable::new();
        let id = Id::random();
        table.node_or_insert(Some(id), addr(1));

        table.remove(&addr(1));

        assert!(table.find(&addr(1)).is_none());
        assert!(table.closest(&id).is_empty());
    }

    #[test]
    #[should_panic(expected = "invalid address")]
    fn rejects_unspecified_address() {
        let mut table = RoutingTable::new();
        table.node_or_insert(None, "0.0.0.0:1234".parse().unwrap());
    }
}
