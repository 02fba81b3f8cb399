//! Maintenance of the nodes closest to our own ID.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::common::trie::{Contact, K};
use crate::common::{Id, RoutingTable};

/// Tracks the routing table together with the K-closest boundary.
///
/// `boundary` is the current K-th closest known node to the local ID by XOR
/// distance; `proximity` is how many prefix bits it shares with us. A newly
/// responsive node displaces the boundary only when it strictly improves the
/// proximity.
#[derive(Debug)]
pub(crate) struct Neighbourhood {
    pub table: RoutingTable,

    local_id: Id,
    boundary: Option<Contact>,
    proximity: u32,
}

impl Neighbourhood {
    pub fn new(local_id: Id) -> Neighbourhood {
        Neighbourhood {
            table: RoutingTable::new(),
            local_id,
            boundary: None,
            proximity: 0,
        }
    }

    /// Remove a node, recomputing the boundary if it was the boundary node.
    pub fn remove(&mut self, addr: &SocketAddr) {
        let removed = self.table.remove(addr);

        if let (Some(removed), Some(boundary)) = (removed, &self.boundary) {
            if removed.id == Some(boundary.id) {
                self.reset_boundary();
            }
        }
    }

    /// Called when `contact` has just proven responsive. Displaces the
    /// boundary node iff the newcomer strictly improves the neighbourhood.
    pub fn upkeep(&mut self, contact: Contact) {
        if self.boundary.is_none() || self.table.len() < K {
            self.reset_boundary();
            return;
        }

        let cmp = self.local_id.common_bits(&contact.id);
        if cmp == 0 {
            // Not significantly closer than anything we hold.
            return;
        }

        if cmp > self.proximity {
            if let Some(boundary) = self.boundary {
                debug!(evicted = ?boundary.id, newcomer = ?contact.id, "displacing boundary node");
                self.remove(&boundary.addr);
            }
            self.reset_boundary();
        }
    }

    /// Walk all records, dropping expired nodes and collecting the addresses
    /// that are due for a ping.
    pub fn cleanup(&mut self, period: Duration) -> Vec<SocketAddr> {
        let mut expired = Vec::new();
        let mut to_ping = Vec::new();

        self.table.visit(|node| {
            if node.is_expired(period) {
                expired.push(node.addr);
            } else if node.needs_ping(period) {
                to_ping.push(node.addr);
            }
        });

        for addr in &expired {
            self.remove(addr);
        }

        if !expired.is_empty() || !to_ping.is_empty() {
            debug!(
                expired = expired.len(),
                to_ping = to_ping.len(),
                remaining = self.table.len(),
                "neighbourhood cleanup"
            );
        }

        to_ping
    }

    fn reset_boundary(&mut self) {
        self.proximity = 0;
        self.boundary = self.table.closest(&self.local_id).last().copied();
        if let Some(boundary) = &self.boundary {
            self.proximity = self.local_id.common_bits(&boundary.id);
        }
    }
}
