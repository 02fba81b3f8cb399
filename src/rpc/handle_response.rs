//! Response correlation and dispatch.

use std::net::SocketAddr;
use std::time::Instant;

use serde_bencode::value::Value;
use tracing::{debug, trace};

use crate::common::{Contact, PendingQuery};
use crate::dht::PeerResult;
use crate::messages::{Args, GetPeersResponse, GetResponse, Response};
use crate::security;

use super::Actor;

impl Actor {
    pub(super) fn handle_response(&mut self, from: SocketAddr, transaction_id: &[u8], raw: Value) {
        if self.neighbourhood.table.find(&from).is_none() {
            // This can't be a valid response if we don't even know the node.
            trace!(?from, "rx response from unknown node");
            if self.accept_more_nodes() {
                self.probe(from, None);
            }
            return;
        }

        // Correlate against the node's pending queries; the recorded entry
        // is consumed so duplicate responses fall through.
        let Some(pending) = self
            .neighbourhood
            .table
            .find_mut(&from)
            .and_then(|node| node.pending_queries.remove(transaction_id))
        else {
            trace!(?from, "rx ignore (unknown transaction)");
            return;
        };

        // Only now can the schemaless body be typed, using the method the
        // transaction was created with.
        let response = match Response::decode(pending.method, &raw) {
            Ok(response) => response,
            Err(error) => {
                debug!(?error, ?from, method = pending.method.as_str(), "rx bad response body");
                return;
            }
        };

        let node_id = response.node_id();
        if node_id == self.id {
            trace!(?from, "rx ignore (claims our id)");
            return;
        }

        let mut adopted = false;
        if let Some(node) = self.neighbourhood.table.find_mut(&from) {
            match node.id {
                None => {
                    // We didn't have the node ID yet; set it. Membership is
                    // not gated on the BEP-42 check, only noted.
                    let ip = from.ip();
                    if !security::node_id_is_allowed(&ip, &node_id) {
                        debug!(?from, id = ?node_id, "node id does not conform to its ip");
                    }

                    node.id = Some(node_id);
                    adopted = true;
                }
                Some(existing) if existing != node_id => {
                    // Identity collision: keep the known ID, drop the
                    // message and schedule a ping to sort the node out.
                    debug!(?from, ?existing, claimed = ?node_id, "node changed its id");
                    let _ = self.ping_tx.try_send(from);
                    return;
                }
                Some(_) => {}
            }

            node.last_rx = Some(Instant::now());
        }

        if adopted {
            self.neighbourhood.table.update(&from);
        }

        self.neighbourhood.upkeep(Contact {
            id: node_id,
            addr: from,
        });

        if self.need_more_nodes() {
            // Lossy by design; the node stays in the table regardless.
            let _ = self.recurse_tx.try_send(node_id);
        }

        match response {
            // Reachability bookkeeping above is all these need.
            Response::Ping(_) | Response::AnnouncePeer(_) | Response::Put(_) => {}

            Response::FindNode(r) => {
                if let Some(nodes) = r.nodes {
                    self.received_nodes(&nodes.0, from);
                }
                if let Some(nodes6) = r.nodes6 {
                    self.received_nodes(&nodes6.0, from);
                }
            }

            Response::GetPeers(r) => self.get_peers_response(from, pending, r),

            Response::Get(r) => self.get_response(from, pending, r),
        }
    }

    /// A `get_peers` response: return found peers to the client, announce
    /// ourselves where applicable, and chase the returned closer nodes.
    fn get_peers_response(
        &mut self,
        from: SocketAddr,
        pending: PendingQuery,
        response: GetPeersResponse,
    ) {
        let Args::GetPeers(query) = pending.args else {
            debug!(?from, "get_peers response to a different query");
            return;
        };
        let info_hash = query.info_hash;

        if self.locally_originated.contains(&info_hash) {
            self.tx_announce_peer(from, info_hash, response.token.clone());
        }

        if let Some(values) = &response.values {
            for endpoint in values {
                if self.peer_store.add(info_hash, endpoint.0) {
                    // Newly discovered peer: put it on the result stream.
                    let _ = self.peers_tx.send(PeerResult {
                        info_hash,
                        addr: endpoint.0,
                    });
                }
            }
        }

        if let Some(nodes) = response.nodes {
            self.received_nodes(&nodes.0, from);
        }
        if let Some(nodes6) = response.nodes6 {
            self.received_nodes(&nodes6.0, from);
        }
    }

    /// A `get` response carries the token needed to `put` data we
    /// originated toward its target.
    fn get_response(&mut self, from: SocketAddr, pending: PendingQuery, response: GetResponse) {
        let Args::Get(query) = pending.args else {
            debug!(?from, "get response to a different query");
            return;
        };

        if let Some(datum) = self.local_data.get(&query.target).cloned() {
            self.tx_put(from, response.token.clone(), &datum);
        }
    }
}
