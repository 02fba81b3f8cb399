//! Server side of the six KRPC methods.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::common::datum::{mutable_target, Datum, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::common::{datum, Id};
use crate::dht::PeerResult;
use crate::messages::{
    form_node_list, form_peer_list, AnnouncePeerArgs, AnnouncePeerResponse, Args, FindNodeArgs,
    FindNodeResponse, GetArgs, GetPeersArgs, GetPeersResponse, GetResponse, NodeLocator,
    PutArgs, PutResponse, Response, ERR_BAD_SIGNATURE, ERR_BAD_TOKEN, ERR_CAS_MISMATCH,
    ERR_SALT_TOO_LARGE, ERR_SEQ_ROLLBACK, ERR_VALUE_TOO_LARGE,
};

use super::Actor;

/// Largest accepted `put` value, per BEP-44.
const MAX_PUT_VALUE: usize = 1000;

/// Largest accepted `put` salt, per BEP-44.
const MAX_PUT_SALT: usize = 64;

impl Actor {
    pub(super) fn handle_query(&mut self, from: SocketAddr, transaction_id: &[u8], args: Args) {
        if args.node_id() == self.id {
            trace!(?from, "rx ignore (claims our id)");
            return;
        }

        // Make sure the peer exists so we can track its responses.
        if self.neighbourhood.table.find(&from).is_none() && self.accept_more_nodes() {
            self.probe(from, Some(args.node_id()));
        }

        match args {
            Args::Ping(_) => self.ping_query(from, transaction_id),
            Args::FindNode(args) => self.find_node_query(from, transaction_id, args),
            Args::GetPeers(args) => self.get_peers_query(from, transaction_id, args),
            Args::AnnouncePeer(args) => self.announce_peer_query(from, transaction_id, args),
            Args::Get(args) => self.get_query(from, transaction_id, args),
            Args::Put(args) => self.put_query(from, transaction_id, args),
        }
    }

    fn ping_query(&mut self, from: SocketAddr, transaction_id: &[u8]) {
        self.respond(
            from,
            transaction_id,
            Response::Ping(crate::messages::PingResponse { id: self.id }),
        );
    }

    fn find_node_query(&mut self, from: SocketAddr, transaction_id: &[u8], args: FindNodeArgs) {
        let locators = self.closest_locators(&args.target);
        let (nodes, nodes6) = form_node_list(&locators, args.want.as_deref(), &from);

        self.respond(
            from,
            transaction_id,
            Response::FindNode(FindNodeResponse {
                id: self.id,
                nodes,
                nodes6,
            }),
        );
    }

    fn get_peers_query(&mut self, from: SocketAddr, transaction_id: &[u8], args: GetPeersArgs) {
        let token = ByteBuf::from(self.token_store.generate(&from));

        let peers = self.peer_store.values(&args.info_hash);
        let response = if peers.is_empty() {
            let locators = self.closest_locators(&args.info_hash);
            let (nodes, nodes6) = form_node_list(&locators, args.want.as_deref(), &from);

            GetPeersResponse {
                id: self.id,
                token,
                nodes,
                nodes6,
                values: None,
            }
        } else {
            GetPeersResponse {
                id: self.id,
                token,
                nodes: None,
                nodes6: None,
                values: Some(form_peer_list(&peers, args.want.as_deref(), &from)),
            }
        };

        self.respond(from, transaction_id, Response::GetPeers(response));
    }

    fn announce_peer_query(
        &mut self,
        from: SocketAddr,
        transaction_id: &[u8],
        args: AnnouncePeerArgs,
    ) {
        if self.token_store.verify(&args.token, &from) {
            let mut peer_addr = from;
            if args.implied_port.unwrap_or(0) == 0 {
                peer_addr.set_port(args.port);
            }

            self.peer_store.add(args.info_hash, peer_addr);

            // Backdate the announcer so it is immediately re-eligible for
            // contact about this infohash.
            self.touch_backdated(from, args.id);

            if self.locally_interested.contains(&args.info_hash) {
                let _ = self.peers_tx.send(PeerResult {
                    info_hash: args.info_hash,
                    addr: from,
                });
            }
        } else {
            trace!(?from, "announce with bad token");
        }

        // Reply positively whether or not the token verified; a failed
        // announce simply has no effect.
        self.respond(
            from,
            transaction_id,
            Response::AnnouncePeer(AnnouncePeerResponse { id: self.id }),
        );
    }

    fn get_query(&mut self, from: SocketAddr, transaction_id: &[u8], args: GetArgs) {
        let token = ByteBuf::from(self.token_store.generate(&from));

        let want_all = ["n4".to_string(), "n6".to_string()];
        let locators = self.closest_locators(&args.target);
        let (nodes, nodes6) = form_node_list(&locators, Some(want_all.as_slice()), &from);

        let mut response = GetResponse {
            id: self.id,
            token,
            nodes,
            nodes6,
            value: None,
            key: None,
            signature: None,
            seq: None,
        };

        if let Some(datum) = self.peer_store.datum(&args.target) {
            response.value = Some(ByteBuf::from(datum.value.to_vec()));
            if datum.is_mutable() {
                response.key = datum.key.map(|k| ByteBuf::from(k.to_vec()));
                response.signature = datum.signature.map(|s| ByteBuf::from(s.to_vec()));
                response.seq = Some(datum.seq);
            }
        }

        self.respond(from, transaction_id, Response::Get(response));
    }

    fn put_query(&mut self, from: SocketAddr, transaction_id: &[u8], args: PutArgs) {
        if !self.token_store.verify(&args.token, &from) {
            self.respond_error(from, transaction_id, ERR_BAD_TOKEN);
            return;
        }

        if args.value.len() > MAX_PUT_VALUE {
            self.respond_error(from, transaction_id, ERR_VALUE_TOO_LARGE);
            return;
        }

        if args.salt.as_ref().is_some_and(|salt| salt.len() > MAX_PUT_SALT) {
            self.respond_error(from, transaction_id, ERR_SALT_TOO_LARGE);
            return;
        }

        let PutArgs {
            id,
            value,
            key,
            signature,
            salt,
            seq,
            cas,
            ..
        } = args;

        match key {
            // The immutable case is simple: content-addressed storage.
            None => {
                let value = Bytes::from(value.into_vec());
                let target = datum::immutable_target(&value);
                self.peer_store.add_datum(target, Datum::immutable(value));
            }

            Some(key) => {
                let Ok(key) = <[u8; PUBLIC_KEY_SIZE]>::try_from(key.as_slice()) else {
                    self.respond_error(from, transaction_id, ERR_BAD_SIGNATURE);
                    return;
                };

                let Some(Ok(signature)) = signature
                    .as_ref()
                    .map(|sig| <[u8; SIGNATURE_SIZE]>::try_from(sig.as_slice()))
                else {
                    self.respond_error(from, transaction_id, ERR_BAD_SIGNATURE);
                    return;
                };

                let seq = seq.unwrap_or(0);
                let salt = salt.map(|salt| Bytes::from(salt.into_vec()));

                // Mutable data is addressed by the raw public key plus salt,
                // unlike the bencoded-value hash of the immutable case.
                let target = mutable_target(&key, salt.as_deref());

                if let Some(old) = self.peer_store.datum(&target) {
                    if old.seq >= seq {
                        self.respond_error(from, transaction_id, ERR_SEQ_ROLLBACK);
                        return;
                    }

                    if cas.is_some_and(|cas| cas != old.seq) {
                        self.respond_error(from, transaction_id, ERR_CAS_MISMATCH);
                        return;
                    }
                }

                let datum = Datum {
                    value: Bytes::from(value.into_vec()),
                    key: Some(key),
                    salt,
                    signature: Some(signature),
                    seq,
                };

                if !datum.verify() {
                    self.respond_error(from, transaction_id, ERR_BAD_SIGNATURE);
                    return;
                }

                self.peer_store.add_datum(target, datum);
            }
        }

        self.touch_backdated(from, id);

        self.respond(
            from,
            transaction_id,
            Response::Put(PutResponse { id: self.id }),
        );
    }

    // === Helpers ===

    fn closest_locators(&self, target: &Id) -> Vec<NodeLocator> {
        self.neighbourhood
            .table
            .closest(target)
            .into_iter()
            .map(|contact| NodeLocator {
                id: contact.id,
                addr: contact.addr,
            })
            .collect()
    }

    /// Get or create the node and set `last_rx` to one retry period in the
    /// past, making it immediately re-eligible for peer requests.
    fn touch_backdated(&mut self, addr: SocketAddr, id: Id) {
        let retry = self.config.search_retry_period;
        let (node, _) = self.neighbourhood.table.node_or_insert(Some(id), addr);

        let now = Instant::now();
        node.last_rx = Some(now.checked_sub(retry).unwrap_or(now));
    }

    fn respond(&mut self, addr: SocketAddr, transaction_id: &[u8], response: Response) {
        if let Err(error) = self.socket.send_response(addr, transaction_id, &response) {
            debug!(?error, ?addr, "tx response failure");
        }
    }

    fn respond_error(&mut self, addr: SocketAddr, transaction_id: &[u8], error: (i64, &str)) {
        debug!(?addr, code = error.0, reason = error.1, "rejecting put");
        if let Err(error) = self.socket.send_error(addr, transaction_id, error) {
            debug!(?error, ?addr, "tx error failure");
        }
    }
}
