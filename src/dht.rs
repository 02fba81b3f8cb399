//! The public node handle.

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;

use crate::common::{Datum, Id};
use crate::config::Config;
use crate::rpc::{read_loop, Actor, Command, KrpcSocket, QUEUE_DEPTH};
use crate::search::Search;
use crate::Result;

/// A running DHT node.
///
/// All state lives on a dedicated control thread; this handle submits work
/// over bounded queues and reads results from [Dht::peers]. The handle is
/// cheaply cloneable; only the original can join the control thread.
#[derive(Debug)]
pub struct Dht {
    command_tx: flume::Sender<Command>,
    peers_rx: flume::Receiver<PeerResult>,
    handle: Option<JoinHandle<()>>,

    id: Id,
    local_addr: SocketAddr,
    search_retry_period: Duration,
}

impl Clone for Dht {
    fn clone(&self) -> Dht {
        Dht {
            command_tx: self.command_tx.clone(),
            peers_rx: self.peers_rx.clone(),
            handle: None,
            id: self.id,
            local_addr: self.local_addr,
            search_retry_period: self.search_retry_period,
        }
    }
}

/// Information about a known node, as returned by
/// [Dht::list_reachable_nodes].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: Id,
    pub addr: SocketAddr,
}

/// A peer address identified for an infohash, delivered on the result
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerResult {
    /// The infohash the result pertains to.
    pub info_hash: Id,

    /// The peer's IP and port. This may differ from the advertising DHT
    /// node's port, as announces can nominate another one.
    pub addr: SocketAddr,
}

impl Dht {
    /// Create a new DHT node and start it.
    ///
    /// The only fatal construction error is failing to bind the UDP socket.
    pub fn new(config: Config) -> Result<Dht> {
        let id = config.node_id.unwrap_or_else(Id::random);

        let socket = KrpcSocket::bind(config.address)?;
        let local_addr = socket.local_addr();

        let (command_tx, command_rx) = flume::bounded(QUEUE_DEPTH);
        let (packet_tx, packet_rx) = flume::bounded(QUEUE_DEPTH);
        let (peers_tx, peers_rx) = flume::bounded(QUEUE_DEPTH);

        info!(?id, ?local_addr, "starting dht node");

        let reader_socket = socket.reader();
        let rate_limit = config.rate_limit;
        thread::spawn(move || read_loop::run(reader_socket, packet_tx, rate_limit));

        let search_retry_period = config.search_retry_period;
        let actor = Actor::new(config, id, socket, command_rx, packet_rx, peers_tx);
        let handle = thread::spawn(move || actor.run());

        Ok(Dht {
            command_tx,
            peers_rx,
            handle: Some(handle),
            id,
            local_addr,
            search_retry_period,
        })
    }

    // === Getters ===

    /// The local node ID.
    pub fn node_id(&self) -> Id {
        self.id
    }

    /// The bound UDP endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The result stream. Yields a [PeerResult] for every newly discovered
    /// peer and finishes when the node shuts down.
    pub fn peers(&self) -> Peers {
        Peers {
            receiver: self.peers_rx.clone(),
        }
    }

    // === Public Methods ===

    /// Soft-add a node. Call this with at least one node to bootstrap. The
    /// node ID is optional.
    pub fn add_node(&self, addr: SocketAddr, id: Option<Id>) {
        let _ = self.command_tx.send(Command::AddNode {
            addr,
            id,
            force: false,
        });
    }

    /// Add a node even when the routing table already holds enough.
    pub fn force_add_node(&self, addr: SocketAddr, id: Option<Id>) {
        let _ = self.command_tx.send(Command::AddNode {
            addr,
            id,
            force: true,
        });
    }

    /// Start a standing search for peers on `info_hash`. With `announce`
    /// set, this node signs itself up as a peer for the infohash.
    ///
    /// Results arrive on [Dht::peers]. The search re-issues itself every
    /// retry period until stopped or dropped.
    pub fn request_peers(&self, info_hash: Id, announce: bool) -> Search {
        Search::start(
            self.command_tx.clone(),
            info_hash,
            announce,
            self.search_retry_period,
        )
    }

    /// Store a datum in the network under its BEP-44 target.
    pub fn put_datum(&self, datum: Datum) {
        let _ = self.command_tx.send(Command::PutDatum { datum });
    }

    /// All known reachable nodes. Useful for saving the node database to
    /// persistent storage. Returns an empty list after shutdown.
    pub fn list_reachable_nodes(&self) -> Vec<NodeInfo> {
        let (reply_tx, reply_rx) = flume::bounded(1);

        if self
            .command_tx
            .send(Command::ListReachable { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }

        reply_rx.recv().unwrap_or_default()
    }

    /// Stop the node. Idempotent; calls issued after shutdown are no-ops.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    /// Wait for the control thread to finish. Only the handle returned by
    /// [Dht::new] can join; clones return immediately.
    pub fn block_until_shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocking iterator over the node's result stream. Ends when the node
/// shuts down.
#[derive(Debug, Clone)]
pub struct Peers {
    receiver: flume::Receiver<PeerResult>,
}

impl Peers {
    /// The next result, or `None` after `timeout` or shutdown.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PeerResult> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Iterator for Peers {
    type Item = PeerResult;

    fn next(&mut self) -> Option<PeerResult> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> Config {
        Config {
            address: "127.0.0.1:0".parse().unwrap(),
            rate_limit: -1,
            ..Config::default()
        }
    }

    #[test]
    fn starts_and_shuts_down() {
        let dht = Dht::new(test_config()).unwrap();

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            clone.shutdown();
        });

        dht.block_until_shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dht = Dht::new(test_config()).unwrap();

        dht.shutdown();
        dht.shutdown();
        dht.block_until_shutdown();
    }

    #[test]
    fn result_stream_closes_on_shutdown() {
        let dht = Dht::new(test_config()).unwrap();
        let mut peers = dht.peers();

        dht.shutdown();
        assert_eq!(peers.next(), None);
    }

    #[test]
    fn list_reachable_on_fresh_node_is_empty() {
        let dht = Dht::new(test_config()).unwrap();
        assert!(dht.list_reachable_nodes().is_empty());
        dht.shutdown();
    }

    #[test]
    fn two_nodes_learn_each_other() {
        let a = Dht::new(test_config()).unwrap();
        let b = Dht::new(test_config()).unwrap();

        a.add_node(b.local_addr(), None);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let known = a.list_reachable_nodes();
            if known.iter().any(|n| n.addr == b.local_addr()) {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "a never learned b's id; knows {known:?}"
            );
            thread::sleep(Duration::from_millis(20));
        }

        a.shutdown();
        b.shutdown();
    }
}
