//! The control loop: a single-owner reactor multiplexing every input.
//!
//! Exactly one actor thread owns all mutable core state. Client commands,
//! decoded packets, unreachable notices, internal recursion and ping hints,
//! and the two periodic duties all funnel through one blocking multiplexed
//! wait; each input is fully dispatched before the next is taken.

mod handle_query;
mod handle_response;
pub(crate) mod read_loop;
mod socket;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::common::{is_valid_address, Contact, Datum, Id, Neighbourhood, PendingQuery};
use crate::config::Config;
use crate::dht::{NodeInfo, PeerResult};
use crate::messages::{
    AnnouncePeerArgs, Args, FindNodeArgs, GetArgs, GetPeersArgs, Message, MessageKind, NodeLocator,
    PingArgs, PutArgs,
};
use crate::server::{PeerStore, TokenStore};

pub(crate) use socket::KrpcSocket;

/// Depth of every bounded queue feeding or leaving the control loop.
pub(crate) const QUEUE_DEPTH: usize = 10;

/// Head start subtracted from the cleanup period when pacing the ping
/// backlog, so the last ping lands before the next cleanup.
const SLOW_PING_HEADROOM: Duration = Duration::from_secs(60);

/// A request submitted to the control loop by the client side.
pub(crate) enum Command {
    AddNode {
        addr: SocketAddr,
        id: Option<Id>,
        force: bool,
    },
    RequestPeers {
        info_hash: Id,
        announce: bool,
    },
    PutDatum {
        datum: Datum,
    },
    ListReachable {
        reply: flume::Sender<Vec<NodeInfo>>,
    },
    Shutdown,
}

enum Event {
    Command(Command),
    Packet((Message, SocketAddr)),
    Unreachable(SocketAddr),
    Recurse(Id),
    Ping(SocketAddr),
}

pub(crate) struct Actor {
    config: Config,
    id: Id,
    socket: KrpcSocket,

    neighbourhood: Neighbourhood,
    peer_store: PeerStore,
    token_store: TokenStore,

    /// Infohashes we announce ourselves as a peer for.
    locally_originated: HashSet<Id>,
    /// Infohashes the client wants peers for.
    locally_interested: HashSet<Id>,
    /// Data the client asked us to store in the network, by target.
    local_data: HashMap<Id, Datum>,

    /// The `want` list attached to outgoing queries, when configured to
    /// ask for both address families.
    want: Option<Vec<String>>,

    command_rx: flume::Receiver<Command>,
    packet_rx: flume::Receiver<(Message, SocketAddr)>,
    peers_tx: flume::Sender<PeerResult>,

    unreachable_tx: flume::Sender<SocketAddr>,
    unreachable_rx: flume::Receiver<SocketAddr>,
    recurse_tx: flume::Sender<Id>,
    recurse_rx: flume::Receiver<Id>,
    ping_tx: flume::Sender<SocketAddr>,
    ping_rx: flume::Receiver<SocketAddr>,

    next_cleanup: Instant,
    next_token_rotate: Instant,
}

impl Actor {
    pub fn new(
        config: Config,
        id: Id,
        socket: KrpcSocket,
        command_rx: flume::Receiver<Command>,
        packet_rx: flume::Receiver<(Message, SocketAddr)>,
        peers_tx: flume::Sender<PeerResult>,
    ) -> Actor {
        let (unreachable_tx, unreachable_rx) = flume::bounded(QUEUE_DEPTH);
        let (recurse_tx, recurse_rx) = flume::bounded(QUEUE_DEPTH);
        let (ping_tx, ping_rx) = flume::bounded(QUEUE_DEPTH);

        let want = config
            .any_peer_af
            .then(|| vec!["n4".to_string(), "n6".to_string()]);

        let now = Instant::now();

        Actor {
            neighbourhood: Neighbourhood::new(id),
            peer_store: PeerStore::new(config.max_info_hashes, config.max_info_hash_peers),
            token_store: TokenStore::new(),
            locally_originated: HashSet::new(),
            locally_interested: HashSet::new(),
            local_data: HashMap::new(),
            want,
            command_rx,
            packet_rx,
            peers_tx,
            unreachable_tx,
            unreachable_rx,
            recurse_tx,
            recurse_rx,
            ping_tx,
            ping_rx,
            next_cleanup: now + config.cleanup_period,
            next_token_rotate: now + config.token_rotate_period,
            config,
            id,
            socket,
        }
    }

    /// Run until shutdown. Returning drops the packet receiver, which ends
    /// the read loop, and drops the result stream sender, which tells the
    /// client that no more results will arrive.
    pub fn run(mut self) {
        debug!(id = ?self.id, addr = ?self.socket.local_addr(), "control loop starting");

        loop {
            let now = Instant::now();
            if now >= self.next_cleanup {
                self.cleanup();
                self.next_cleanup = now + self.config.cleanup_period;
            }
            if now >= self.next_token_rotate {
                self.token_store.cycle();
                self.next_token_rotate = now + self.config.token_rotate_period;
            }

            let deadline = self.next_cleanup.min(self.next_token_rotate);
            let timeout = deadline.saturating_duration_since(Instant::now());

            let event = flume::Selector::new()
                .recv(&self.command_rx, |r| r.ok().map(Event::Command))
                .recv(&self.packet_rx, |r| r.ok().map(Event::Packet))
                .recv(&self.unreachable_rx, |r| r.ok().map(Event::Unreachable))
                .recv(&self.recurse_rx, |r| r.ok().map(Event::Recurse))
                .recv(&self.ping_rx, |r| r.ok().map(Event::Ping))
                .wait_timeout(timeout);

            match event {
                Ok(Some(Event::Command(Command::Shutdown))) | Ok(None) => {
                    debug!(id = ?self.id, "control loop stopping");
                    return;
                }
                Ok(Some(event)) => self.dispatch(event),
                // Deadline reached; periodic duties run at the loop top.
                Err(_) => {}
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Command(Command::AddNode { addr, id, force }) => self.add_node(addr, id, force),
            Event::Command(Command::RequestPeers {
                info_hash,
                announce,
            }) => self.request_peers(info_hash, announce),
            Event::Command(Command::PutDatum { datum }) => self.put_datum(datum),
            Event::Command(Command::ListReachable { reply }) => {
                let _ = reply.send(self.reachable_nodes());
            }
            Event::Command(Command::Shutdown) => unreachable!("handled in run"),

            Event::Packet((message, from)) => self.handle_packet(message, from),
            Event::Unreachable(addr) => self.addr_unreachable(addr),
            Event::Recurse(id) => self.recurse_node(id),
            Event::Ping(addr) => self.ping_known(addr),
        }
    }

    fn handle_packet(&mut self, message: Message, from: SocketAddr) {
        match message.kind {
            MessageKind::Query { args, .. } => {
                self.handle_query(from, &message.transaction_id, args)
            }
            MessageKind::Response { raw } => {
                self.handle_response(from, &message.transaction_id, raw)
            }
            MessageKind::Error { code, message: text } => {
                debug!(code, text, ?from, "rx error frame");
            }
        }
    }

    // === Client commands ===

    /// Add the node and ping it if it was not already known. The ID is
    /// optional.
    fn add_node(&mut self, addr: SocketAddr, id: Option<Id>, force: bool) {
        if !is_valid_address(&addr) {
            debug!(?addr, "add_node with invalid address");
            return;
        }

        if self.neighbourhood.table.find(&addr).is_some() {
            return;
        }

        if self.accept_more_nodes() || force {
            self.neighbourhood.table.node_or_insert(id, addr);
            self.tx_ping(addr);
        }
    }

    fn request_peers(&mut self, info_hash: Id, announce: bool) {
        if announce {
            self.locally_originated.insert(info_hash);
        }
        self.locally_interested.insert(info_hash);

        if self.need_more_peers(&info_hash) {
            for contact in self.closest_eligible(&info_hash) {
                self.request_peers_from(contact.addr, info_hash);
            }
        }
    }

    /// Store a datum in the network: remember it by target and issue `get`
    /// toward the closest nodes; each tokened `get` response triggers the
    /// actual `put`.
    fn put_datum(&mut self, datum: Datum) {
        let target = datum.target();
        self.local_data.insert(target, datum);

        for contact in self.closest_eligible(&target) {
            self.tx_get(contact.addr, target);
            self.mark_contacted(contact.addr, target);
        }
    }

    fn reachable_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = Vec::new();
        self.neighbourhood.table.visit(|node| {
            if let (Some(id), true) = (node.id, node.is_reachable()) {
                nodes.push(NodeInfo {
                    id,
                    addr: node.addr,
                });
            }
        });
        nodes
    }

    // === Internal events ===

    /// Recurse toward a newly learned node ID with `find_node`.
    fn recurse_node(&mut self, target: Id) {
        for contact in self.closest_eligible(&target) {
            self.tx_find_node(contact.addr, target);
            self.mark_contacted(contact.addr, target);
        }
    }

    fn ping_known(&mut self, addr: SocketAddr) {
        // The node may have expired since the ping was scheduled.
        if self.neighbourhood.table.find(&addr).is_some() {
            self.tx_ping(addr);
        }
    }

    fn addr_unreachable(&mut self, addr: SocketAddr) {
        if let Some(node) = self.neighbourhood.table.find_mut(&addr) {
            debug!(?addr, "marking node unreachable");
            node.last_rx = None;
        }
    }

    /// Walk the neighbourhood and drain the resulting ping backlog at an
    /// even pace from a helper thread.
    fn cleanup(&mut self) {
        let to_ping = self.neighbourhood.cleanup(self.config.cleanup_period);
        if to_ping.is_empty() {
            return;
        }

        let ping_tx = self.ping_tx.clone();
        let period = self.config.cleanup_period;
        thread::spawn(move || slow_ping_loop(ping_tx, to_ping, period));
    }

    // === Node bookkeeping ===

    /// Ensure a node record exists for `addr` and probe it with a ping.
    fn probe(&mut self, addr: SocketAddr, id: Option<Id>) {
        if !is_valid_address(&addr) {
            return;
        }

        self.neighbourhood.table.node_or_insert(id, addr);
        self.tx_ping(addr);
    }

    /// Digest a compact node list from `origin`, inserting unknown nodes
    /// and scheduling follow-up work for them.
    fn received_nodes(&mut self, locators: &[NodeLocator], origin: SocketAddr) {
        for locator in locators {
            if locator.id == self.id {
                // A reference to ourselves.
                continue;
            }
            if locator.addr == origin {
                // Self-promotion.
                continue;
            }
            if !is_valid_address(&locator.addr) {
                continue;
            }

            let (_, inserted) = self
                .neighbourhood
                .table
                .node_or_insert(Some(locator.id), locator.addr);
            if !inserted {
                continue;
            }

            if self.need_more_nodes() {
                // Queue full is fine: the node is in the routing table and
                // will be picked up by later selection.
                let _ = self.recurse_tx.try_send(locator.id);
            }

            self.request_more_peers(locator.addr);
        }
    }

    /// Ask a freshly learned node about every infohash we still want peers
    /// for.
    fn request_more_peers(&mut self, addr: SocketAddr) {
        let interested: Vec<Id> = self.locally_interested.iter().copied().collect();

        for info_hash in interested {
            if self.need_more_peers(&info_hash) {
                self.request_peers_from(addr, info_hash);
            }
        }
    }

    fn request_peers_from(&mut self, addr: SocketAddr, info_hash: Id) {
        self.tx_get_peers(addr, info_hash);
        self.mark_contacted(addr, info_hash);
    }

    fn mark_contacted(&mut self, addr: SocketAddr, info_hash: Id) {
        if let Some(node) = self.neighbourhood.table.find_mut(&addr) {
            node.mark_contacted(info_hash);
        }
    }

    /// The closest known nodes worth querying about `target`: ID known, not
    /// saturated with pending queries, not asked about it recently.
    fn closest_eligible(&self, target: &Id) -> Vec<Contact> {
        let max_pending = self.config.max_pending_queries;
        let retry = self.config.search_retry_period;

        self.neighbourhood.table.closest_filtered(target, |node| {
            node.id.is_some()
                && node.pending_queries.len() < max_pending
                && !node.was_contacted_recently(target, retry)
        })
    }

    fn need_more_nodes(&self) -> bool {
        let num = self.neighbourhood.table.len();
        num < self.config.min_nodes || num * 2 < self.config.max_nodes
    }

    fn accept_more_nodes(&self) -> bool {
        self.neighbourhood.table.len() < self.config.max_nodes
    }

    fn need_more_peers(&self, info_hash: &Id) -> bool {
        self.peer_store.count(info_hash) < self.config.num_target_peers
    }

    // === Outgoing queries ===

    fn tx_ping(&mut self, addr: SocketAddr) {
        self.tx_query(addr, Args::Ping(PingArgs { id: self.id }));
    }

    fn tx_find_node(&mut self, addr: SocketAddr, target: Id) {
        let want = self.want.clone();
        self.tx_query(
            addr,
            Args::FindNode(FindNodeArgs {
                id: self.id,
                target,
                want,
            }),
        );
    }

    fn tx_get_peers(&mut self, addr: SocketAddr, info_hash: Id) {
        let want = self.want.clone();
        self.tx_query(
            addr,
            Args::GetPeers(GetPeersArgs {
                id: self.id,
                info_hash,
                want,
            }),
        );
    }

    fn tx_get(&mut self, addr: SocketAddr, target: Id) {
        self.tx_query(
            addr,
            Args::Get(GetArgs {
                id: self.id,
                target,
                seq: None,
            }),
        );
    }

    fn tx_announce_peer(&mut self, addr: SocketAddr, info_hash: Id, token: ByteBuf) {
        self.tx_query(
            addr,
            Args::AnnouncePeer(AnnouncePeerArgs {
                id: self.id,
                info_hash,
                port: 0,
                token,
                implied_port: Some(1),
            }),
        );
    }

    fn tx_put(&mut self, addr: SocketAddr, token: ByteBuf, datum: &Datum) {
        self.tx_query(
            addr,
            Args::Put(PutArgs {
                id: self.id,
                token,
                value: ByteBuf::from(datum.value.to_vec()),
                key: datum.key.map(|k| ByteBuf::from(k.to_vec())),
                signature: datum.signature.map(|s| ByteBuf::from(s.to_vec())),
                salt: datum.salt.as_ref().map(|s| ByteBuf::from(s.to_vec())),
                seq: datum.is_mutable().then_some(datum.seq),
                cas: None,
            }),
        );
    }

    /// Record the pending query on the destination node, then transmit.
    fn tx_query(&mut self, addr: SocketAddr, args: Args) {
        let tid = self.socket.tid();

        match self.neighbourhood.table.find_mut(&addr) {
            Some(node) => {
                node.pending_queries.insert(
                    tid.to_vec(),
                    PendingQuery {
                        method: args.method(),
                        args: args.clone(),
                    },
                );
            }
            None => {
                trace!(?addr, "tx query to unknown node");
                return;
            }
        }

        match self.socket.send_query(addr, &tid, &args) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                // Port unreachable: queue the notice, dropped if full.
                let _ = self.unreachable_tx.try_send(addr);
            }
            Err(error) => {
                debug!(?error, ?addr, "tx failure");
            }
        }
    }
}

/// Drains the ping backlog at an even pace over most of a cleanup period.
/// Runs in its own short-lived thread; exits early once the control loop is
/// gone.
fn slow_ping_loop(
    ping_tx: flume::Sender<SocketAddr>,
    nodes: Vec<SocketAddr>,
    cleanup_period: Duration,
) {
    let duration = cleanup_period.saturating_sub(SLOW_PING_HEADROOM);
    let per_ping_wait = duration / nodes.len() as u32;

    for addr in nodes {
        if ping_tx.send(addr).is_err() {
            return;
        }

        thread::sleep(per_ping_wait);
    }
}
