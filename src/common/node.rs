//! A known node in the DHT and its liveness bookkeeping.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Id;
use crate::messages::{Args, Method};

/// Grace allowed on top of two cleanup periods before a silent node expires.
const EXPIRY_GRACE: Duration = Duration::from_secs(60);

/// An unreachable node with more unanswered queries than this is expired.
const MAX_UNANSWERED_QUERIES: usize = 2;

/// An outgoing query awaiting its response, recorded under its transaction id.
/// The recorded method is what types the otherwise schemaless response body.
#[derive(Debug, Clone)]
pub(crate) struct PendingQuery {
    pub method: Method,
    pub args: Args,
}

/// A known node. The node ID may be unknown until the node first responds.
pub(crate) struct Node {
    pub addr: SocketAddr,
    pub id: Option<Id>,

    /// Time of the last message received from this node. `None` means the
    /// node has never been heard from.
    pub last_rx: Option<Instant>,

    /// Outgoing queries for which we are awaiting a response.
    pub pending_queries: HashMap<Vec<u8>, PendingQuery>,

    /// When each infohash was last requested from this node.
    pub past_queries: HashMap<Id, Instant>,
}

impl Node {
    pub fn new(addr: SocketAddr, id: Option<Id>) -> Node {
        Node {
            addr,
            id,
            last_rx: None,
            pending_queries: HashMap::new(),
            past_queries: HashMap::new(),
        }
    }

    /// A node is reachable once anything has been received from it.
    pub fn is_reachable(&self) -> bool {
        self.last_rx.is_some()
    }

    /// True iff the node is due for expiry, either because of unanswered
    /// queries or because it has not been heard from for too long.
    pub fn is_expired(&self, cleanup_period: Duration) -> bool {
        if !self.is_reachable() && self.pending_queries.len() > MAX_UNANSWERED_QUERIES {
            return true;
        }

        match self.last_rx {
            Some(at) => at.elapsed() > cleanup_period * 2 + EXPIRY_GRACE,
            None => true,
        }
    }

    /// True iff the node is due for a ping. Only meaningful for nodes that
    /// are not expired.
    pub fn needs_ping(&self, cleanup_period: Duration) -> bool {
        if !self.is_reachable() || self.pending_queries.is_empty() {
            return true;
        }

        match self.last_rx {
            Some(at) => at.elapsed() >= cleanup_period / 2,
            None => true,
        }
    }

    /// True iff this node was asked about `info_hash` within the last
    /// `retry_period`, and should therefore be skipped for now.
    pub fn was_contacted_recently(&self, info_hash: &Id, retry_period: Duration) -> bool {
        self.past_queries
            .get(info_hash)
            .is_some_and(|at| at.elapsed() <= retry_period)
    }

    pub fn mark_contacted(&mut self, info_hash: Id) {
        self.past_queries.insert(info_hash, Instant::now());
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("reachable", &self.is_reachable())
            .field("pending", &self.pending_queries.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::PingArgs;

    fn test_node() -> Node {
        Node::new("1.2.3.4:1234".parse().unwrap(), Some(Id::random()))
    }

    fn pending(node: &mut Node, tid: u8) {
        node.pending_queries.insert(
            vec![tid, 0, 0, 0],
            PendingQuery {
                method: Method::Ping,
                args: Args::Ping(PingArgs { id: Id::random() }),
            },
        );
    }

    #[test]
    fn never_heard_from_is_expired() {
        let node = test_node();
        assert!(!node.is_reachable());
        assert!(node.is_expired(Duration::from_secs(900)));
    }

    #[test]
    fn expiry_by_unanswered_queries() {
        let mut node = test_node();
        node.last_rx = Some(Instant::now());
        for tid in 0..3 {
            pending(&mut node, tid);
        }

        // Reachable, so the pending-query rule does not apply yet.
        assert!(!node.is_expired(Duration::from_secs(900)));

        node.last_rx = None;
        assert!(node.is_expired(Duration::from_secs(900)));
    }

    #[test]
    fn fresh_node_with_traffic_is_not_expired() {
        let mut node = test_node();
        node.last_rx = Some(Instant::now());
        assert!(!node.is_expired(Duration::from_secs(900)));
    }

    #[test]
    fn needs_ping_when_idle() {
        let mut node = test_node();
        node.last_rx = Some(Instant::now());

        // No pending queries at all: ping it.
        assert!(node.needs_ping(Duration::from_secs(900)));

        pending(&mut node, 1);
        assert!(!node.needs_ping(Duration::from_secs(900)));

        // Half the cleanup period has passed (period of zero makes it so).
        assert!(node.needs_ping(Duration::ZERO));
    }

    #[test]
    fn contacted_recently_within_period() {
        let mut node = test_node();
        let info_hash = Id::random();

        assert!(!node.was_contacted_recently(&info_hash, Duration::from_secs(15)));

        node.mark_contacted(info_hash);
        assert!(node.was_contacted_recently(&info_hash, Duration::from_secs(15)));

        // An old contact is no longer recent.
        assert!(!node.was_contacted_recently(&info_hash, Duration::ZERO));
    }
}
