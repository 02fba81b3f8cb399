//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::common::Id;

/// DHT node configuration. `Config::default()` gives the standard values.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP endpoint to bind on. Port 0 picks a random port.
    pub address: SocketAddr,

    /// Stop seeking peers for an infohash once this many are known.
    pub num_target_peers: usize,

    /// Seek more nodes while the routing table is below this.
    pub min_nodes: usize,

    /// Reject soft node additions beyond this.
    pub max_nodes: usize,

    /// How often to expire and ping nodes in the routing table.
    pub cleanup_period: Duration,

    /// How often to rotate the token secret.
    pub token_rotate_period: Duration,

    /// How often a standing search re-issues its peer request.
    pub search_retry_period: Duration,

    /// Maximum inbound packets per second. Negative means unlimited.
    pub rate_limit: i64,

    /// How many infohashes the peer store retains, LRU-evicted.
    pub max_info_hashes: usize,

    /// Peer cap per infohash.
    pub max_info_hash_peers: usize,

    /// A node with this many outstanding queries is considered saturated.
    pub max_pending_queries: usize,

    /// Local node ID. Generated randomly when absent.
    pub node_id: Option<Id>,

    /// Always request peers of both address families, instead of only the
    /// family used to reach the queried node.
    pub any_peer_af: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
            num_target_peers: 50,
            min_nodes: 16,
            max_nodes: 500,
            cleanup_period: Duration::from_secs(15 * 60),
            token_rotate_period: Duration::from_secs(5 * 60),
            search_retry_period: Duration::from_secs(15),
            rate_limit: 100,
            max_info_hashes: 2048,
            max_info_hash_peers: 256,
            max_pending_queries: 5,
            node_id: None,
            any_peer_af: false,
        }
    }
}
