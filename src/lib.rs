//! A participating node of the BitTorrent Mainline DHT.
//!
//! Implements BEP-0005 and BEP-0032, the BEP-0042 node ID check, and
//! BEP-0044 immutable/mutable storage. Routing uses a bit-compressed
//! binary trie instead of buckets; all mutable state is owned by a single
//! control thread, and discovered peers are delivered on an asynchronous
//! result stream.
//!
//! ```no_run
//! use sloppy::{Config, Dht};
//!
//! let dht = Dht::new(Config::default())?;
//! dht.add_node("67.215.246.10:6881".parse().unwrap(), None);
//!
//! let info_hash: sloppy::Id = "d1c5676ae7ac98e8b19f63565905105e3c4c37a2".parse()?;
//! let _search = dht.request_peers(info_hash, false);
//!
//! for peer in dht.peers().take(5) {
//!     println!("found peer {} for {}", peer.addr, peer.info_hash);
//! }
//! # Ok::<(), sloppy::Error>(())
//! ```

mod common;
mod config;
mod dht;
mod error;
mod messages;
mod rpc;
mod search;
mod server;

pub mod security;
pub mod storage;

pub use common::datum::{encode_signable, immutable_target, mutable_target};
pub use common::{Datum, Id, InvalidIdSize, ParseIdError, ID_BITS, ID_SIZE};
pub use config::Config;
pub use dht::{Dht, NodeInfo, PeerResult, Peers};
pub use error::Error;
pub use search::Search;

/// Alias for results with the crate error.
pub type Result<T, E = Error> = core::result::Result<T, E>;
