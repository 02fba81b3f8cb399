//! Common structs used throughout the library.

pub mod datum;
mod id;
mod neighbourhood;
mod node;
mod routing_table;
mod trie;

pub use datum::Datum;
pub use id::{Id, InvalidIdSize, ParseIdError, ID_BITS, ID_SIZE};

pub(crate) use neighbourhood::Neighbourhood;
pub(crate) use node::{Node, PendingQuery};
pub(crate) use routing_table::{is_valid_address, RoutingTable};
pub(crate) use trie::{Contact, K};
