//! Saving and restoring the bootstrap node list.
//!
//! The document is plain JSON: the local node ID in hex and one entry per
//! reachable node. Writes go through a temporary file and a rename so a
//! crash never leaves a half-written document behind.

use std::net::ToSocketAddrs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::Id;
use crate::{Dht, Error, Result};

#[derive(Serialize, Deserialize, Debug)]
struct Document {
    id: String,
    nodes: Vec<DocumentNode>,
}

#[derive(Serialize, Deserialize, Debug)]
struct DocumentNode {
    /// Node ID in hex; may be absent for nodes whose ID was never learned.
    #[serde(rename = "n", skip_serializing_if = "Option::is_none", default)]
    id: Option<String>,

    /// `ip:port`.
    #[serde(rename = "a")]
    addr: String,
}

/// Save the node's current set of reachable nodes.
pub fn save(path: impl AsRef<Path>, dht: &Dht) -> Result<()> {
    let document = Document {
        id: dht.node_id().to_string(),
        nodes: dht
            .list_reachable_nodes()
            .into_iter()
            .map(|node| DocumentNode {
                id: Some(node.id.to_string()),
                addr: node.addr.to_string(),
            })
            .collect(),
    };

    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut file, &document)?;
    file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Load a saved document and feed every entry to [Dht::add_node]. Returns
/// the number of nodes added.
pub fn load(path: impl AsRef<Path>, dht: &Dht) -> Result<usize> {
    let document = read_document(path)?;

    if document.nodes.is_empty() {
        return Err(Error::EmptyDocument);
    }

    let mut added = 0;
    for entry in document.nodes {
        // A stale or unparsable entry is not worth failing the whole load.
        let Some(addr) = entry
            .addr
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
        else {
            continue;
        };

        let id = entry.id.as_deref().and_then(|hex| Id::from_str(hex).ok());

        dht.add_node(addr, id);
        added += 1;
    }

    Ok(added)
}

/// The node ID recorded in a saved document.
pub fn stored_node_id(path: impl AsRef<Path>) -> Result<Id> {
    let document = read_document(path)?;
    Ok(Id::from_str(&document.id)?)
}

fn read_document(path: impl AsRef<Path>) -> Result<Document> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}
