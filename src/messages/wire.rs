//! Raw bencoded message shape and the compact binary codecs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::common::{Id, ID_SIZE};

/// IPv4 compact node descriptor: 20-byte ID, 4-byte IP, 2-byte port.
const NODE4_SIZE: usize = ID_SIZE + 6;

/// IPv6 compact node descriptor: 20-byte ID, 16-byte IP, 2-byte port.
const NODE6_SIZE: usize = ID_SIZE + 18;

/// The outermost KRPC dictionary, as sent on the wire.
///
/// Queries carry their arguments under `a`; responses carry their body under
/// `r`. Response bodies cannot be typed at decode time, because bencode has
/// no discriminator and only the transaction record knows the method, so
/// both are held as raw [Value]s and second-stage parsed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct RawMessage {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,

    #[serde(rename = "y")]
    pub kind: String,

    #[serde(rename = "q", skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,

    #[serde(rename = "a", skip_serializing_if = "Option::is_none", default)]
    pub args: Option<Value>,

    #[serde(rename = "r", skip_serializing_if = "Option::is_none", default)]
    pub response: Option<Value>,

    #[serde(rename = "e", skip_serializing_if = "Option::is_none", default)]
    pub error: Option<(i64, String)>,

    /// The sender's endpoint as seen by the responder, in compact form.
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<ByteBuf>,
}

/// The NodeID and UDP address of a node as carried in compact node lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLocator {
    pub id: Id,
    pub addr: SocketAddr,
}

/// An IPv4 node list: the concatenation of 26-byte node descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Nodes4(pub Vec<NodeLocator>);

impl Serialize for Nodes4 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(self.0.len() * NODE4_SIZE);

        for locator in &self.0 {
            let IpAddr::V4(ip) = locator.addr.ip() else {
                return Err(S::Error::custom("IPv6 address in IPv4 node list"));
            };

            bytes.extend_from_slice(locator.id.as_bytes());
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&locator.addr.port().to_be_bytes());
        }

        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Nodes4 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Nodes4, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        if bytes.len() % NODE4_SIZE != 0 {
            return Err(D::Error::custom("node list not divisible by 26"));
        }

        let mut locators = Vec::with_capacity(bytes.len() / NODE4_SIZE);
        for chunk in bytes.chunks_exact(NODE4_SIZE) {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).map_err(D::Error::custom)?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);

            locators.push(NodeLocator {
                id,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            });
        }

        Ok(Nodes4(locators))
    }
}

/// An IPv6 node list: the concatenation of 38-byte node descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Nodes6(pub Vec<NodeLocator>);

impl Serialize for Nodes6 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(self.0.len() * NODE6_SIZE);

        for locator in &self.0 {
            let IpAddr::V6(ip) = locator.addr.ip() else {
                return Err(S::Error::custom("IPv4 address in IPv6 node list"));
            };

            bytes.extend_from_slice(locator.id.as_bytes());
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&locator.addr.port().to_be_bytes());
        }

        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Nodes6 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Nodes6, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        if bytes.len() % NODE6_SIZE != 0 {
            return Err(D::Error::custom("node list not divisible by 38"));
        }

        let mut locators = Vec::with_capacity(bytes.len() / NODE6_SIZE);
        for chunk in bytes.chunks_exact(NODE6_SIZE) {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).map_err(D::Error::custom)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[ID_SIZE..ID_SIZE + 16]);
            let port = u16::from_be_bytes([chunk[36], chunk[37]]);

            locators.push(NodeLocator {
                id,
                addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
            });
        }

        Ok(Nodes6(locators))
    }
}

/// A peer endpoint: a 6-byte (IPv4) or 18-byte (IPv6) string holding IP and
/// big-endian port. The length disambiguates the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoint(pub SocketAddr);

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(18);
        match self.0.ip() {
            IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
        }
        bytes.extend_from_slice(&self.0.port().to_be_bytes());

        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Endpoint, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;

        let ip = match bytes.len() {
            6 => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            18 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => return Err(D::Error::custom(format!("endpoint of {n} bytes"))),
        };
        let port = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);

        Ok(Endpoint(SocketAddr::new(ip, port)))
    }
}

/// Compact form of a socket address, for the top-level `ip` field.
pub(crate) fn encode_endpoint(addr: &SocketAddr) -> ByteBuf {
    let mut bytes = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
    }
    bytes.extend_from_slice(&addr.port().to_be_bytes());

    ByteBuf::from(bytes)
}
