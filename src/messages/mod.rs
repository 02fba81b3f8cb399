//! Typed KRPC messages over the raw bencoded wire shape.
//!
//! Queries are parsed eagerly against the method registry. Response bodies
//! are schemaless on the wire, so they are kept raw and typed later with
//! [Response::decode] using the method recorded in the pending-query table.

mod wire;

use std::net::SocketAddr;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::common::Id;

pub(crate) use wire::{encode_endpoint, Endpoint, NodeLocator, Nodes4, Nodes6, RawMessage};

/// Wire error: bad token on a `put`.
pub(crate) const ERR_BAD_TOKEN: (i64, &str) = (203, "bad token");
/// Wire error: `put` value over the size cap.
pub(crate) const ERR_VALUE_TOO_LARGE: (i64, &str) = (205, "value too large");
/// Wire error: malformed key or failed signature on a mutable `put`.
pub(crate) const ERR_BAD_SIGNATURE: (i64, &str) = (206, "bad signature");
/// Wire error: `put` salt over the size cap.
pub(crate) const ERR_SALT_TOO_LARGE: (i64, &str) = (207, "salt too large");
/// Wire error: compare-and-swap sequence mismatch on a mutable `put`.
pub(crate) const ERR_CAS_MISMATCH: (i64, &str) = (301, "CAS mismatch");
/// Wire error: sequence number rollback on a mutable `put`.
pub(crate) const ERR_SEQ_ROLLBACK: (i64, &str) = (302, "sequence number rollback not permitted");

/// The KRPC methods this node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
            Method::Get => "get",
            Method::Put => "put",
        }
    }
}

impl FromStr for Method {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Method, MessageError> {
        match s {
            "ping" => Ok(Method::Ping),
            "find_node" => Ok(Method::FindNode),
            "get_peers" => Ok(Method::GetPeers),
            "announce_peer" => Ok(Method::AnnouncePeer),
            "get" => Ok(Method::Get),
            "put" => Ok(Method::Put),
            other => Err(MessageError::UnknownMethod(other.into())),
        }
    }
}

// === Query arguments, one struct per registered method ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct PingArgs {
    pub id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct FindNodeArgs {
    pub id: Id,
    pub target: Id,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub want: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct GetPeersArgs {
    pub id: Id,
    pub info_hash: Id,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub want: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct AnnouncePeerArgs {
    pub id: Id,
    pub info_hash: Id,
    pub port: u16,
    pub token: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub implied_port: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct GetArgs {
    pub id: Id,
    pub target: Id,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct PutArgs {
    pub id: Id,
    pub token: ByteBuf,

    #[serde(rename = "v")]
    pub value: ByteBuf,

    /// 32-byte Ed25519 public key; present on mutable puts only.
    #[serde(rename = "k", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<ByteBuf>,

    /// 64-byte Ed25519 signature; present on mutable puts only.
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub salt: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cas: Option<u64>,
}

/// A decoded query body, tagged by its method.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Args {
    Ping(PingArgs),
    FindNode(FindNodeArgs),
    GetPeers(GetPeersArgs),
    AnnouncePeer(AnnouncePeerArgs),
    Get(GetArgs),
    Put(PutArgs),
}

impl Args {
    pub fn method(&self) -> Method {
        match self {
            Args::Ping(_) => Method::Ping,
            Args::FindNode(_) => Method::FindNode,
            Args::GetPeers(_) => Method::GetPeers,
            Args::AnnouncePeer(_) => Method::AnnouncePeer,
            Args::Get(_) => Method::Get,
            Args::Put(_) => Method::Put,
        }
    }

    /// The sender's node ID, common to every query body.
    pub fn node_id(&self) -> Id {
        match self {
            Args::Ping(a) => a.id,
            Args::FindNode(a) => a.id,
            Args::GetPeers(a) => a.id,
            Args::AnnouncePeer(a) => a.id,
            Args::Get(a) => a.id,
            Args::Put(a) => a.id,
        }
    }

    pub fn decode(method: Method, value: &Value) -> Result<Args, MessageError> {
        Ok(match method {
            Method::Ping => Args::Ping(from_value(value)?),
            Method::FindNode => Args::FindNode(from_value(value)?),
            Method::GetPeers => Args::GetPeers(from_value(value)?),
            Method::AnnouncePeer => Args::AnnouncePeer(from_value(value)?),
            Method::Get => Args::Get(from_value(value)?),
            Method::Put => Args::Put(from_value(value)?),
        })
    }

    fn to_value(&self) -> Result<Value, MessageError> {
        match self {
            Args::Ping(a) => to_value(a),
            Args::FindNode(a) => to_value(a),
            Args::GetPeers(a) => to_value(a),
            Args::AnnouncePeer(a) => to_value(a),
            Args::Get(a) => to_value(a),
            Args::Put(a) => to_value(a),
        }
    }
}

// === Response bodies, one struct per registered method ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct PingResponse {
    pub id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct FindNodeResponse {
    pub id: Id,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes: Option<Nodes4>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes6: Option<Nodes6>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct GetPeersResponse {
    pub id: Id,
    pub token: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes: Option<Nodes4>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes6: Option<Nodes6>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub values: Option<Vec<Endpoint>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct AnnouncePeerResponse {
    pub id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct GetResponse {
    pub id: Id,
    pub token: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes: Option<Nodes4>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes6: Option<Nodes6>,

    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    pub value: Option<ByteBuf>,

    #[serde(rename = "k", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<ByteBuf>,

    #[serde(rename = "sig", skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<ByteBuf>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct PutResponse {
    pub id: Id,
}

/// A response body typed after the fact against the originating method.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Response {
    Ping(PingResponse),
    FindNode(FindNodeResponse),
    GetPeers(GetPeersResponse),
    AnnouncePeer(AnnouncePeerResponse),
    Get(GetResponse),
    Put(PutResponse),
}

impl Response {
    /// The responder's node ID, common to every response body.
    pub fn node_id(&self) -> Id {
        match self {
            Response::Ping(r) => r.id,
            Response::FindNode(r) => r.id,
            Response::GetPeers(r) => r.id,
            Response::AnnouncePeer(r) => r.id,
            Response::Get(r) => r.id,
            Response::Put(r) => r.id,
        }
    }

    /// Second-stage parse of a raw response body, using the method recorded
    /// when the query was sent.
    pub fn decode(method: Method, value: &Value) -> Result<Response, MessageError> {
        Ok(match method {
            Method::Ping => Response::Ping(from_value(value)?),
            Method::FindNode => Response::FindNode(from_value(value)?),
            Method::GetPeers => Response::GetPeers(from_value(value)?),
            Method::AnnouncePeer => Response::AnnouncePeer(from_value(value)?),
            Method::Get => Response::Get(from_value(value)?),
            Method::Put => Response::Put(from_value(value)?),
        })
    }

    fn to_value(&self) -> Result<Value, MessageError> {
        match self {
            Response::Ping(r) => to_value(r),
            Response::FindNode(r) => to_value(r),
            Response::GetPeers(r) => to_value(r),
            Response::AnnouncePeer(r) => to_value(r),
            Response::Get(r) => to_value(r),
            Response::Put(r) => to_value(r),
        }
    }
}

/// A decoded KRPC message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub transaction_id: Vec<u8>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MessageKind {
    Query { method: Method, args: Args },

    /// Held raw until the caller types it with [Response::decode].
    Response { raw: Value },

    Error { code: i64, message: String },
}

impl Message {
    pub fn from_bytes(bytes: &[u8]) -> Result<Message, MessageError> {
        let raw: RawMessage = serde_bencode::from_bytes(bytes)?;

        let kind = match raw.kind.as_str() {
            "q" => {
                let method: Method = raw.method.ok_or(MessageError::MissingMethod)?.parse()?;
                let args = raw.args.ok_or(MessageError::MissingBody)?;
                MessageKind::Query {
                    method,
                    args: Args::decode(method, &args)?,
                }
            }
            "r" => MessageKind::Response {
                raw: raw.response.ok_or(MessageError::MissingBody)?,
            },
            "e" => {
                let (code, message) = raw.error.ok_or(MessageError::MissingBody)?;
                MessageKind::Error { code, message }
            }
            other => return Err(MessageError::UnknownKind(other.into())),
        };

        Ok(Message {
            transaction_id: raw.transaction_id.into_vec(),
            kind,
        })
    }
}

/// Encode a query frame.
pub(crate) fn encode_query(transaction_id: &[u8], args: &Args) -> Result<Vec<u8>, MessageError> {
    let raw = RawMessage {
        transaction_id: ByteBuf::from(transaction_id.to_vec()),
        kind: "q".into(),
        method: Some(args.method().as_str().into()),
        args: Some(args.to_value()?),
        response: None,
        error: None,
        ip: None,
    };

    Ok(serde_bencode::to_bytes(&raw)?)
}

/// Encode a response frame. `requester` is echoed back in the `ip` field as
/// the endpoint the query was seen from.
pub(crate) fn encode_response(
    transaction_id: &[u8],
    response: &Response,
    requester: Option<&SocketAddr>,
) -> Result<Vec<u8>, MessageError> {
    let raw = RawMessage {
        transaction_id: ByteBuf::from(transaction_id.to_vec()),
        kind: "r".into(),
        method: None,
        args: None,
        response: Some(response.to_value()?),
        error: None,
        ip: requester.map(encode_endpoint),
    };

    Ok(serde_bencode::to_bytes(&raw)?)
}

/// Encode an error frame.
pub(crate) fn encode_error(
    transaction_id: &[u8],
    code: i64,
    message: &str,
) -> Result<Vec<u8>, MessageError> {
    let raw = RawMessage {
        transaction_id: ByteBuf::from(transaction_id.to_vec()),
        kind: "e".into(),
        method: None,
        args: None,
        response: None,
        error: Some((code, message.into())),
        ip: None,
    };

    Ok(serde_bencode::to_bytes(&raw)?)
}

/// Re-encode an arbitrary serialisable into a raw bencode [Value].
fn to_value<T: Serialize>(v: &T) -> Result<Value, MessageError> {
    Ok(serde_bencode::from_bytes(&serde_bencode::to_bytes(v)?)?)
}

/// Type a raw bencode [Value] into a concrete body.
fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, MessageError> {
    Ok(serde_bencode::from_bytes(&serde_bencode::to_bytes(
        value,
    )?)?)
}

// === `want` handling (BEP-32) ===

/// Which address families the sender asked for. With no usable `want` list,
/// fall back to the family the query arrived from.
pub(crate) fn wants(want: Option<&[String]>, from: &SocketAddr) -> (bool, bool) {
    let list = want.unwrap_or(&[]);

    let mut v4 = has_item(list, "n4");
    let mut v6 = has_item(list, "n6");

    if !v4 && !v6 {
        v4 = from.is_ipv4();
        v6 = !v4;
    }

    (v4, v6)
}

fn has_item(list: &[String], item: &str) -> bool {
    // An absurdly long want list is treated as empty.
    if list.len() > 10 {
        return false;
    }

    list.iter().any(|x| x == item)
}

/// Partition locators into IPv4 and IPv6 compact lists, restricted to the
/// requested families. Empty lists become absent fields.
pub(crate) fn form_node_list(
    locators: &[NodeLocator],
    want: Option<&[String]>,
    from: &SocketAddr,
) -> (Option<Nodes4>, Option<Nodes6>) {
    let (v4, v6) = wants(want, from);

    let mut nodes4 = Vec::new();
    let mut nodes6 = Vec::new();

    for locator in locators {
        if locator.addr.is_ipv4() {
            if v4 {
                nodes4.push(*locator);
            }
        } else if v6 {
            nodes6.push(*locator);
        }
    }

    (
        (!nodes4.is_empty()).then_some(Nodes4(nodes4)),
        (!nodes6.is_empty()).then_some(Nodes6(nodes6)),
    )
}

/// Restrict peer endpoints to the requested address families.
pub(crate) fn form_peer_list(
    addrs: &[SocketAddr],
    want: Option<&[String]>,
    from: &SocketAddr,
) -> Vec<Endpoint> {
    let (v4, v6) = wants(want, from);

    addrs
        .iter()
        .filter(|addr| if addr.is_ipv4() { v4 } else { v6 })
        .map(|addr| Endpoint(*addr))
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum MessageError {
    #[error("failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    #[error("query without a method")]
    MissingMethod,

    #[error("message without a body")]
    MissingBody,
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(bytes: &[u8]) -> Message {
        Message::from_bytes(bytes).expect("decode")
    }

    /// Decode, re-encode and decode again; the query must survive intact.
    fn roundtrip_query(bytes: &[u8]) -> Args {
        let msg = decode(bytes);
        let MessageKind::Query { args, .. } = &msg.kind else {
            panic!("expected a query");
        };

        let encoded = encode_query(&msg.transaction_id, args).expect("encode");
        let again = decode(&encoded);
        let MessageKind::Query { args: args2, .. } = again.kind else {
            panic!("expected a query after reencode");
        };

        assert_eq!(&args2, args);
        assert_eq!(again.transaction_id, msg.transaction_id);
        args2
    }

    /// Same, for a response typed via the method recorded at query time.
    fn roundtrip_response(bytes: &[u8], method: Method) -> Response {
        let msg = decode(bytes);
        let MessageKind::Response { raw } = &msg.kind else {
            panic!("expected a response");
        };
        let response = Response::decode(method, raw).expect("type response");

        let encoded =
            encode_response(&msg.transaction_id, &response, None).expect("encode");
        let again = decode(&encoded);
        let MessageKind::Response { raw } = &again.kind else {
            panic!("expected a response after reencode");
        };
        let response2 = Response::decode(method, raw).expect("retype response");

        assert_eq!(response2, response);
        response2
    }

    #[test]
    fn ping_query_roundtrip() {
        let args =
            roundtrip_query(b"d1:q4:ping1:ad2:id20:....................e1:t4:abcd1:y1:qe");

        let Args::Ping(ping) = args else {
            panic!("expected ping args")
        };
        assert_eq!(ping.id.as_bytes(), b"....................");
    }

    #[test]
    fn ping_response_roundtrip() {
        let response = roundtrip_response(
            b"d1:rd2:id20:....................e1:t4:abcd1:y1:re",
            Method::Ping,
        );

        let Response::Ping(ping) = response else {
            panic!("expected ping response")
        };
        assert_eq!(ping.id.as_bytes(), b"....................");
    }

    #[test]
    fn get_peers_query_roundtrip() {
        let args = roundtrip_query(
            b"d1:q9:get_peers1:ad4:wantl2:n42:n6e2:id20:....................9:info_hash20:,,,,,,,,,,,,,,,,,,,,e1:t4:abcd1:y1:qe",
        );

        let Args::GetPeers(get_peers) = args else {
            panic!("expected get_peers args")
        };
        assert_eq!(get_peers.info_hash.as_bytes(), b",,,,,,,,,,,,,,,,,,,,");
        assert_eq!(
            get_peers.want,
            Some(vec!["n4".to_string(), "n6".to_string()])
        );
    }

    #[test]
    fn get_peers_response_roundtrip() {
        let response = roundtrip_response(
            b"d1:rd2:id20:....................5:token8:@@@@@@@@6:valuesl6:<<<<>>6:<<<<>>ee1:t4:abcd1:y1:re",
            Method::GetPeers,
        );

        let Response::GetPeers(get_peers) = response else {
            panic!("expected get_peers response")
        };
        assert_eq!(&get_peers.token[..], b"@@@@@@@@");

        let values = get_peers.values.expect("values present");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].0, "60.60.60.60:15934".parse().unwrap());
    }

    #[test]
    fn get_peers_response_with_nodes_roundtrip() {
        let response = roundtrip_response(
            b"d1:rd2:id20:....................5:nodes26:,,,,,,,,,,,,,,,,,,,,<<<<>>5:token8:@@@@@@@@e1:t4:abcd1:y1:re",
            Method::GetPeers,
        );

        let Response::GetPeers(get_peers) = response else {
            panic!("expected get_peers response")
        };
        let nodes = get_peers.nodes.expect("nodes present");
        assert_eq!(nodes.0.len(), 1);
        assert_eq!(nodes.0[0].id.as_bytes(), b",,,,,,,,,,,,,,,,,,,,");
        assert!(get_peers.values.is_none());
    }

    #[test]
    fn announce_peer_query_roundtrip() {
        let args = roundtrip_query(
            b"d1:q13:announce_peer1:ad2:id20:....................4:porti65321e5:token8:@@@@@@@@9:info_hash20:,,,,,,,,,,,,,,,,,,,,12:implied_porti0ee1:t4:abcd1:y1:qe",
        );

        let Args::AnnouncePeer(announce) = args else {
            panic!("expected announce_peer args")
        };
        assert_eq!(announce.port, 65321);
        assert_eq!(announce.implied_port, Some(0));
        assert_eq!(&announce.token[..], b"@@@@@@@@");
    }

    #[test]
    fn find_node_query_roundtrip() {
        let args = roundtrip_query(
            b"d1:q9:find_node1:ad2:id20:....................6:target20:,,,,,,,,,,,,,,,,,,,,e1:t4:abcd1:y1:qe",
        );

        let Args::FindNode(find_node) = args else {
            panic!("expected find_node args")
        };
        assert_eq!(find_node.target.as_bytes(), b",,,,,,,,,,,,,,,,,,,,");
        assert_eq!(find_node.want, None);
    }

    #[test]
    fn error_frame_decodes() {
        let encoded = encode_error(b"abcd", 203, "bad token").unwrap();
        let msg = decode(&encoded);

        assert_eq!(
            msg.kind,
            MessageKind::Error {
                code: 203,
                message: "bad token".into()
            }
        );
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = Message::from_bytes(
            b"d1:q7:unknown1:ad2:id20:....................e1:t4:abcd1:y1:qe",
        );
        assert!(matches!(err, Err(MessageError::UnknownMethod(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Message::from_bytes(b"not bencode at all").is_err());
        assert!(Message::from_bytes(b"").is_err());
    }

    #[test]
    fn wants_falls_back_to_source_family() {
        let v4_from: SocketAddr = "1.2.3.4:1".parse().unwrap();
        let v6_from: SocketAddr = "[::1]:1".parse().unwrap();

        assert_eq!(wants(None, &v4_from), (true, false));
        assert_eq!(wants(None, &v6_from), (false, true));

        let both = vec!["n4".to_string(), "n6".to_string()];
        assert_eq!(wants(Some(&both), &v4_from), (true, true));

        let n6 = vec!["n6".to_string()];
        assert_eq!(wants(Some(&n6), &v4_from), (false, true));
    }

    #[test]
    fn form_node_list_partitions_by_family() {
        let locators = vec![
            NodeLocator {
                id: Id::random(),
                addr: "1.2.3.4:1".parse().unwrap(),
            },
            NodeLocator {
                id: Id::random(),
                addr: "[2001:db8::1]:2".parse().unwrap(),
            },
        ];
        let from: SocketAddr = "9.9.9.9:9".parse().unwrap();

        let both = vec!["n4".to_string(), "n6".to_string()];
        let (n4, n6) = form_node_list(&locators, Some(&both), &from);
        assert_eq!(n4.unwrap().0.len(), 1);
        assert_eq!(n6.unwrap().0.len(), 1);

        // No want list: only the requester's family.
        let (n4, n6) = form_node_list(&locators, None, &from);
        assert_eq!(n4.unwrap().0.len(), 1);
        assert!(n6.is_none());
    }
}
