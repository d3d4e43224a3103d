//! # Wire Messages
//!
//! Every datagram carries one [`Message`]: a transaction id plus a query, a
//! reply or an error. Query arguments and reply bodies are dynamically typed
//! dictionaries ([`Dict`]) so that incoming queries can be checked against the
//! declarative schemas in [`crate::schema`] instead of per-message decoding code.
//!
//! | Kind | Body |
//! |------|------|
//! | query | `method` name + argument dictionary |
//! | reply | result dictionary (always contains `id`) |
//! | error | numeric code + human readable message |
//!
//! ## Encoding
//!
//! Messages are serialized with bincode. Decoding always goes through
//! size-limited options so a hostile datagram cannot force large allocations.
//!
//! Node and peer endpoints use the compact layouts of the mainline DHT:
//! 26 bytes per IPv4 node (`id || ip || port`), 38 per IPv6 node, 6 / 18 bytes
//! per peer.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::id::{NodeId, ID_LEN};

/// Largest datagram the node will decode or produce.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024;

pub const COMPACT_PEER_V4: usize = 6;
pub const COMPACT_PEER_V6: usize = 18;
pub const COMPACT_NODE_V4: usize = ID_LEN + COMPACT_PEER_V4;
pub const COMPACT_NODE_V6: usize = ID_LEN + COMPACT_PEER_V6;

/// Argument / result dictionary.
pub type Dict = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

/// Type tag used by schema descriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bytes,
    List,
    Dict,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Bytes(id.as_bytes().to_vec())
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::Dict(d)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Query { method: String, args: Dict },
    Reply(Dict),
    Error { code: i64, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub transaction_id: Vec<u8>,
    pub body: MessageBody,
}

impl Message {
    pub fn query(transaction_id: Vec<u8>, method: &str, args: Dict) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Query {
                method: method.to_string(),
                args,
            },
        }
    }

    pub fn reply(transaction_id: Vec<u8>, result: Dict) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Reply(result),
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self.body, MessageBody::Query { .. })
    }

    /// The sender's node id, if the message carries a well-formed one.
    pub fn sender_id(&self) -> Option<NodeId> {
        let dict = match &self.body {
            MessageBody::Query { args, .. } => args,
            MessageBody::Reply(result) => result,
            MessageBody::Error { .. } => return None,
        };
        dict.get("id")
            .and_then(Value::as_bytes)
            .and_then(NodeId::from_slice)
    }

    /// Method name for queries, `"reply"` / `"error"` otherwise. Used in logs.
    pub fn kind_name(&self) -> &str {
        match &self.body {
            MessageBody::Query { method, .. } => method,
            MessageBody::Reply(_) => "reply",
            MessageBody::Error { .. } => "error",
        }
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn encode(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

/// Decode a datagram with the size limit enforced.
pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn write_compact_addr(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

pub fn compact_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_PEER_V6);
    write_compact_addr(addr, &mut out);
    out
}

/// Parse a 6-byte (IPv4) or 18-byte (IPv6) compact endpoint.
pub fn read_compact_addr(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        COMPACT_PEER_V4 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        COMPACT_PEER_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Encode nodes into `(nodes, nodes6)` compact strings.
pub fn write_nodes(nodes: &[(NodeId, SocketAddr)]) -> (Vec<u8>, Vec<u8>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for (id, addr) in nodes {
        let out = if addr.is_ipv4() { &mut v4 } else { &mut v6 };
        out.extend_from_slice(id.as_bytes());
        write_compact_addr(addr, out);
    }
    (v4, v6)
}

/// Decode a compact node string; trailing partial entries are ignored.
pub fn read_nodes(bytes: &[u8], entry_len: usize) -> Vec<(NodeId, SocketAddr)> {
    bytes
        .chunks_exact(entry_len)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..ID_LEN])?;
            let addr = read_compact_addr(&chunk[ID_LEN..])?;
            Some((id, addr))
        })
        .collect()
}

/// Put `nodes` / `nodes6` entries into a reply dictionary, skipping empty ones.
pub fn insert_nodes(reply: &mut Dict, nodes: &[(NodeId, SocketAddr)]) {
    let (v4, v6) = write_nodes(nodes);
    if !v4.is_empty() {
        reply.insert("nodes".into(), Value::Bytes(v4));
    }
    if !v6.is_empty() {
        reply.insert("nodes6".into(), Value::Bytes(v6));
    }
}

/// Read both `nodes` and `nodes6` from a reply dictionary.
pub fn extract_nodes(reply: &Dict) -> Vec<(NodeId, SocketAddr)> {
    let mut out = Vec::new();
    if let Some(bytes) = reply.get("nodes").and_then(Value::as_bytes) {
        out.extend(read_nodes(bytes, COMPACT_NODE_V4));
    }
    if let Some(bytes) = reply.get("nodes6").and_then(Value::as_bytes) {
        out.extend(read_nodes(bytes, COMPACT_NODE_V6));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_nodes_keep_both_families() {
        let a = (NodeId::random(), "10.0.0.1:6881".parse().unwrap());
        let b = (NodeId::random(), "[2001:db8::1]:6882".parse().unwrap());
        let mut reply = Dict::new();
        insert_nodes(&mut reply, &[a, b]);

        assert_eq!(reply["nodes"].as_bytes().unwrap().len(), COMPACT_NODE_V4);
        assert_eq!(reply["nodes6"].as_bytes().unwrap().len(), COMPACT_NODE_V6);
        assert_eq!(extract_nodes(&reply), vec![a, b]);
    }

    #[test]
    fn compact_addr_rejects_odd_lengths() {
        assert!(read_compact_addr(&[1, 2, 3]).is_none());
        let addr: SocketAddr = "192.168.1.9:51413".parse().unwrap();
        assert_eq!(read_compact_addr(&compact_addr(&addr)), Some(addr));
    }

    #[test]
    fn decode_rejects_garbage_and_oversized_input() {
        assert!(decode(&[0xff; 7]).is_err());

        let mut args = Dict::new();
        args.insert("v".into(), Value::Bytes(vec![0u8; MAX_MESSAGE_SIZE as usize]));
        let huge = Message::query(vec![0, 1], "put", args);
        assert!(encode(&huge).is_err());
    }

    #[test]
    fn sender_id_requires_twenty_bytes() {
        let id = NodeId::random();
        let mut args = Dict::new();
        args.insert("id".into(), id.into());
        let msg = Message::query(vec![1], "ping", args);
        assert_eq!(msg.sender_id(), Some(id));

        let mut short = Dict::new();
        short.insert("id".into(), Value::Bytes(vec![1, 2, 3]));
        assert_eq!(Message::reply(vec![1], short).sender_id(), None);
        assert_eq!(Message::error(vec![1], 203, "x").sender_id(), None);
    }
}
