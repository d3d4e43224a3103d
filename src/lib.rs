//! # kadnode - Kademlia DHT Node
//!
//! A BitTorrent-style Kademlia DHT node with tracker, item storage and
//! signed multi-value records:
//!
//! - **Routing**: 160-bit XOR-metric routing table with replacement caches
//! - **Tracker**: `get_peers` / `announce_peer` with bloom-filter scrapes
//! - **Items**: immutable and ed25519-signed mutable items (`get` / `put`)
//! - **Signed data**: per-user single and multi-value resources
//! - **Traversals**: iterative lookups with an optional write phase
//!
//! ## Architecture
//!
//! All protocol state sits in one `NodeState` behind a mutex inside
//! [`DhtNode`]. Outgoing messages and traversal completions are queued while
//! the lock is held and flushed after it is released. Sockets stay outside
//! the core behind the [`Transport`] trait; [`DhtService`] supplies a tokio
//! UDP driver.
//!
//! ## Security Model
//!
//! - Writes require a token bound to the writer's IP and the target
//! - Replies are only accepted from the address the query went to
//! - Mutable and signed items are verified with ed25519 before storage
//! - Every table is bounded; per-IP rate limiting guards the socket
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 160-bit node ids and XOR distance |
//! | `messages` | Wire message model and compact address encodings |
//! | `schema` | Key-descriptor validation of incoming dictionaries |
//! | `routing` | k-buckets, replacement caches, refresh bookkeeping |
//! | `rpc` | Transaction ids, observers and timeouts |
//! | `traversal` | Iterative lookups and their arena |
//! | `storage` | Torrent peers, items and signed data with bounded eviction |
//! | `bloom` | Scrape and announcer bloom filters |
//! | `token` | Write-token generation and rotation |
//! | `crypto` | ed25519 keys and domain-separated signatures |
//! | `config` | Tunable settings and protocol limits |
//! | `node` | The node state machine and its public handle |
//! | `transport` | Outbound message trait and UDP sender |
//! | `service` | tokio event loop and DoS blocker |

mod bloom;
mod config;
mod crypto;
mod id;
mod messages;
mod node;
mod routing;
mod rpc;
mod schema;
mod service;
mod storage;
mod token;
mod transport;
mod traversal;

pub use bloom::{AnnouncerFilter, BloomFilter, ScrapeFilter};
pub use config::{DhtSettings, MAX_ITEM_SIZE, MAX_SALT_SIZE, TOKEN_LEN};
pub use crypto::{
    Keypair, MUTABLE_ITEM_DOMAIN, SignatureError, sign_with_domain, verify_with_domain,
};
pub use id::{ID_BITS, ID_LEN, NodeId};
pub use messages::{
    Dict, Message, MessageBody, Value, ValueKind, compact_addr, decode, encode, read_compact_addr,
};
pub use node::{DhtNode, DhtStatus, RequestError};
pub use service::{DhtService, DosBlocker};
pub use storage::{
    DataPayload, PutError, SignedStorageItem, StoredSigned, data_key, mutable_key,
    mutable_signing_bytes,
};
pub use token::WriteToken;
pub use transport::{Transport, UdpTransport};
pub use traversal::TraversalId;
