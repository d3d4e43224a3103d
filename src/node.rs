//! # DHT Node
//!
//! [`DhtNode`] is the thread-safe handle to one DHT node. All mutable state
//! lives in a [`NodeState`] behind a single `parking_lot` mutex.
//!
//! ## Lock discipline
//!
//! Nothing leaves the lock while it is held. Operations append outgoing
//! messages to an outbox and finished traversals to a completion list; the
//! handle sends the messages and runs the completions after unlocking. A
//! completion may therefore call straight back into the node.
//!
//! ## Message flow
//!
//! | Inbound | Handling |
//! |---------|----------|
//! | query | validated against its schema, answered from the routing table and storage |
//! | reply | matched to its observer (transaction id + source address), fed to the owning traversal |
//! | error | counts as a failure of the observer |
//!
//! Senders of well-formed messages are offered to the routing table:
//! repliers as confirmed, queriers as unconfirmed.
//!
//! ## Time
//!
//! The handle's methods read the clock themselves; the `*_at` variants take
//! the current time so maintenance can be driven deterministically.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::DhtSettings;
use crate::crypto::{Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::id::NodeId;
use crate::messages::{self, Dict, Message, MessageBody, Value};
use crate::routing::RoutingTable;
use crate::rpc::{Observer, ObserverKind, RpcTimeout, RpcTracker};
use crate::schema::{self, SchemaError};
use crate::storage::{
    DataPayload, PeerQuery, PeerReply, PutError, PutRequest, SignedStorageItem, Storage,
    StoredSigned, data_key,
};
use crate::token::{TokenSecrets, WriteToken};
use crate::transport::Transport;
use crate::traversal::{
    ItemsCallback, NodesCallback, PeersCallback, Phase, Purpose, StoredCallback, Traversal,
    TraversalArena, TraversalId,
};

/// Signed items returned in one `get` reply.
const MAX_VALUES_PER_REPLY: usize = 8;

/// Below this many known nodes, lookups also start from the router nodes.
const MIN_SEED_NODES: usize = 3;

// ============================================================================
// Errors
// ============================================================================

/// Why an incoming query was refused. Sent back as an error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("{0}")]
    Protocol(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error(transparent)]
    Put(#[from] PutError),
}

impl RequestError {
    pub fn code(&self) -> i64 {
        match self {
            RequestError::Protocol(_) | RequestError::InvalidToken => 203,
            RequestError::UnknownMethod(_) => 204,
            RequestError::Put(e) => match e {
                PutError::TooBig => 205,
                PutError::BadSignature => 206,
                PutError::SaltTooBig => 207,
                PutError::StaleSequence => 302,
                PutError::ValueMismatch => 303,
                PutError::InvalidPayload(_) => 203,
                PutError::StorageFull => 202,
            },
        }
    }
}

impl From<SchemaError> for RequestError {
    fn from(e: SchemaError) -> Self {
        RequestError::Protocol(e.to_string())
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct DhtStatus {
    pub node_id: NodeId,
    pub nodes: usize,
    pub replacements: usize,
    pub buckets: Vec<usize>,
    pub torrents: usize,
    pub peers: usize,
    pub immutable_items: usize,
    pub mutable_items: usize,
    pub signed_items: usize,
    pub global_nodes: u64,
    pub running_traversals: usize,
    pub outstanding_rpcs: usize,
}

type Completion = Box<dyn FnOnce() + Send>;

// ============================================================================
// Node state
// ============================================================================

pub struct NodeState {
    settings: DhtSettings,
    own_id: NodeId,
    table: RoutingTable,
    rpc: RpcTracker,
    traversals: TraversalArena,
    tokens: TokenSecrets,
    storage: Storage,
    last_tracker_tick: Instant,
    last_key_rotation: Instant,
    outbox: Vec<(Message, SocketAddr)>,
    completions: Vec<Completion>,
}

impl NodeState {
    pub fn new(own_id: NodeId, settings: DhtSettings, now: Instant) -> Self {
        Self {
            table: RoutingTable::new(own_id, &settings, now),
            rpc: RpcTracker::new(settings.rpc_short_timeout, settings.rpc_timeout),
            traversals: TraversalArena::new(),
            tokens: TokenSecrets::new(),
            storage: Storage::new(&settings),
            last_tracker_tick: now,
            last_key_rotation: now,
            outbox: Vec::new(),
            completions: Vec::new(),
            own_id,
            settings,
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub fn incoming(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        let sender = message.sender_id().filter(|id| *id != self.own_id);
        match &message.body {
            MessageBody::Query { method, args } => {
                let response = match self.incoming_request(method, args, from, now) {
                    Ok(reply) => Message::reply(message.transaction_id.clone(), reply),
                    Err(e) => {
                        debug!(method = %method, from = %from, code = e.code(), error = %e, "query refused");
                        Message::error(message.transaction_id.clone(), e.code(), e.to_string())
                    }
                };
                self.outbox.push((response, from));
                if let Some(id) = sender {
                    self.table.heard_about(id, from, now);
                }
            }
            MessageBody::Reply(reply) => {
                let Some(observer) = self.rpc.incoming(&message.transaction_id, from) else {
                    trace!(from = %from, "dropping unmatched reply");
                    return;
                };
                let Some(id) = sender else {
                    debug!(from = %from, "reply without a valid id");
                    self.observer_failed(observer, now);
                    return;
                };
                if observer.id.is_some_and(|expected| expected != id) {
                    debug!(from = %from, got = %id.short(), "reply from unexpected node id");
                    self.observer_failed(observer, now);
                    return;
                }
                self.table.node_seen(id, from, now);
                self.handle_reply(observer, id, reply, from, now);
            }
            MessageBody::Error { code, message: text } => {
                let Some(observer) = self.rpc.incoming(&message.transaction_id, from) else {
                    trace!(from = %from, "dropping unmatched error");
                    return;
                };
                debug!(from = %from, code, error = %text, method = observer.kind.method(), "remote error");
                self.observer_failed(observer, now);
            }
        }
    }

    /// Answer one query. The caller turns the result into a reply or error.
    pub fn incoming_request(
        &mut self,
        method: &str,
        args: &Dict,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Dict, RequestError> {
        let mut reply = Dict::new();
        reply.insert("id".into(), self.own_id.into());

        match method {
            "ping" => {
                schema::verify_message(args, schema::PING)?;
            }
            "find_node" => {
                let parsed = schema::verify_message(args, schema::FIND_NODE)?;
                let target = id_arg(parsed[1])?;
                self.write_nodes(&mut reply, &target);
            }
            "get_peers" => {
                let parsed = schema::verify_message(args, schema::GET_PEERS)?;
                let info_hash = id_arg(parsed[1])?;
                if info_hash.is_zero() {
                    return Err(RequestError::Protocol("invalid info-hash".into()));
                }
                let query = PeerQuery {
                    noseed: int_flag(parsed[2]),
                    scrape: int_flag(parsed[3]),
                };
                let token = self.tokens.generate(from.ip(), &info_hash);
                reply.insert("token".into(), Value::Bytes(token.to_vec()));

                match self
                    .storage
                    .torrents
                    .peers(&info_hash, query, self.settings.max_peers_reply)
                {
                    Some(PeerReply::Peers(peers)) => {
                        let values = peers
                            .iter()
                            .map(|p| Value::Bytes(messages::compact_addr(p)))
                            .collect();
                        reply.insert("values".into(), Value::List(values));
                    }
                    Some(PeerReply::Scrape { seeds, downloaders }) => {
                        reply.insert("BFsd".into(), Value::Bytes(seeds.as_bytes().to_vec()));
                        reply.insert("BFpe".into(), Value::Bytes(downloaders.as_bytes().to_vec()));
                    }
                    None => self.write_nodes(&mut reply, &info_hash),
                }
            }
            "announce_peer" => {
                let parsed = schema::verify_message(args, schema::ANNOUNCE_PEER)?;
                let info_hash = id_arg(parsed[1])?;
                let token = parsed[3].and_then(Value::as_bytes).unwrap_or_default();
                if !self.tokens.verify(token, from.ip(), &info_hash) {
                    return Err(RequestError::InvalidToken);
                }
                let port = if int_flag(parsed[5]) {
                    from.port()
                } else {
                    parsed[2]
                        .and_then(Value::as_int)
                        .and_then(|p| u16::try_from(p).ok())
                        .filter(|p| *p != 0)
                        .ok_or_else(|| RequestError::Protocol("invalid port".into()))?
                };
                let seed = int_flag(parsed[4]);
                let name = parsed[6]
                    .and_then(Value::as_bytes)
                    .and_then(|n| String::from_utf8(n.to_vec()).ok());
                self.storage.torrents.announce(
                    info_hash,
                    SocketAddr::new(from.ip(), port),
                    seed,
                    name,
                    now,
                );
                trace!(info_hash = %info_hash.short(), from = %from, port, seed, "peer announced");
            }
            "get" => {
                let parsed = schema::verify_message(args, schema::GET)?;
                let target = id_arg(parsed[1])?;
                let token = self.tokens.generate(from.ip(), &target);
                reply.insert("token".into(), Value::Bytes(token.to_vec()));
                if !self.write_item(&mut reply, &target) {
                    self.write_nodes(&mut reply, &target);
                }
            }
            "put" => {
                let parsed = schema::verify_message(args, schema::PUT)?;
                let token = parsed[1].and_then(Value::as_bytes).unwrap_or_default();
                let request = parse_put(&parsed)?;
                let target = request.target();
                if !self.tokens.verify(token, from.ip(), &target) {
                    return Err(RequestError::InvalidToken);
                }
                if let PutRequest::Signed { item, payload } = &request {
                    item.verify_signature(payload)?;
                }
                self.storage.put(request, from.ip(), now)?;
                trace!(target = %target.short(), from = %from, "item stored");
            }
            other => return Err(RequestError::UnknownMethod(other.to_string())),
        }
        Ok(reply)
    }

    fn write_nodes(&self, reply: &mut Dict, target: &NodeId) {
        let nodes: Vec<(NodeId, SocketAddr)> = self
            .table
            .find_node(target, self.settings.bucket_size)
            .into_iter()
            .map(|e| (e.id, e.addr))
            .collect();
        messages::insert_nodes(reply, &nodes);
    }

    /// Add any item stored under `target`; `false` if there is none.
    fn write_item(&self, reply: &mut Dict, target: &NodeId) -> bool {
        if let Some(item) = self.storage.immutable.get(target) {
            reply.insert("v".into(), Value::Bytes(item.value.clone()));
            return true;
        }
        if let Some(item) = self.storage.mutable.get(target) {
            reply.insert("v".into(), Value::Bytes(item.value.clone()));
            reply.insert("k".into(), Value::Bytes(item.public_key.to_vec()));
            reply.insert("sig".into(), Value::Bytes(item.signature.to_vec()));
            reply.insert("seq".into(), Value::Int(item.seq as i64));
            if !item.salt.is_empty() {
                reply.insert("salt".into(), Value::Bytes(item.salt.clone()));
            }
            return true;
        }
        if let Some(entry) = self.storage.signed.get(target) {
            let skip = entry.items.len().saturating_sub(MAX_VALUES_PER_REPLY);
            let values = entry.items[skip..]
                .iter()
                .map(|s| Value::Dict(signed_item_dict(&s.item)))
                .collect();
            reply.insert("values".into(), Value::List(values));
            return true;
        }
        false
    }

    // ------------------------------------------------------------------------
    // Replies and failures
    // ------------------------------------------------------------------------

    fn handle_reply(
        &mut self,
        observer: Observer,
        id: NodeId,
        reply: &Dict,
        from: SocketAddr,
        now: Instant,
    ) {
        let Some(owner) = observer.owner else {
            return;
        };
        let own_id = self.own_id;
        let max_values = self.settings.max_multi_values;
        let Some(traversal) = self.traversals.get_mut(owner) else {
            trace!(from = %from, "reply for finished traversal");
            return;
        };

        match observer.kind {
            ObserverKind::Announce | ObserverKind::Put => traversal.on_write_result(true),
            ObserverKind::Ping => {}
            ObserverKind::FindNode | ObserverKind::GetPeers | ObserverKind::Get => {
                if let Err(e) = schema::verify_message(reply, schema::REPLY) {
                    debug!(from = %from, error = %e, "malformed reply");
                    traversal.on_failure(from);
                    self.table.node_failed(&id, &from);
                    self.drive(owner, now);
                    return;
                }
                let nodes: Vec<(NodeId, SocketAddr)> = messages::extract_nodes(reply)
                    .into_iter()
                    .filter(|(node, _)| *node != own_id)
                    .collect();
                let token = reply.get("token").and_then(Value::as_bytes).map(<[u8]>::to_vec);
                let target = traversal.target;

                match &mut traversal.purpose {
                    Purpose::Announce { peers, .. } if observer.kind == ObserverKind::GetPeers => {
                        collect_peers(reply, peers);
                    }
                    Purpose::GetData { items, .. } if observer.kind == ObserverKind::Get => {
                        collect_items(reply, &target, items, max_values);
                    }
                    _ => {}
                }
                traversal.on_reply(from, id, token, &nodes);
            }
        }
        self.drive(owner, now);
    }

    fn observer_failed(&mut self, observer: Observer, now: Instant) {
        if let Some(id) = observer.id {
            self.table.node_failed(&id, &observer.addr);
        }
        let Some(owner) = observer.owner else {
            return;
        };
        let Some(traversal) = self.traversals.get_mut(owner) else {
            return;
        };
        match observer.kind {
            ObserverKind::Announce | ObserverKind::Put => traversal.on_write_result(false),
            _ => traversal.on_failure(observer.addr),
        }
        self.drive(owner, now);
    }

    // ------------------------------------------------------------------------
    // Traversals
    // ------------------------------------------------------------------------

    fn start_traversal(
        &mut self,
        target: NodeId,
        purpose: Purpose,
        with_routers: bool,
        now: Instant,
    ) -> TraversalId {
        let mut traversal = Traversal::new(
            target,
            purpose,
            self.settings.bucket_size,
            self.settings.search_branching,
            self.settings.max_traversal_results,
        );
        let known = self.table.find_node(&target, self.settings.bucket_size);
        let add_routers = with_routers || known.len() < MIN_SEED_NODES;
        for entry in known {
            traversal.add_entry(Some(entry.id), entry.addr, 0);
        }
        if add_routers {
            for router in self.table.routers() {
                traversal.add_entry(None, *router, 0);
            }
        }
        debug!(
            kind = traversal.purpose.name(),
            target = %target.short(),
            seeds = traversal.results().len(),
            "traversal started"
        );
        let id = self.traversals.insert(traversal);
        self.drive(id, now);
        id
    }

    /// Issue whatever the traversal needs next; finish it when idle.
    fn drive(&mut self, id: TraversalId, now: Instant) {
        let Some(traversal) = self.traversals.get_mut(id) else {
            return;
        };

        if traversal.phase == Phase::Lookup {
            let requests = traversal.next_requests();
            let target = traversal.target;
            let (kind, extra) = match &traversal.purpose {
                Purpose::FindNode { .. } => (ObserverKind::FindNode, None),
                Purpose::Announce { seed, .. } => (ObserverKind::GetPeers, Some(*seed)),
                Purpose::GetData { .. } | Purpose::PutData { .. } => (ObserverKind::Get, None),
            };
            for (node, addr) in requests {
                let mut args = Dict::new();
                match kind {
                    ObserverKind::GetPeers => {
                        args.insert("info_hash".into(), target.into());
                        if extra == Some(true) {
                            args.insert("noseed".into(), Value::Int(1));
                        }
                    }
                    _ => {
                        args.insert("target".into(), target.into());
                    }
                }
                if !self.send_query(Some(id), kind, addr, node, args, now)
                    && let Some(t) = self.traversals.get_mut(id)
                {
                    t.on_failure(addr);
                }
            }

            let Some(traversal) = self.traversals.get_mut(id) else {
                return;
            };
            if !traversal.is_idle() {
                return;
            }
            if traversal.purpose.writes() {
                self.begin_write(id, now);
                return;
            }
        } else if !traversal.is_idle() {
            return;
        }
        self.finish(id);
    }

    fn begin_write(&mut self, id: TraversalId, now: Instant) {
        let Some(traversal) = self.traversals.get_mut(id) else {
            return;
        };
        let target = traversal.target;
        let holders: Vec<(NodeId, SocketAddr, Vec<u8>)> = traversal
            .write_targets()
            .into_iter()
            .filter_map(|c| Some((c.id?, c.addr, c.token.clone()?)))
            .collect();

        let (kind, base) = match &traversal.purpose {
            Purpose::Announce { port, seed, .. } => {
                let mut args = Dict::new();
                args.insert("info_hash".into(), target.into());
                args.insert("port".into(), Value::Int(i64::from(*port)));
                if *port == 0 {
                    args.insert("implied_port".into(), Value::Int(1));
                }
                if *seed {
                    args.insert("seed".into(), Value::Int(1));
                }
                (ObserverKind::Announce, args)
            }
            Purpose::PutData { item, .. } => {
                let mut args = Dict::new();
                args.insert("d".into(), Value::Dict(signed_item_dict(item)));
                (ObserverKind::Put, args)
            }
            _ => return,
        };
        traversal.begin_write(holders.len());
        debug!(target = %target.short(), holders = holders.len(), method = kind.method(), "write phase");

        for (node, addr, token) in holders {
            let mut args = base.clone();
            args.insert("token".into(), Value::Bytes(token));
            if !self.send_query(Some(id), kind, addr, Some(node), args, now)
                && let Some(t) = self.traversals.get_mut(id)
            {
                t.on_write_result(false);
            }
        }
        self.drive(id, now);
    }

    fn finish(&mut self, id: TraversalId) {
        let Some(traversal) = self.traversals.remove(id) else {
            return;
        };
        let nodes: Vec<(NodeId, SocketAddr)> = traversal
            .closest_alive()
            .into_iter()
            .filter_map(|c| Some((c.id?, c.addr)))
            .collect();
        debug!(
            kind = traversal.purpose.name(),
            target = %traversal.target.short(),
            responses = traversal.responses,
            timeouts = traversal.timeouts,
            "traversal done"
        );
        let acked = match traversal.phase {
            Phase::Write { acked, .. } => acked,
            Phase::Lookup => 0,
        };
        let completion: Completion = match traversal.purpose {
            Purpose::FindNode { done } => Box::new(move || done(nodes)),
            Purpose::Announce { peers, done, .. } => {
                Box::new(move || done(peers.into_iter().collect()))
            }
            Purpose::GetData { items, done } => Box::new(move || done(items)),
            Purpose::PutData { done, .. } => Box::new(move || done(acked)),
        };
        self.completions.push(completion);
    }

    /// Register an observer and queue the query. `false` if no transaction id was free.
    fn send_query(
        &mut self,
        owner: Option<TraversalId>,
        kind: ObserverKind,
        addr: SocketAddr,
        node: Option<NodeId>,
        mut args: Dict,
        now: Instant,
    ) -> bool {
        let Some(tid) = self.rpc.invoke(Observer::new(owner, kind, addr, node, now)) else {
            warn!(addr = %addr, "no free transaction id");
            return false;
        };
        args.insert("id".into(), self.own_id.into());
        self.outbox.push((Message::query(tid, kind.method(), args), addr));
        true
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    pub fn tick(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_tracker_tick) >= self.settings.tracker_tick_interval {
            self.last_tracker_tick = now;
            let (peers, items) =
                self.storage
                    .purge(now, self.settings.peer_timeout, self.settings.item_timeout);
            if peers + items > 0 {
                debug!(peers, items, "purged expired storage");
            }
        }

        if now.saturating_duration_since(self.last_key_rotation) >= self.settings.key_rotation_interval {
            self.last_key_rotation = now;
            self.tokens.rotate();
            trace!("write key rotated");
        }

        if let Some(bucket) = self
            .table
            .need_refresh(now, self.settings.bucket_refresh_interval)
        {
            self.table.touch_bucket(bucket, now);
            let target = self.own_id.random_in_bucket(bucket);
            debug!(bucket, target = %target.short(), "refreshing bucket");
            self.start_traversal(target, Purpose::FindNode { done: Box::new(|_| {}) }, false, now);
        }
    }

    pub fn connection_timeout(&mut self, now: Instant) -> Duration {
        let (events, next) = self.rpc.tick(now);
        for event in events {
            match event {
                RpcTimeout::Short(observer) => {
                    if let Some(owner) = observer.owner
                        && let Some(traversal) = self.traversals.get_mut(owner)
                    {
                        traversal.on_short_timeout(observer.addr);
                        self.drive(owner, now);
                    }
                }
                RpcTimeout::Full(observer) => {
                    trace!(addr = %observer.addr, method = observer.kind.method(), "request timed out");
                    self.observer_failed(observer, now);
                }
            }
        }
        next
    }

    pub fn unreachable(&mut self, addr: SocketAddr, now: Instant) {
        for observer in self.rpc.unreachable(addr) {
            self.observer_failed(observer, now);
        }
    }

    pub fn status(&self) -> DhtStatus {
        let (nodes, replacements) = self.table.size();
        DhtStatus {
            node_id: self.own_id,
            nodes,
            replacements,
            buckets: self.table.bucket_sizes(),
            torrents: self.storage.torrents.num_torrents(),
            peers: self.storage.torrents.num_peers(),
            immutable_items: self.storage.immutable.len(),
            mutable_items: self.storage.mutable.len(),
            signed_items: self.storage.signed.len(),
            global_nodes: self.table.num_global_nodes(),
            running_traversals: self.traversals.len(),
            outstanding_rpcs: self.rpc.num_outstanding(),
        }
    }

    fn take_pending(&mut self) -> (Vec<(Message, SocketAddr)>, Vec<Completion>) {
        (
            std::mem::take(&mut self.outbox),
            std::mem::take(&mut self.completions),
        )
    }
}

// ============================================================================
// Reply parsing helpers
// ============================================================================

fn id_arg(value: Option<&Value>) -> Result<NodeId, RequestError> {
    value
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice)
        .ok_or_else(|| RequestError::Protocol("invalid id".into()))
}

fn int_flag(value: Option<&Value>) -> bool {
    value.and_then(Value::as_int).is_some_and(|v| v != 0)
}

fn signed_item_dict(item: &SignedStorageItem) -> Dict {
    let mut d = Dict::new();
    d.insert("p".into(), Value::Bytes(item.payload.clone()));
    d.insert("sig_p".into(), Value::Bytes(item.payload_signature.clone()));
    d.insert("sig_user".into(), Value::from(item.user_signature.as_str()));
    d
}

fn signed_item_from_dict(dict: &Dict) -> Option<SignedStorageItem> {
    let parsed = schema::verify_message(dict, schema::SIGNED_ITEM).ok()?;
    Some(SignedStorageItem {
        payload: parsed[0]?.as_bytes()?.to_vec(),
        payload_signature: parsed[1]?.as_bytes()?.to_vec(),
        user_signature: String::from_utf8(parsed[2]?.as_bytes()?.to_vec()).ok()?,
    })
}

/// Turn a validated `put` into a storage request.
fn parse_put(parsed: &[Option<&Value>]) -> Result<PutRequest, RequestError> {
    let bytes = |i: usize| parsed[i].and_then(Value::as_bytes);

    if parsed[7].is_some() {
        let item = SignedStorageItem {
            payload: bytes(8).unwrap_or_default().to_vec(),
            payload_signature: bytes(9).unwrap_or_default().to_vec(),
            user_signature: String::from_utf8(bytes(10).unwrap_or_default().to_vec())
                .map_err(|_| RequestError::Put(PutError::BadSignature))?,
        };
        let payload = item.decode_payload()?;
        return Ok(PutRequest::Signed { item, payload });
    }

    let value = bytes(2)
        .ok_or_else(|| RequestError::Protocol("missing 'v' key".into()))?
        .to_vec();

    let Some(public_key) = bytes(3) else {
        return Ok(PutRequest::Immutable { value });
    };
    let public_key: [u8; PUBLIC_KEY_LEN] = public_key
        .try_into()
        .map_err(|_| RequestError::Protocol("invalid value for 'k'".into()))?;
    let signature: [u8; SIGNATURE_LEN] = bytes(4)
        .ok_or_else(|| RequestError::Protocol("missing 'sig' key".into()))?
        .try_into()
        .map_err(|_| RequestError::Protocol("invalid value for 'sig'".into()))?;
    let seq = parsed[5]
        .and_then(Value::as_int)
        .and_then(|s| u64::try_from(s).ok())
        .ok_or_else(|| RequestError::Protocol("missing 'seq' key".into()))?;
    let salt = bytes(6).unwrap_or_default().to_vec();

    Ok(PutRequest::Mutable {
        value,
        public_key,
        signature,
        seq,
        salt,
    })
}

fn collect_peers(reply: &Dict, peers: &mut BTreeSet<SocketAddr>) {
    let Some(values) = reply.get("values").and_then(Value::as_list) else {
        return;
    };
    peers.extend(
        values
            .iter()
            .filter_map(Value::as_bytes)
            .filter_map(messages::read_compact_addr),
    );
}

fn collect_items(reply: &Dict, target: &NodeId, items: &mut Vec<StoredSigned>, max: usize) {
    let Some(values) = reply.get("values").and_then(Value::as_list) else {
        return;
    };
    for value in values.iter().filter_map(Value::as_dict) {
        let Some(item) = signed_item_from_dict(value) else {
            continue;
        };
        let Ok(payload) = item.verify() else {
            trace!("discarding item with bad signature");
            continue;
        };
        if payload.key() != *target {
            continue;
        }
        if items
            .iter()
            .any(|s| s.item.payload_signature == item.payload_signature)
        {
            continue;
        }
        if !payload.multi {
            // One slot: keep only the highest sequence seen.
            if items.iter().any(|s| s.payload.seq >= payload.seq) {
                continue;
            }
            items.clear();
        }
        items.push(StoredSigned { item, payload });
    }
    items.sort_by_key(|s| s.payload.time);
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Thread-safe DHT node over a [`Transport`].
pub struct DhtNode<T: Transport> {
    state: Mutex<NodeState>,
    transport: T,
}

impl<T: Transport> DhtNode<T> {
    pub fn new(own_id: NodeId, settings: DhtSettings, transport: T) -> Self {
        info!(node = %own_id.short(), "dht node created");
        Self {
            state: Mutex::new(NodeState::new(own_id, settings, Instant::now())),
            transport,
        }
    }

    pub fn with_random_id(settings: DhtSettings, transport: T) -> Self {
        Self::new(NodeId::random(), settings, transport)
    }

    pub fn own_id(&self) -> NodeId {
        self.state.lock().own_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `f` under the lock, then send its messages and run completions.
    fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let (result, outbox, completions) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            let (outbox, completions) = state.take_pending();
            (result, outbox, completions)
        };
        for (message, addr) in outbox {
            if let Err(e) = self.transport.send(&message, addr) {
                debug!(addr = %addr, method = message.kind_name(), error = %e, "send failed");
            }
        }
        for completion in completions {
            completion();
        }
        result
    }

    pub fn incoming(&self, message: &Message, from: SocketAddr) {
        self.incoming_at(message, from, Instant::now());
    }

    pub fn incoming_at(&self, message: &Message, from: SocketAddr, now: Instant) {
        self.with_state(|s| s.incoming(message, from, now));
    }

    /// Answer a query without sending anything.
    pub fn incoming_request(
        &self,
        method: &str,
        args: &Dict,
        from: SocketAddr,
    ) -> Result<Dict, RequestError> {
        self.with_state(|s| s.incoming_request(method, args, from, Instant::now()))
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    pub fn add_router_node(&self, addr: SocketAddr) {
        self.with_state(|s| s.table.add_router_node(addr));
    }

    /// Ping `addr`; the node is inserted if it answers.
    pub fn add_node(&self, addr: SocketAddr) {
        self.with_state(|s| {
            s.send_query(None, ObserverKind::Ping, addr, None, Dict::new(), Instant::now());
        });
    }

    /// Join the network through `routers`; `done` gets the closest nodes found.
    pub fn bootstrap(
        &self,
        routers: &[SocketAddr],
        done: impl FnOnce(Vec<(NodeId, SocketAddr)>) + Send + 'static,
    ) -> TraversalId {
        let done: NodesCallback = Box::new(done);
        self.with_state(|s| {
            for router in routers {
                s.table.add_router_node(*router);
            }
            let target = s.own_id;
            s.start_traversal(target, Purpose::FindNode { done }, true, Instant::now())
        })
    }

    /// Look up the nodes closest to `target`.
    pub fn refresh(
        &self,
        target: NodeId,
        done: impl FnOnce(Vec<(NodeId, SocketAddr)>) + Send + 'static,
    ) -> TraversalId {
        let done: NodesCallback = Box::new(done);
        self.with_state(|s| {
            s.start_traversal(target, Purpose::FindNode { done }, false, Instant::now())
        })
    }

    pub fn routing_table_contains(&self, id: &NodeId) -> bool {
        self.state.lock().table.contains(id)
    }

    pub fn bucket_size(&self, bucket: usize) -> usize {
        self.state.lock().table.bucket_size(bucket)
    }

    /// Nodes waiting in `bucket`'s replacement cache, oldest first.
    pub fn replacement_cache(&self, bucket: usize) -> Vec<(NodeId, SocketAddr)> {
        self.state
            .lock()
            .table
            .replacement_cache(bucket)
            .iter()
            .map(|e| (e.id, e.addr))
            .collect()
    }

    /// `(live nodes, replacement nodes)`.
    pub fn size(&self) -> (usize, usize) {
        self.state.lock().table.size()
    }

    pub fn num_global_nodes(&self) -> u64 {
        self.state.lock().table.num_global_nodes()
    }

    pub fn branch_factor(&self) -> usize {
        self.state.lock().settings.search_branching
    }

    // ------------------------------------------------------------------------
    // Peers and data
    // ------------------------------------------------------------------------

    /// Find peers for `info_hash` and announce ourselves on `port` (0 = use
    /// the UDP source port). `done` gets the peers found.
    pub fn announce(
        &self,
        info_hash: NodeId,
        port: u16,
        seed: bool,
        done: impl FnOnce(Vec<SocketAddr>) + Send + 'static,
    ) -> TraversalId {
        let done: PeersCallback = Box::new(done);
        self.with_state(|s| {
            let purpose = Purpose::Announce {
                port,
                seed,
                peers: BTreeSet::new(),
                done,
            };
            s.start_traversal(info_hash, purpose, false, Instant::now())
        })
    }

    /// Collect the signed items stored under `(username, resource, multi)`.
    pub fn get_data(
        &self,
        username: &str,
        resource: &str,
        multi: bool,
        done: impl FnOnce(Vec<StoredSigned>) + Send + 'static,
    ) -> TraversalId {
        let done: ItemsCallback = Box::new(done);
        let target = data_key(username, resource, multi);
        self.with_state(|s| {
            let purpose = Purpose::GetData {
                items: Vec::new(),
                done,
            };
            s.start_traversal(target, purpose, false, Instant::now())
        })
    }

    /// Sign a value and store it on the nodes closest to its key. `done`
    /// gets the number of nodes that accepted it.
    #[allow(clippy::too_many_arguments)]
    pub fn put_data(
        &self,
        username: &str,
        resource: &str,
        multi: bool,
        value: Vec<u8>,
        signer: &Keypair,
        time: u64,
        seq: u64,
        done: impl FnOnce(usize) + Send + 'static,
    ) -> anyhow::Result<TraversalId> {
        let payload = DataPayload {
            username: username.to_string(),
            resource: resource.to_string(),
            multi,
            value,
            seq,
            time,
        };
        let item = payload.sign(signer)?;
        item.verify_signature(&payload)
            .map_err(|e| anyhow::anyhow!("signer cannot write this key: {e}"))?;
        let target = payload.key();
        let done: StoredCallback = Box::new(done);
        Ok(self.with_state(|s| {
            s.start_traversal(target, Purpose::PutData { item, done }, false, Instant::now())
        }))
    }

    pub fn num_torrents(&self) -> usize {
        self.state.lock().storage.torrents.num_torrents()
    }

    pub fn num_peers(&self) -> usize {
        self.state.lock().storage.torrents.num_peers()
    }

    /// Stored items across the immutable, mutable and signed tables.
    pub fn data_size(&self) -> usize {
        self.state.lock().storage.data_size()
    }

    // ------------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------------

    pub fn generate_token(&self, addr: IpAddr, target: &NodeId) -> WriteToken {
        self.state.lock().tokens.generate(addr, target)
    }

    pub fn verify_token(&self, token: &[u8], addr: IpAddr, target: &NodeId) -> bool {
        self.state.lock().tokens.verify(token, addr, target)
    }

    pub fn new_write_key(&self) {
        self.state.lock().tokens.rotate();
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&self, now: Instant) {
        self.with_state(|s| s.tick(now));
    }

    /// Expire overdue requests; returns how long until the next deadline.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout_at(Instant::now())
    }

    pub fn connection_timeout_at(&self, now: Instant) -> Duration {
        self.with_state(|s| s.connection_timeout(now))
    }

    /// Fail every request outstanding to `addr` now.
    pub fn unreachable(&self, addr: SocketAddr) {
        self.with_state(|s| s.unreachable(addr, Instant::now()));
    }

    pub fn status(&self) -> DhtStatus {
        self.state.lock().status()
    }

    /// Stop a traversal. Its callback never runs and late replies are dropped.
    pub fn cancel(&self, id: TraversalId) -> bool {
        self.with_state(|s| s.traversals.remove(id).is_some())
    }

    /// Cancel all traversals, then drop outstanding requests and stored data.
    pub fn shutdown(&self) {
        self.with_state(|s| {
            let cancelled = s.traversals.drain().len();
            let aborted = s.rpc.abort_all();
            s.storage.clear();
            s.outbox.clear();
            info!(cancelled, aborted, "dht node shut down");
        });
    }
}
