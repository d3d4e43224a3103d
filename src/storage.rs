//! # Storage Tables
//!
//! Four bounded tables back the query handlers:
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | torrents | info-hash | [`TorrentEntry`] (peer set) |
//! | immutable | `hash_of(v)` | [`ImmutableItem`] |
//! | mutable | `hash_of(k \|\| salt)` | [`MutableItem`] |
//! | signed | `hash_of(user \0 resource \0 m\|s)` | [`SignedStorageEntry`] |
//!
//! ## Eviction
//!
//! Item tables evict the least popular entry when a new key arrives at
//! capacity. Popularity decays with age:
//!
//! ```text
//! score = announcer_count * H / (H + age_secs)      H = 600
//! ```
//!
//! Ties go to the entry seen longest ago. The most recently touched entry is
//! never the victim while another candidate exists. The torrent table evicts
//! the torrent with the fewest peers; each torrent drops its oldest peer once
//! `max_peers_per_torrent` is reached.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bincode::Options;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bloom::{AnnouncerFilter, ScrapeFilter};
use crate::config::{DhtSettings, MAX_ITEM_SIZE, MAX_SALT_SIZE};
use crate::crypto::{
    self, Keypair, MUTABLE_ITEM_DOMAIN, PUBLIC_KEY_LEN, SIGNATURE_LEN, SIGNED_DATA_DOMAIN,
};
use crate::id::NodeId;

/// Popularity half-life in seconds.
const POPULARITY_HALF_LIFE_SECS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PutError {
    #[error("message too big")]
    TooBig,
    #[error("salt too big")]
    SaltTooBig,
    #[error("invalid signature")]
    BadSignature,
    #[error("sequence number less than current")]
    StaleSequence,
    #[error("value does not match stored value")]
    ValueMismatch,
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error("storage full")]
    StorageFull,
}

// ============================================================================
// Popularity bookkeeping
// ============================================================================

/// Who has stored an item and when it was last refreshed.
#[derive(Clone, Debug)]
pub struct Announcers {
    filter: AnnouncerFilter,
    pub count: u32,
    pub last_seen: Instant,
}

impl Announcers {
    pub fn new(ip: IpAddr, now: Instant) -> Self {
        let mut filter = AnnouncerFilter::new();
        filter.insert_bytes(&ip_bytes(ip));
        Self {
            filter,
            count: 1,
            last_seen: now,
        }
    }

    /// Refresh `last_seen`; count the announcer only if its IP is new.
    pub fn touch(&mut self, ip: IpAddr, now: Instant) {
        let bytes = ip_bytes(ip);
        if !self.filter.contains_bytes(&bytes) {
            self.filter.insert_bytes(&bytes);
            self.count = self.count.saturating_add(1);
        }
        self.last_seen = now;
    }

    pub fn score(&self, now: Instant) -> f64 {
        let age = now.saturating_duration_since(self.last_seen).as_secs_f64();
        self.count as f64 * POPULARITY_HALF_LIFE_SECS / (POPULARITY_HALF_LIFE_SECS + age)
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub trait Popular {
    fn announcers(&self) -> &Announcers;
}

// ============================================================================
// Item types
// ============================================================================

#[derive(Clone, Debug)]
pub struct ImmutableItem {
    pub value: Vec<u8>,
    pub announcers: Announcers,
}

#[derive(Clone, Debug)]
pub struct MutableItem {
    pub value: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
    pub seq: u64,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: Vec<u8>,
    pub announcers: Announcers,
}

/// One signed record as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedStorageItem {
    /// bincode-encoded [`DataPayload`].
    pub payload: Vec<u8>,
    pub payload_signature: Vec<u8>,
    /// Hex public key of the signer.
    pub user_signature: String,
}

#[derive(Clone, Debug)]
pub struct SignedStorageEntry {
    pub items: Vec<StoredSigned>,
    pub announcers: Announcers,
}

/// A verified signed item together with its decoded payload.
#[derive(Clone, Debug)]
pub struct StoredSigned {
    pub item: SignedStorageItem,
    pub payload: DataPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub username: String,
    pub resource: String,
    pub multi: bool,
    pub value: Vec<u8>,
    pub seq: u64,
    /// Unix seconds chosen by the writer.
    pub time: u64,
}

impl Popular for ImmutableItem {
    fn announcers(&self) -> &Announcers {
        &self.announcers
    }
}

impl Popular for MutableItem {
    fn announcers(&self) -> &Announcers {
        &self.announcers
    }
}

impl Popular for SignedStorageEntry {
    fn announcers(&self) -> &Announcers {
        &self.announcers
    }
}

/// Storage key of a mutable item.
pub fn mutable_key(public_key: &[u8], salt: &[u8]) -> NodeId {
    NodeId::hash_parts(&[public_key, salt])
}

/// Bytes covered by a mutable item signature.
pub fn mutable_signing_bytes(salt: &[u8], seq: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + salt.len() + 8 + value.len());
    out.extend_from_slice(&(salt.len() as u32).to_be_bytes());
    out.extend_from_slice(salt);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Storage key of a signed data resource.
pub fn data_key(username: &str, resource: &str, multi: bool) -> NodeId {
    let kind: &[u8] = if multi { b"m" } else { b"s" };
    NodeId::hash_parts(&[username.as_bytes(), &[0], resource.as_bytes(), &[0], kind])
}

impl DataPayload {
    pub fn key(&self) -> NodeId {
        data_key(&self.username, &self.resource, self.multi)
    }

    /// Encode and sign the payload with `signer`.
    pub fn sign(&self, signer: &Keypair) -> Result<SignedStorageItem, bincode::Error> {
        let payload = bincode::serialize(self)?;
        let signature = crypto::sign_with_domain(signer, SIGNED_DATA_DOMAIN, &payload);
        Ok(SignedStorageItem {
            payload,
            payload_signature: signature.to_vec(),
            user_signature: signer.public_key_hex(),
        })
    }
}

impl SignedStorageItem {
    /// Decode the payload and check its signature against `user_signature`.
    pub fn verify(&self) -> Result<DataPayload, PutError> {
        let payload = self.decode_payload()?;
        self.verify_signature(&payload)?;
        Ok(payload)
    }

    /// Decode the payload without checking the signature.
    pub fn decode_payload(&self) -> Result<DataPayload, PutError> {
        let payload: DataPayload = bincode::DefaultOptions::new()
            .with_limit(crate::messages::MAX_MESSAGE_SIZE)
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .deserialize(&self.payload)
            .map_err(|_| PutError::InvalidPayload("undecodable payload"))?;
        if payload.value.len() > MAX_ITEM_SIZE {
            return Err(PutError::TooBig);
        }
        Ok(payload)
    }

    /// Check the signature over the payload, and for single-slot keys that
    /// the signer owns the key.
    pub fn verify_signature(&self, payload: &DataPayload) -> Result<(), PutError> {
        let public_key =
            hex::decode(&self.user_signature).map_err(|_| PutError::BadSignature)?;
        crypto::verify_with_domain(
            &public_key,
            SIGNED_DATA_DOMAIN,
            &self.payload,
            &self.payload_signature,
        )
        .map_err(|_| PutError::BadSignature)?;
        if !payload.multi && payload.username != self.user_signature {
            return Err(PutError::BadSignature);
        }
        Ok(())
    }
}

// ============================================================================
// Bounded item table
// ============================================================================

pub struct ItemTable<V> {
    entries: HashMap<NodeId, V>,
    capacity: usize,
    last_touched: Option<NodeId>,
}

impl<V: Popular> ItemTable<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            last_touched: None,
        }
    }

    pub fn get(&self, key: &NodeId) -> Option<&V> {
        self.entries.get(key)
    }

    /// Mutable access to a stored entry; marks it as the last one touched.
    pub fn get_mut(&mut self, key: &NodeId) -> Option<&mut V> {
        let entry = self.entries.get_mut(key)?;
        self.last_touched = Some(*key);
        Some(entry)
    }

    /// Insert a new entry, evicting the least popular one when full.
    /// `false` if there was no room and nothing could be evicted.
    pub fn insert(&mut self, key: NodeId, value: V, now: Instant) -> bool {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let Some(victim) = self.eviction_candidate(now) else {
                return false;
            };
            self.entries.remove(&victim);
            debug!(key = %victim.short(), "evicted least popular item");
        }
        self.entries.insert(key, value);
        self.last_touched = Some(key);
        true
    }

    fn eviction_candidate(&self, now: Instant) -> Option<NodeId> {
        let protected = if self.entries.len() > 1 {
            self.last_touched
        } else {
            None
        };
        self.entries
            .iter()
            .filter(|(key, _)| Some(**key) != protected)
            .min_by(|(_, a), (_, b)| {
                let (a, b) = (a.announcers(), b.announcers());
                a.score(now)
                    .partial_cmp(&b.score(now))
                    .unwrap_or(Ordering::Equal)
                    .then(a.last_seen.cmp(&b.last_seen))
            })
            .map(|(key, _)| *key)
    }

    /// Drop entries not refreshed within `timeout`; returns how many went.
    pub fn purge(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, v| now.saturating_duration_since(v.announcers().last_seen) < timeout);
        if let Some(key) = self.last_touched
            && !self.entries.contains_key(&key)
        {
            self.last_touched = None;
        }
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_touched = None;
    }
}

// ============================================================================
// Torrents
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub added: Instant,
    pub seed: bool,
}

impl PartialEq for PeerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerEntry {}

impl PartialOrd for PeerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .ip()
            .cmp(&other.addr.ip())
            .then(self.addr.port().cmp(&other.addr.port()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct TorrentEntry {
    pub name: Option<String>,
    pub peers: BTreeSet<PeerEntry>,
}

impl TorrentEntry {
    fn add_peer(&mut self, peer: PeerEntry, max_peers: usize) {
        if !self.peers.contains(&peer)
            && self.peers.len() >= max_peers
            && let Some(oldest) = self.peers.iter().min_by_key(|p| p.added).copied()
        {
            self.peers.remove(&oldest);
        }
        self.peers.replace(peer);
    }

    /// When the newest peer was announced.
    pub fn last_announce(&self) -> Option<Instant> {
        self.peers.iter().map(|p| p.added).max()
    }

    /// Peer count decayed by the age of the newest announce.
    fn score(&self, now: Instant) -> f64 {
        let Some(last) = self.last_announce() else {
            return 0.0;
        };
        let age = now.saturating_duration_since(last).as_secs_f64();
        self.peers.len() as f64 * POPULARITY_HALF_LIFE_SECS / (POPULARITY_HALF_LIFE_SECS + age)
    }
}

/// Options of one `get_peers` lookup against local storage.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerQuery {
    pub noseed: bool,
    pub scrape: bool,
}

pub enum PeerReply {
    Peers(Vec<SocketAddr>),
    Scrape {
        seeds: ScrapeFilter,
        downloaders: ScrapeFilter,
    },
}

pub struct TorrentTable {
    torrents: HashMap<NodeId, TorrentEntry>,
    max_torrents: usize,
    max_peers: usize,
    last_announced: Option<NodeId>,
}

impl TorrentTable {
    pub fn new(max_torrents: usize, max_peers: usize) -> Self {
        Self {
            torrents: HashMap::new(),
            max_torrents,
            max_peers,
            last_announced: None,
        }
    }

    pub fn announce(
        &mut self,
        info_hash: NodeId,
        addr: SocketAddr,
        seed: bool,
        name: Option<String>,
        now: Instant,
    ) {
        if !self.torrents.contains_key(&info_hash) && self.torrents.len() >= self.max_torrents {
            match self.eviction_candidate(now) {
                Some(victim) => {
                    self.torrents.remove(&victim);
                    debug!(info_hash = %victim.short(), "evicted least popular torrent");
                }
                None => return,
            }
        }
        self.last_announced = Some(info_hash);

        let torrent = self.torrents.entry(info_hash).or_default();
        if torrent.name.is_none() {
            torrent.name = name;
        }
        torrent.add_peer(
            PeerEntry {
                addr,
                added: now,
                seed,
            },
            self.max_peers,
        );
    }

    /// Lowest score wins, ties go to the older last announce. The torrent
    /// announced last is kept while another candidate exists.
    fn eviction_candidate(&self, now: Instant) -> Option<NodeId> {
        let protected = if self.torrents.len() > 1 {
            self.last_announced
        } else {
            None
        };
        self.torrents
            .iter()
            .filter(|(key, _)| Some(**key) != protected)
            .min_by(|(_, a), (_, b)| {
                a.score(now)
                    .partial_cmp(&b.score(now))
                    .unwrap_or(Ordering::Equal)
                    .then(a.last_announce().cmp(&b.last_announce()))
            })
            .map(|(key, _)| *key)
    }

    /// Peers for a `get_peers` reply; `None` when nothing is stored.
    pub fn peers(&self, info_hash: &NodeId, query: PeerQuery, max: usize) -> Option<PeerReply> {
        let torrent = self.torrents.get(info_hash)?;
        if torrent.peers.is_empty() {
            return None;
        }

        if query.scrape {
            let mut seeds = ScrapeFilter::new();
            let mut downloaders = ScrapeFilter::new();
            for peer in &torrent.peers {
                let bytes = ip_bytes(peer.addr.ip());
                if peer.seed {
                    seeds.insert_bytes(&bytes);
                } else {
                    downloaders.insert_bytes(&bytes);
                }
            }
            return Some(PeerReply::Scrape { seeds, downloaders });
        }

        let mut rng = rand::thread_rng();
        let sample = torrent
            .peers
            .iter()
            .filter(|p| !(query.noseed && p.seed))
            .map(|p| p.addr)
            .choose_multiple(&mut rng, max);
        Some(PeerReply::Peers(sample))
    }

    pub fn get(&self, info_hash: &NodeId) -> Option<&TorrentEntry> {
        self.torrents.get(info_hash)
    }

    /// Drop peers older than `timeout`. Emptied torrents are kept.
    pub fn purge(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut removed = 0;
        for torrent in self.torrents.values_mut() {
            let before = torrent.peers.len();
            torrent
                .peers
                .retain(|p| now.saturating_duration_since(p.added) < timeout);
            removed += before - torrent.peers.len();
        }
        removed
    }

    pub fn num_torrents(&self) -> usize {
        self.torrents.len()
    }

    pub fn num_peers(&self) -> usize {
        self.torrents.values().map(|t| t.peers.len()).sum()
    }

    pub fn clear(&mut self) {
        self.torrents.clear();
        self.last_announced = None;
    }
}

// ============================================================================
// Put requests
// ============================================================================

/// A validated `put` query, before its token has been checked.
#[derive(Clone, Debug)]
pub enum PutRequest {
    Immutable {
        value: Vec<u8>,
    },
    Mutable {
        value: Vec<u8>,
        public_key: [u8; PUBLIC_KEY_LEN],
        signature: [u8; SIGNATURE_LEN],
        seq: u64,
        salt: Vec<u8>,
    },
    Signed {
        item: SignedStorageItem,
        payload: DataPayload,
    },
}

impl PutRequest {
    pub fn target(&self) -> NodeId {
        match self {
            PutRequest::Immutable { value } => NodeId::hash_of(value),
            PutRequest::Mutable {
                public_key, salt, ..
            } => mutable_key(public_key, salt),
            PutRequest::Signed { payload, .. } => payload.key(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

pub struct Storage {
    pub torrents: TorrentTable,
    pub immutable: ItemTable<ImmutableItem>,
    pub mutable: ItemTable<MutableItem>,
    pub signed: ItemTable<SignedStorageEntry>,
    max_multi_values: usize,
}

impl Storage {
    pub fn new(settings: &DhtSettings) -> Self {
        Self {
            torrents: TorrentTable::new(settings.max_torrents, settings.max_peers_per_torrent),
            immutable: ItemTable::new(settings.max_dht_items),
            mutable: ItemTable::new(settings.max_dht_items),
            signed: ItemTable::new(settings.max_dht_items),
            max_multi_values: settings.max_multi_values,
        }
    }

    /// Apply a put. The caller has already verified the write token.
    pub fn put(&mut self, request: PutRequest, from: IpAddr, now: Instant) -> Result<NodeId, PutError> {
        let target = request.target();
        match request {
            PutRequest::Immutable { value } => self.put_immutable(target, value, from, now)?,
            PutRequest::Mutable {
                value,
                public_key,
                signature,
                seq,
                salt,
            } => self.put_mutable(target, value, public_key, signature, seq, salt, from, now)?,
            PutRequest::Signed { item, payload } => {
                self.put_signed(target, item, payload, from, now)?
            }
        }
        Ok(target)
    }

    fn put_immutable(
        &mut self,
        target: NodeId,
        value: Vec<u8>,
        from: IpAddr,
        now: Instant,
    ) -> Result<(), PutError> {
        if value.len() > MAX_ITEM_SIZE {
            return Err(PutError::TooBig);
        }
        if let Some(existing) = self.immutable.get_mut(&target) {
            if existing.value != value {
                return Err(PutError::ValueMismatch);
            }
            existing.announcers.touch(from, now);
            return Ok(());
        }
        if !self.immutable.insert(
            target,
            ImmutableItem {
                value,
                announcers: Announcers::new(from, now),
            },
            now,
        ) {
            return Err(PutError::StorageFull);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn put_mutable(
        &mut self,
        target: NodeId,
        value: Vec<u8>,
        public_key: [u8; PUBLIC_KEY_LEN],
        signature: [u8; SIGNATURE_LEN],
        seq: u64,
        salt: Vec<u8>,
        from: IpAddr,
        now: Instant,
    ) -> Result<(), PutError> {
        if value.len() > MAX_ITEM_SIZE {
            return Err(PutError::TooBig);
        }
        if salt.len() > MAX_SALT_SIZE {
            return Err(PutError::SaltTooBig);
        }
        crypto::verify_with_domain(
            &public_key,
            MUTABLE_ITEM_DOMAIN,
            &mutable_signing_bytes(&salt, seq, &value),
            &signature,
        )
        .map_err(|_| PutError::BadSignature)?;

        if let Some(existing) = self.mutable.get_mut(&target) {
            if existing.public_key != public_key {
                return Err(PutError::BadSignature);
            }
            if seq < existing.seq {
                return Err(PutError::StaleSequence);
            }
            existing.value = value;
            existing.signature = signature;
            existing.seq = seq;
            existing.announcers.touch(from, now);
            return Ok(());
        }
        if !self.mutable.insert(
            target,
            MutableItem {
                value,
                signature,
                seq,
                public_key,
                salt,
                announcers: Announcers::new(from, now),
            },
            now,
        ) {
            return Err(PutError::StorageFull);
        }
        Ok(())
    }

    fn put_signed(
        &mut self,
        target: NodeId,
        item: SignedStorageItem,
        payload: DataPayload,
        from: IpAddr,
        now: Instant,
    ) -> Result<(), PutError> {
        let stored = StoredSigned { item, payload };
        if let Some(entry) = self.signed.get_mut(&target) {
            if stored.payload.multi {
                if let Some(same) = entry
                    .items
                    .iter_mut()
                    .find(|s| s.item.payload_signature == stored.item.payload_signature)
                {
                    *same = stored;
                } else {
                    entry.items.push(stored);
                    entry.items.sort_by_key(|s| s.payload.time);
                    while entry.items.len() > self.max_multi_values {
                        entry.items.remove(0);
                    }
                }
            } else {
                if let Some(current) = entry.items.first()
                    && stored.payload.seq < current.payload.seq
                {
                    return Err(PutError::StaleSequence);
                }
                entry.items = vec![stored];
            }
            entry.announcers.touch(from, now);
            return Ok(());
        }
        if !self.signed.insert(
            target,
            SignedStorageEntry {
                items: vec![stored],
                announcers: Announcers::new(from, now),
            },
            now,
        ) {
            return Err(PutError::StorageFull);
        }
        Ok(())
    }

    /// Expire stale peers and items; returns `(peers, items)` removed.
    pub fn purge(&mut self, now: Instant, peer_timeout: Duration, item_timeout: Duration) -> (usize, usize) {
        let peers = self.torrents.purge(now, peer_timeout);
        let items = self.immutable.purge(now, item_timeout)
            + self.mutable.purge(now, item_timeout)
            + self.signed.purge(now, item_timeout);
        (peers, items)
    }

    /// Total number of stored items across the three item tables.
    pub fn data_size(&self) -> usize {
        self.immutable.len() + self.mutable.len() + self.signed.len()
    }

    pub fn clear(&mut self) {
        self.torrents.clear();
        self.immutable.clear();
        self.mutable.clear();
        self.signed.clear();
    }
}
