//! Node settings.
//!
//! [`DhtSettings::default`] gives a node tuned like a mainline DHT client.
//! Every field can be overridden from a serialized config or the CLI.

use std::time::Duration;

use serde::Deserialize;

// ============================================================================
// Protocol limits
// ============================================================================

/// Largest immutable or mutable item value accepted by `put`.
pub const MAX_ITEM_SIZE: usize = 1000;

/// Largest salt accepted for mutable items.
pub const MAX_SALT_SIZE: usize = 64;

/// Bytes of a write token on the wire.
pub const TOKEN_LEN: usize = 8;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_BUCKET_SIZE: usize = 8;
pub const DEFAULT_SEARCH_BRANCHING: usize = 5;
pub const DEFAULT_MAX_FAIL_COUNT: u8 = 20;
pub const DEFAULT_MAX_REPLACEMENTS: usize = 8;
pub const DEFAULT_MAX_TRAVERSAL_RESULTS: usize = 100;

pub const DEFAULT_MAX_TORRENTS: usize = 2000;
pub const DEFAULT_MAX_DHT_ITEMS: usize = 700;
pub const DEFAULT_MAX_PEERS_PER_TORRENT: usize = 500;
pub const DEFAULT_MAX_PEERS_REPLY: usize = 100;
pub const DEFAULT_MAX_MULTI_VALUES: usize = 32;

pub const DEFAULT_RPC_SHORT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(45 * 60);
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_TRACKER_TICK_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_BLOCK_RATELIMIT: u32 = 5;
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    // ========================================================================
    // Routing
    // ========================================================================
    /// K - nodes per bucket and nodes returned per `find_node`.
    pub bucket_size: usize,
    /// Replacement-cache entries kept per bucket.
    pub max_replacements: usize,
    /// Consecutive failures before a node is dropped.
    pub max_fail_count: u8,
    /// A non-empty bucket untouched this long gets refreshed.
    pub bucket_refresh_interval: Duration,

    // ========================================================================
    // Traversals
    // ========================================================================
    /// Alpha - parallel requests per lookup.
    pub search_branching: usize,
    pub max_traversal_results: usize,
    /// After this, a slow request no longer occupies a branch slot.
    pub rpc_short_timeout: Duration,
    /// After this, a request is failed.
    pub rpc_timeout: Duration,

    // ========================================================================
    // Storage
    // ========================================================================
    pub max_torrents: usize,
    /// Capacity of each item table (immutable, mutable, signed).
    pub max_dht_items: usize,
    pub max_peers_per_torrent: usize,
    /// Peers returned by one `get_peers` reply.
    pub max_peers_reply: usize,
    /// Entries kept under one multi-valued signed key.
    pub max_multi_values: usize,
    pub peer_timeout: Duration,
    pub item_timeout: Duration,

    // ========================================================================
    // Maintenance
    // ========================================================================
    pub tracker_tick_interval: Duration,
    pub key_rotation_interval: Duration,

    // ========================================================================
    // Flood protection (service only)
    // ========================================================================
    /// Messages per second one IP may send before being blocked.
    pub block_ratelimit: u32,
    pub block_timeout: Duration,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
            max_fail_count: DEFAULT_MAX_FAIL_COUNT,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,

            search_branching: DEFAULT_SEARCH_BRANCHING,
            max_traversal_results: DEFAULT_MAX_TRAVERSAL_RESULTS,
            rpc_short_timeout: DEFAULT_RPC_SHORT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,

            max_torrents: DEFAULT_MAX_TORRENTS,
            max_dht_items: DEFAULT_MAX_DHT_ITEMS,
            max_peers_per_torrent: DEFAULT_MAX_PEERS_PER_TORRENT,
            max_peers_reply: DEFAULT_MAX_PEERS_REPLY,
            max_multi_values: DEFAULT_MAX_MULTI_VALUES,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            item_timeout: DEFAULT_ITEM_TIMEOUT,

            tracker_tick_interval: DEFAULT_TRACKER_TICK_INTERVAL,
            key_rotation_interval: DEFAULT_KEY_ROTATION_INTERVAL,

            block_ratelimit: DEFAULT_BLOCK_RATELIMIT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}
