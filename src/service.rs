//! # UDP Service
//!
//! Binds a socket and drives a [`DhtNode`] from a single tokio task:
//!
//! | Event | Action |
//! |-------|--------|
//! | datagram | rate-limited per source IP, decoded, passed to [`DhtNode::incoming`] |
//! | tick interval | [`DhtNode::tick`] (bucket refresh, storage purge, key rotation) |
//! | request deadline | [`DhtNode::connection_timeout`] |
//! | shutdown | loop exits, then [`DhtNode::shutdown`] |
//!
//! Undecodable datagrams are dropped without a reply.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DhtSettings;
use crate::id::NodeId;
use crate::messages::{self, MAX_MESSAGE_SIZE};
use crate::node::DhtNode;
use crate::transport::UdpTransport;

/// How often [`DhtNode::tick`] runs.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Source IPs tracked by the DoS blocker.
const MAX_TRACKED_IPS: usize = 1024;

// ============================================================================
// DoS blocker
// ============================================================================

struct IpRate {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Per-IP packet rate limiter. An IP exceeding `limit` packets per second
/// is ignored for `block_timeout`.
pub struct DosBlocker {
    ips: LruCache<IpAddr, IpRate>,
    limit: u32,
    block_timeout: Duration,
}

impl DosBlocker {
    pub fn new(limit: u32, block_timeout: Duration) -> Self {
        Self {
            ips: LruCache::new(NonZeroUsize::new(MAX_TRACKED_IPS).unwrap_or(NonZeroUsize::MIN)),
            limit,
            block_timeout,
        }
    }

    /// Count a packet from `ip`. `false` means drop it.
    pub fn incoming(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let entry = self.ips.get_or_insert_mut(ip, || IpRate {
            window_start: now,
            count: 0,
            blocked_until: None,
        });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            entry.blocked_until = None;
            entry.window_start = now;
            entry.count = 0;
        }

        if now.saturating_duration_since(entry.window_start) >= Duration::from_secs(1) {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count > self.limit {
            warn!(ip = %ip, count = entry.count, "rate limit exceeded, blocking");
            entry.blocked_until = Some(now + self.block_timeout);
            return false;
        }
        true
    }

    pub fn is_blocked(&self, ip: &IpAddr, now: Instant) -> bool {
        self.ips
            .peek(ip)
            .and_then(|e| e.blocked_until)
            .is_some_and(|until| now < until)
    }
}

// ============================================================================
// Service
// ============================================================================

/// A running DHT node bound to a UDP socket.
pub struct DhtService {
    node: Arc<DhtNode<UdpTransport>>,
    local_addr: SocketAddr,
    quit: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DhtService {
    /// Bind `addr` and start a node with a random id.
    pub async fn bind(addr: SocketAddr, settings: DhtSettings) -> Result<Self> {
        Self::bind_with_id(addr, NodeId::random(), settings).await
    }

    pub async fn bind_with_id(addr: SocketAddr, id: NodeId, settings: DhtSettings) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?,
        );
        let transport = UdpTransport::new(socket.clone());
        let local_addr = transport.local_addr()?;
        let blocker = DosBlocker::new(settings.block_ratelimit, settings.block_timeout);
        let node = Arc::new(DhtNode::new(id, settings, transport));

        let (quit_tx, quit_rx) = oneshot::channel();
        let task = tokio::spawn(run(node.clone(), socket, blocker, quit_rx));
        info!(addr = %local_addr, node = %id.short(), "dht service listening");

        Ok(Self {
            node,
            local_addr,
            quit: Some(quit_tx),
            task: Some(task),
        })
    }

    pub fn node(&self) -> &Arc<DhtNode<UdpTransport>> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the event loop and shut the node down.
    pub async fn shutdown(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "dht service task failed");
        }
        self.node.shutdown();
    }
}

impl Drop for DhtService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    node: Arc<DhtNode<UdpTransport>>,
    socket: Arc<UdpSocket>,
    mut blocker: DosBlocker,
    mut quit: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE as usize];
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.tick().await;

    loop {
        let next_timeout = node.connection_timeout();
        tokio::select! {
            _ = &mut quit => {
                debug!("dht service shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "udp receive failed");
                        continue;
                    }
                };
                if !blocker.incoming(from.ip(), Instant::now()) {
                    continue;
                }
                match messages::decode(&buf[..len]) {
                    Ok(message) => node.incoming(&message, from),
                    Err(e) => trace!(from = %from, error = %e, "undecodable datagram"),
                }
            }
            _ = tick.tick() => node.tick(),
            _ = tokio::time::sleep(next_timeout) => {}
        }
    }
}
