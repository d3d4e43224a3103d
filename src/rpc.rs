//! # RPC Transaction Tracker
//!
//! Every outgoing query gets a 2-byte transaction id and an [`Observer`]
//! describing who is waiting for the answer. A reply is matched on the
//! transaction id *and* the address the query was sent to; anything else is
//! dropped by the caller.
//!
//! The tracker owns no clock and spawns nothing. [`RpcTracker::tick`] is
//! called with the current time and hands back the observers whose short or
//! full timeout expired, plus the delay until the next deadline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::id::NodeId;
use crate::traversal::TraversalId;

/// Transaction id length on the wire.
pub const TRANSACTION_ID_LEN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverKind {
    Ping,
    FindNode,
    GetPeers,
    Announce,
    Get,
    Put,
}

impl ObserverKind {
    pub fn method(self) -> &'static str {
        match self {
            ObserverKind::Ping => "ping",
            ObserverKind::FindNode => "find_node",
            ObserverKind::GetPeers => "get_peers",
            ObserverKind::Announce => "announce_peer",
            ObserverKind::Get => "get",
            ObserverKind::Put => "put",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Observer {
    /// Traversal waiting for this reply; `None` for standalone pings.
    pub owner: Option<TraversalId>,
    pub kind: ObserverKind,
    pub addr: SocketAddr,
    /// Expected responder id; `None` for router contacts.
    pub id: Option<NodeId>,
    sent: Instant,
    short_timeout_fired: bool,
}

impl Observer {
    pub fn new(
        owner: Option<TraversalId>,
        kind: ObserverKind,
        addr: SocketAddr,
        id: Option<NodeId>,
        now: Instant,
    ) -> Self {
        Self {
            owner,
            kind,
            addr,
            id,
            sent: now,
            short_timeout_fired: false,
        }
    }
}

#[derive(Debug)]
pub enum RpcTimeout {
    /// Still outstanding, but slow.
    Short(Observer),
    /// Given up; the observer has been removed.
    Full(Observer),
}

pub struct RpcTracker {
    pending: HashMap<u16, Observer>,
    next_tid: u16,
    short_timeout: Duration,
    timeout: Duration,
}

impl RpcTracker {
    pub fn new(short_timeout: Duration, timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            next_tid: rand::random(),
            short_timeout,
            timeout,
        }
    }

    /// Register an observer; returns the transaction id to put on the query.
    pub fn invoke(&mut self, observer: Observer) -> Option<Vec<u8>> {
        if self.pending.len() > u16::MAX as usize {
            return None;
        }
        while self.pending.contains_key(&self.next_tid) {
            self.next_tid = self.next_tid.wrapping_add(1);
        }
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        trace!(tid, method = observer.kind.method(), addr = %observer.addr, "rpc invoke");
        self.pending.insert(tid, observer);
        Some(tid.to_be_bytes().to_vec())
    }

    /// Resolve a reply or error. `None` for unknown ids or a wrong source.
    pub fn incoming(&mut self, transaction_id: &[u8], from: SocketAddr) -> Option<Observer> {
        let bytes: [u8; TRANSACTION_ID_LEN] = transaction_id.try_into().ok()?;
        let tid = u16::from_be_bytes(bytes);
        match self.pending.get(&tid) {
            Some(observer) if observer.addr == from => self.pending.remove(&tid),
            Some(observer) => {
                trace!(tid, expected = %observer.addr, got = %from, "reply from wrong address");
                None
            }
            None => None,
        }
    }

    /// Collect expired observers and return the delay until the next deadline.
    pub fn tick(&mut self, now: Instant) -> (Vec<RpcTimeout>, Duration) {
        let mut expired: Vec<u16> = Vec::new();
        let mut slow: Vec<u16> = Vec::new();
        let mut next = self.timeout;

        for (tid, observer) in &self.pending {
            let age = now.saturating_duration_since(observer.sent);
            if age >= self.timeout {
                expired.push(*tid);
                continue;
            }
            if !observer.short_timeout_fired && age >= self.short_timeout {
                slow.push(*tid);
            }
            let deadline = if observer.short_timeout_fired || age >= self.short_timeout {
                self.timeout
            } else {
                self.short_timeout
            };
            next = next.min(deadline - age);
        }

        let mut events = Vec::with_capacity(expired.len() + slow.len());
        for tid in slow {
            if let Some(observer) = self.pending.get_mut(&tid) {
                observer.short_timeout_fired = true;
                events.push(RpcTimeout::Short(observer.clone()));
            }
        }
        for tid in expired {
            if let Some(observer) = self.pending.remove(&tid) {
                events.push(RpcTimeout::Full(observer));
            }
        }
        events.sort_by_key(|e| match e {
            RpcTimeout::Short(o) | RpcTimeout::Full(o) => o.sent,
        });
        (events, next)
    }

    /// Remove every observer waiting on `addr`.
    pub fn unreachable(&mut self, addr: SocketAddr) -> Vec<Observer> {
        let tids: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, o)| o.addr == addr)
            .map(|(tid, _)| *tid)
            .collect();
        tids.into_iter()
            .filter_map(|tid| self.pending.remove(&tid))
            .collect()
    }

    /// Forget every outstanding transaction; returns how many were dropped.
    pub fn abort_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn num_outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RpcTracker {
        RpcTracker::new(Duration::from_secs(2), Duration::from_secs(15))
    }

    fn observer(addr: &str, now: Instant) -> Observer {
        Observer::new(None, ObserverKind::Ping, addr.parse().unwrap(), None, now)
    }

    #[test]
    fn reply_must_come_from_queried_address() {
        let mut rpc = tracker();
        let now = Instant::now();
        let tid = rpc.invoke(observer("10.0.0.1:1", now)).unwrap();
        assert_eq!(tid.len(), TRANSACTION_ID_LEN);

        assert!(rpc.incoming(&tid, "10.0.0.2:1".parse().unwrap()).is_none());
        assert!(rpc.incoming(&[9, 9, 9], "10.0.0.1:1".parse().unwrap()).is_none());
        assert!(rpc.incoming(&tid, "10.0.0.1:1".parse().unwrap()).is_some());
        assert!(rpc.incoming(&tid, "10.0.0.1:1".parse().unwrap()).is_none());
        assert_eq!(rpc.num_outstanding(), 0);
    }

    #[test]
    fn transaction_ids_are_distinct() {
        let mut rpc = tracker();
        let now = Instant::now();
        let a = rpc.invoke(observer("10.0.0.1:1", now)).unwrap();
        let b = rpc.invoke(observer("10.0.0.1:1", now)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn short_then_full_timeout() {
        let mut rpc = tracker();
        let now = Instant::now();
        rpc.invoke(observer("10.0.0.1:1", now)).unwrap();

        let (events, next) = rpc.tick(now);
        assert!(events.is_empty());
        assert_eq!(next, Duration::from_secs(2));

        let (events, next) = rpc.tick(now + Duration::from_secs(3));
        assert!(matches!(events.as_slice(), [RpcTimeout::Short(_)]));
        assert_eq!(next, Duration::from_secs(12));

        let (events, _) = rpc.tick(now + Duration::from_secs(4));
        assert!(events.is_empty(), "short timeout fires once");

        let (events, next) = rpc.tick(now + Duration::from_secs(15));
        assert!(matches!(events.as_slice(), [RpcTimeout::Full(_)]));
        assert_eq!(next, Duration::from_secs(15));
        assert_eq!(rpc.num_outstanding(), 0);
    }

    #[test]
    fn unreachable_fails_only_that_address() {
        let mut rpc = tracker();
        let now = Instant::now();
        rpc.invoke(observer("10.0.0.1:1", now)).unwrap();
        rpc.invoke(observer("10.0.0.1:1", now)).unwrap();
        rpc.invoke(observer("10.0.0.2:1", now)).unwrap();

        assert_eq!(rpc.unreachable("10.0.0.1:1".parse().unwrap()).len(), 2);
        assert_eq!(rpc.num_outstanding(), 1);
        assert_eq!(rpc.abort_all(), 1);
    }
}
