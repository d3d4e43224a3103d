//! # Routing Table
//!
//! 160 buckets indexed by the length of the common prefix with the local id.
//! Bucket 0 covers the far half of the keyspace, bucket 159 the ids that
//! differ only in the last bit. Each bucket holds up to `k` live entries and a
//! bounded replacement cache.
//!
//! ## Insertion policy
//!
//! | Event | Effect |
//! |-------|--------|
//! | reply received (`node_seen`) | refresh, insert, replace a failed/unconfirmed entry, or stash as replacement |
//! | query received (`heard_about`) | insert only when the bucket has room |
//! | request failed (`node_failed`) | bump fail count; drop at `max_fail_count` (or at once when never confirmed) and promote a replacement |
//!
//! Router nodes are bootstrap contacts only: they never enter a bucket.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::DhtSettings;
use crate::id::{distance_cmp, Distance, NodeId, ID_BITS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub fail_count: u8,
    /// The node has answered one of our requests.
    pub confirmed: bool,
}

impl NodeEntry {
    fn new(id: NodeId, addr: SocketAddr, confirmed: bool) -> Self {
        Self {
            id,
            addr,
            fail_count: 0,
            confirmed,
        }
    }

    fn is_replaceable(&self) -> bool {
        self.fail_count > 0 || !self.confirmed
    }
}

#[derive(Debug)]
struct Bucket {
    live: Vec<NodeEntry>,
    replacements: Vec<NodeEntry>,
    last_active: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            live: Vec::new(),
            replacements: Vec::new(),
            last_active: now,
        }
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Bucket>,
    routers: BTreeSet<SocketAddr>,
    bucket_size: usize,
    max_replacements: usize,
    max_fail_count: u8,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, settings: &DhtSettings, now: Instant) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Bucket::new(now));
        }
        Self {
            own_id,
            buckets,
            routers: BTreeSet::new(),
            bucket_size: settings.bucket_size,
            max_replacements: settings.max_replacements,
            max_fail_count: settings.max_fail_count,
        }
    }

    #[cfg(test)]
    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn add_router_node(&mut self, addr: SocketAddr) {
        self.routers.insert(addr);
    }

    pub fn routers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.routers.iter()
    }

    /// A node answered us. Returns `true` if it is now a live entry.
    pub fn node_seen(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> bool {
        self.add_node(id, addr, true, now)
    }

    /// A node contacted us. Inserted only when its bucket has room.
    pub fn heard_about(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> bool {
        self.add_node(id, addr, false, now)
    }

    fn add_node(&mut self, id: NodeId, addr: SocketAddr, confirmed: bool, now: Instant) -> bool {
        if self.routers.contains(&addr) {
            return false;
        }
        let Some(idx) = self.own_id.bucket_index(&id) else {
            return false;
        };
        let k = self.bucket_size;
        let max_replacements = self.max_replacements;
        let bucket = &mut self.buckets[idx];

        // Only a reply may move a known node to a new address.
        if let Some(entry) = bucket.live.iter_mut().find(|e| e.id == id) {
            if confirmed {
                entry.addr = addr;
                entry.fail_count = 0;
                entry.confirmed = true;
                bucket.last_active = now;
            }
            return true;
        }

        // One address, one entry.
        if bucket.live.iter().any(|e| e.addr == addr) {
            return false;
        }

        if bucket.live.len() < k {
            bucket.replacements.retain(|e| e.id != id);
            bucket.live.push(NodeEntry::new(id, addr, confirmed));
            bucket.last_active = now;
            trace!(node = %id.short(), bucket = idx, "routing table insert");
            return true;
        }

        if !confirmed {
            return false;
        }

        let victim = bucket
            .live
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_replaceable())
            .max_by_key(|(_, e)| (e.fail_count, !e.confirmed))
            .map(|(i, _)| i);
        if let Some(i) = victim {
            let old = std::mem::replace(&mut bucket.live[i], NodeEntry::new(id, addr, true));
            bucket.replacements.retain(|e| e.id != id);
            bucket.last_active = now;
            trace!(node = %id.short(), replaced = %old.id.short(), "routing table replace");
            return true;
        }

        bucket.replacements.retain(|e| e.id != id);
        bucket.replacements.push(NodeEntry::new(id, addr, true));
        if bucket.replacements.len() > max_replacements {
            bucket.replacements.remove(0);
        }
        false
    }

    /// A request to `id` at `addr` failed or timed out.
    pub fn node_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        let Some(idx) = self.own_id.bucket_index(id) else {
            return;
        };
        let max_fail = self.max_fail_count;
        let bucket = &mut self.buckets[idx];

        bucket.replacements.retain(|e| !(e.id == *id && e.addr == *addr));

        let Some(pos) = bucket
            .live
            .iter()
            .position(|e| e.id == *id && e.addr == *addr)
        else {
            return;
        };
        let entry = &mut bucket.live[pos];
        entry.fail_count = entry.fail_count.saturating_add(1);
        if entry.fail_count < max_fail && entry.confirmed {
            return;
        }

        bucket.live.remove(pos);
        trace!(node = %id.short(), bucket = idx, "routing table drop");
        if let Some(replacement) = bucket.replacements.pop() {
            bucket.live.push(replacement);
        }
    }

    /// Up to `n` live, non-failed entries closest to `target`, nearest first.
    pub fn find_node(&self, target: &NodeId, n: usize) -> Vec<NodeEntry> {
        if n == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance<'a> {
            dist: Distance,
            entry: &'a NodeEntry,
        }

        impl Ord for ByDistance<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance<'_>> = BinaryHeap::with_capacity(n + 1);
        for entry in self.buckets.iter().flat_map(|b| b.live.iter()) {
            if entry.fail_count > 0 {
                continue;
            }
            let dist = entry.id.xor_distance(target);
            if heap.len() < n {
                heap.push(ByDistance { dist, entry });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == Ordering::Less
            {
                heap.push(ByDistance { dist, entry });
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|d| d.entry.clone())
            .collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.own_id
            .bucket_index(id)
            .is_some_and(|idx| self.buckets[idx].live.iter().any(|e| e.id == *id))
    }

    pub fn bucket_size(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |b| b.live.len())
    }

    pub fn replacement_cache(&self, bucket: usize) -> &[NodeEntry] {
        self.buckets
            .get(bucket)
            .map_or(&[][..], |b| b.replacements.as_slice())
    }

    /// `(live nodes, replacement nodes)`.
    pub fn size(&self) -> (usize, usize) {
        self.buckets.iter().fold((0, 0), |(n, r), b| {
            (n + b.live.len(), r + b.replacements.len())
        })
    }

    /// Live entry counts per bucket, up to the deepest non-empty one.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        let depth = self
            .buckets
            .iter()
            .rposition(|b| !b.live.is_empty())
            .map_or(0, |i| i + 1);
        self.buckets[..depth].iter().map(|b| b.live.len()).collect()
    }

    /// Estimated size of the whole network.
    ///
    /// Walks buckets from the far end while they are full; the first
    /// non-full bucket at depth `d` holding `s` nodes covers `2^-d` of the
    /// keyspace.
    pub fn num_global_nodes(&self) -> u64 {
        let k = self.bucket_size;
        let mut deepest_bucket = 0u32;
        let mut deepest_size = 0usize;
        for bucket in &self.buckets {
            deepest_size = bucket.live.len();
            if deepest_size < k {
                break;
            }
            deepest_bucket += 1;
        }

        if deepest_bucket == 0 {
            return 1 + deepest_size as u64;
        }
        let scale = |shift: u32| 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        if deepest_size < k / 2 {
            scale(deepest_bucket).saturating_mul(k as u64)
        } else {
            scale(deepest_bucket + 1).saturating_mul(deepest_size as u64)
        }
    }

    /// First non-empty bucket not active for `interval`.
    pub fn need_refresh(&self, now: Instant, interval: Duration) -> Option<usize> {
        self.buckets.iter().position(|b| {
            !b.live.is_empty() && now.saturating_duration_since(b.last_active) >= interval
        })
    }

    /// Mark a bucket as refreshed so it is not picked again right away.
    pub fn touch_bucket(&mut self, bucket: usize, now: Instant) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.last_active = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_LEN;

    fn addr(i: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, (i >> 8) as u8, i as u8], 6881))
    }

    fn table() -> (RoutingTable, Instant) {
        let now = Instant::now();
        let settings = DhtSettings {
            max_fail_count: 3,
            max_replacements: 2,
            ..DhtSettings::default()
        };
        (RoutingTable::new(NodeId::random(), &settings, now), now)
    }

    #[test]
    fn own_id_and_routers_never_enter() {
        let (mut rt, now) = table();
        let me = *rt.own_id();
        assert!(!rt.node_seen(me, addr(1), now));

        rt.add_router_node(addr(2));
        assert!(!rt.node_seen(NodeId::random(), addr(2), now));
        assert_eq!(rt.size(), (0, 0));
        assert!(rt.routers().any(|a| *a == addr(2)));
    }

    #[test]
    fn full_bucket_fills_replacement_cache() {
        let (mut rt, now) = table();
        let me = *rt.own_id();
        for i in 0..12 {
            rt.node_seen(me.random_in_bucket(0), addr(i), now);
        }
        assert_eq!(rt.bucket_size(0), 8);
        assert_eq!(rt.replacement_cache(0).len(), 2);
        assert_eq!(rt.size(), (8, 2));
    }

    #[test]
    fn heard_about_never_replaces() {
        let (mut rt, now) = table();
        let me = *rt.own_id();
        for i in 0..8 {
            assert!(rt.heard_about(me.random_in_bucket(0), addr(i), now));
        }
        assert!(!rt.heard_about(me.random_in_bucket(0), addr(100), now));
        assert_eq!(rt.size(), (8, 0));

        // A confirmed node may take the place of an unconfirmed one.
        assert!(rt.node_seen(me.random_in_bucket(0), addr(101), now));
        assert_eq!(rt.bucket_size(0), 8);
    }

    #[test]
    fn failures_remove_and_promote_replacement() {
        let (mut rt, now) = table();
        let me = *rt.own_id();
        let mut ids = Vec::new();
        for i in 0..9 {
            let id = me.random_in_bucket(0);
            rt.node_seen(id, addr(i), now);
            ids.push(id);
        }
        let spare = ids[8];
        assert!(!rt.contains(&spare));

        for _ in 0..2 {
            rt.node_failed(&ids[0], &addr(0));
        }
        assert!(rt.contains(&ids[0]));
        assert!(rt.find_node(&ids[0], 8).iter().all(|e| e.id != ids[0]));

        rt.node_failed(&ids[0], &addr(0));
        assert!(!rt.contains(&ids[0]));
        assert!(rt.contains(&spare));
    }

    #[test]
    fn unconfirmed_node_dropped_on_first_failure() {
        let (mut rt, now) = table();
        let id = NodeId::random();
        rt.heard_about(id, addr(1), now);
        rt.node_failed(&id, &addr(1));
        assert!(!rt.contains(&id));
    }

    #[test]
    fn find_node_orders_by_distance() {
        let (mut rt, now) = table();
        for i in 0..60 {
            rt.node_seen(NodeId::random(), addr(i), now);
        }
        let target = NodeId::random();
        let found = rt.find_node(&target, 8);
        assert_eq!(found.len(), 8);
        for pair in found.windows(2) {
            assert_eq!(
                crate::id::closer_to(&target, &pair[0].id, &pair[1].id),
                Ordering::Less
            );
        }
        assert!(found.iter().all(|e| e.id != *rt.own_id()));
    }

    #[test]
    fn global_estimate_grows_with_depth() {
        let (mut rt, now) = table();
        assert_eq!(rt.num_global_nodes(), 1);

        let me = *rt.own_id();
        let mut n = 0;
        for bucket in 0..3 {
            for _ in 0..8 {
                rt.node_seen(me.random_in_bucket(bucket), addr(n), now);
                n += 1;
            }
        }
        for _ in 0..6 {
            rt.node_seen(me.random_in_bucket(3), addr(n), now);
            n += 1;
        }
        // Three full buckets, the fourth holds 6 of 8: (2 << 3) * 6.
        assert_eq!(rt.num_global_nodes(), 96);
    }

    #[test]
    fn need_refresh_reports_stale_buckets() {
        let (mut rt, now) = table();
        let interval = Duration::from_secs(900);
        assert_eq!(rt.need_refresh(now + interval, interval), None);

        let mut far = [0u8; ID_LEN];
        far.copy_from_slice(rt.own_id().as_bytes());
        far[0] ^= 0x80;
        rt.node_seen(NodeId::from_bytes(far), addr(1), now);
        assert_eq!(rt.need_refresh(now, interval), None);
        assert_eq!(rt.need_refresh(now + interval, interval), Some(0));

        rt.touch_bucket(0, now + interval);
        assert_eq!(rt.need_refresh(now + interval, interval), None);
    }
}
