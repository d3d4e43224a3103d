//! # Traversals
//!
//! A traversal is one iterative Kademlia lookup towards a target, optionally
//! followed by a write phase (`announce_peer` or `put`) to the closest nodes
//! that handed out a write token.
//!
//! ## Lookup
//!
//! Candidates are kept sorted by XOR distance to the target and capped at
//! `max_results`. Each round walks the list from the front:
//!
//! - alive candidates count towards the `k` results we want; once `k` alive
//!   candidates sit ahead of the cursor the round stops;
//! - queried candidates (in flight or failed) are skipped;
//! - anything else is queried, as long as fewer than `branch_factor`
//!   requests are in flight.
//!
//! A short timeout widens the branch factor by one so a slow node does not
//! stall the lookup; the slot is given back when that node answers or fails.
//! The lookup is done when a round issues nothing and nothing is in flight.
//!
//! ## Arena
//!
//! Running traversals live in a [`TraversalArena`] addressed by
//! [`TraversalId`]. Removing a traversal bumps its slot generation, so
//! observers still carrying the old id resolve to nothing and late replies
//! are dropped.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use crate::id::{distance_cmp, NodeId};
use crate::storage::{SignedStorageItem, StoredSigned};

// ============================================================================
// Candidate flags
// ============================================================================

pub const QUERIED: u8 = 1;
pub const ALIVE: u8 = 2;
pub const FAILED: u8 = 4;
pub const SHORT_TIMEOUT: u8 = 8;
/// Router contact; its id is unknown until it answers.
pub const NO_ID: u8 = 16;

#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
    pub flags: u8,
    /// Write token returned by this node, if any.
    pub token: Option<Vec<u8>>,
}

impl Candidate {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

// ============================================================================
// Purpose and completions
// ============================================================================

pub type NodesCallback = Box<dyn FnOnce(Vec<(NodeId, SocketAddr)>) + Send>;
pub type PeersCallback = Box<dyn FnOnce(Vec<SocketAddr>) + Send>;
pub type ItemsCallback = Box<dyn FnOnce(Vec<StoredSigned>) + Send>;
pub type StoredCallback = Box<dyn FnOnce(usize) + Send>;

/// What the traversal is for, and where its result goes.
pub enum Purpose {
    /// `find_node` lookup (bootstrap, refresh).
    FindNode { done: NodesCallback },
    /// `get_peers` lookup, then `announce_peer` to the closest token holders.
    Announce {
        port: u16,
        seed: bool,
        peers: BTreeSet<SocketAddr>,
        done: PeersCallback,
    },
    /// `get` lookup collecting signed items stored under the target.
    GetData {
        items: Vec<StoredSigned>,
        done: ItemsCallback,
    },
    /// `get` lookup for tokens, then `put` of `item` to the closest holders.
    PutData {
        item: SignedStorageItem,
        done: StoredCallback,
    },
}

impl Purpose {
    pub fn name(&self) -> &'static str {
        match self {
            Purpose::FindNode { .. } => "find_node",
            Purpose::Announce { .. } => "announce",
            Purpose::GetData { .. } => "get_data",
            Purpose::PutData { .. } => "put_data",
        }
    }

    /// Whether a write phase follows the lookup.
    pub fn writes(&self) -> bool {
        matches!(self, Purpose::Announce { .. } | Purpose::PutData { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Lookup,
    Write { outstanding: usize, acked: usize },
}

pub struct Traversal {
    pub target: NodeId,
    pub purpose: Purpose,
    pub phase: Phase,
    results: Vec<Candidate>,
    invoke_count: usize,
    branch_factor: usize,
    k: usize,
    max_results: usize,
    pub responses: usize,
    pub timeouts: usize,
}

impl Traversal {
    pub fn new(target: NodeId, purpose: Purpose, k: usize, branch_factor: usize, max_results: usize) -> Self {
        Self {
            target,
            purpose,
            phase: Phase::Lookup,
            results: Vec::new(),
            invoke_count: 0,
            branch_factor: branch_factor.max(1),
            k,
            max_results,
            responses: 0,
            timeouts: 0,
        }
    }

    fn sort_key(&self, candidate: &Candidate) -> (bool, [u8; 20]) {
        match candidate.id {
            Some(id) => (false, id.xor_distance(&self.target)),
            None => (true, [0u8; 20]),
        }
    }

    /// Add a candidate. Duplicates (by id or address) are ignored.
    pub fn add_entry(&mut self, id: Option<NodeId>, addr: SocketAddr, flags: u8) {
        if self
            .results
            .iter()
            .any(|c| c.addr == addr || (id.is_some() && c.id == id))
        {
            return;
        }
        let candidate = Candidate {
            id,
            addr,
            flags: if id.is_none() { flags | NO_ID } else { flags },
            token: None,
        };
        let key = self.sort_key(&candidate);
        let pos = self.results.partition_point(|c| {
            let other = self.sort_key(c);
            other.0 < key.0 || (other.0 == key.0 && distance_cmp(&other.1, &key.1).is_le())
        });
        if pos >= self.max_results {
            return;
        }
        self.results.insert(pos, candidate);

        while self.results.len() > self.max_results {
            // Drop the farthest candidate that has no request in flight.
            let victim = self
                .results
                .iter()
                .rposition(|c| !c.has(QUERIED) || c.has(FAILED) || c.has(ALIVE));
            match victim {
                Some(i) => {
                    self.results.remove(i);
                }
                None => break,
            }
        }
    }

    /// Pick the next candidates to query and mark them as queried.
    pub fn next_requests(&mut self) -> Vec<(Option<NodeId>, SocketAddr)> {
        let mut out = Vec::new();
        let mut results_target = self.k;
        for candidate in self.results.iter_mut() {
            if results_target == 0 {
                break;
            }
            if candidate.has(ALIVE) {
                results_target -= 1;
                continue;
            }
            if candidate.has(QUERIED) {
                continue;
            }
            if self.invoke_count >= self.branch_factor {
                break;
            }
            candidate.flags |= QUERIED;
            self.invoke_count += 1;
            out.push((candidate.id, candidate.addr));
        }
        out
    }

    fn find(&mut self, addr: &SocketAddr) -> Option<&mut Candidate> {
        self.results.iter_mut().find(|c| c.addr == *addr)
    }

    /// A queried candidate answered. `nodes` are merged into the results.
    pub fn on_reply(
        &mut self,
        addr: SocketAddr,
        id: NodeId,
        token: Option<Vec<u8>>,
        nodes: &[(NodeId, SocketAddr)],
    ) {
        let mut released = false;
        let mut widened = false;
        let mut reposition = false;
        if let Some(candidate) = self.find(&addr)
            && candidate.has(QUERIED)
            && !candidate.has(ALIVE | FAILED)
        {
            candidate.flags |= ALIVE;
            if candidate.has(NO_ID) {
                candidate.id = Some(id);
                candidate.flags &= !NO_ID;
                reposition = true;
            }
            candidate.token = token;
            widened = candidate.has(SHORT_TIMEOUT);
            released = true;
        }
        if released {
            self.release(widened);
            self.responses += 1;
        }
        if reposition {
            self.resort();
        }
        for (node_id, node_addr) in nodes {
            self.add_entry(Some(*node_id), *node_addr, 0);
        }
    }

    /// A queried candidate has been slow; open one more branch.
    pub fn on_short_timeout(&mut self, addr: SocketAddr) {
        if let Some(candidate) = self.find(&addr)
            && !candidate.has(SHORT_TIMEOUT | ALIVE | FAILED)
        {
            candidate.flags |= SHORT_TIMEOUT;
            self.branch_factor += 1;
        }
    }

    /// A queried candidate timed out or returned an error.
    pub fn on_failure(&mut self, addr: SocketAddr) {
        let mut widened = None;
        if let Some(candidate) = self.find(&addr)
            && candidate.has(QUERIED)
            && !candidate.has(ALIVE | FAILED)
        {
            candidate.flags |= FAILED;
            widened = Some(candidate.has(SHORT_TIMEOUT));
        }
        if let Some(widened) = widened {
            self.release(widened);
            self.timeouts += 1;
        }
    }

    fn release(&mut self, widened: bool) {
        self.invoke_count = self.invoke_count.saturating_sub(1);
        if widened && self.branch_factor > 1 {
            self.branch_factor -= 1;
        }
    }

    fn resort(&mut self) {
        let mut results = std::mem::take(&mut self.results);
        results.sort_by(|a, b| {
            let (ka, kb) = (self.sort_key(a), self.sort_key(b));
            ka.0.cmp(&kb.0).then(distance_cmp(&ka.1, &kb.1))
        });
        self.results = results;
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.invoke_count
    }

    #[cfg(test)]
    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    pub fn results(&self) -> &[Candidate] {
        &self.results
    }

    /// The closest `k` alive candidates, nearest first.
    pub fn closest_alive(&self) -> Vec<&Candidate> {
        self.results
            .iter()
            .filter(|c| c.has(ALIVE) && c.id.is_some())
            .take(self.k)
            .collect()
    }

    /// The closest `k` alive candidates that handed out a write token.
    pub fn write_targets(&self) -> Vec<&Candidate> {
        self.results
            .iter()
            .filter(|c| c.has(ALIVE) && c.id.is_some() && c.token.is_some())
            .take(self.k)
            .collect()
    }

    /// Start the write phase with `outstanding` requests.
    pub fn begin_write(&mut self, outstanding: usize) {
        self.phase = Phase::Write {
            outstanding,
            acked: 0,
        };
    }

    /// One write request finished; `true` if it was acknowledged.
    pub fn on_write_result(&mut self, acked: bool) {
        if let Phase::Write {
            outstanding,
            acked: count,
        } = &mut self.phase
        {
            *outstanding = outstanding.saturating_sub(1);
            if acked {
                *count += 1;
            }
        }
    }

    /// Nothing left to wait for in the current phase.
    pub fn is_idle(&self) -> bool {
        match self.phase {
            Phase::Lookup => self.invoke_count == 0,
            Phase::Write { outstanding, .. } => outstanding == 0,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraversalId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    traversal: Option<Traversal>,
}

#[derive(Default)]
pub struct TraversalArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    running: usize,
}

impl TraversalArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, traversal: Traversal) -> TraversalId {
        self.running += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.traversal = Some(traversal);
            return TraversalId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            traversal: Some(traversal),
        });
        TraversalId {
            index,
            generation: 0,
        }
    }

    #[cfg(test)]
    pub fn get(&self, id: TraversalId) -> Option<&Traversal> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.traversal.as_ref()
    }

    pub fn get_mut(&mut self, id: TraversalId) -> Option<&mut Traversal> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.traversal.as_mut()
    }

    /// Unregister a traversal; its id becomes stale.
    pub fn remove(&mut self, id: TraversalId) -> Option<Traversal> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let traversal = slot.traversal.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.running -= 1;
        Some(traversal)
    }

    pub fn ids(&self) -> Vec<TraversalId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.traversal.is_some())
            .map(|(i, s)| TraversalId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Unregister everything.
    pub fn drain(&mut self) -> Vec<Traversal> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.running
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.running == 0
    }
}
