//! The Firehose bucket table: local buckets (our own memory) and the
//! per-peer remote cache, their FIFOs, and the budget counters (spec §3
//! "Firehose bucket" / "Firehose state machine", §4.4). Guarded by one
//! process-wide lock, per spec §5 ("One per-process Firehose table lock").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use gasnet_core::NodeId;

use crate::bucket::{LocalBucketRecord, PendingAcquire, RemoteBucketState};
use crate::config::FirehoseConfig;
use crate::wire::Region;

#[derive(Default)]
pub struct Table {
    pub local: HashMap<u64, LocalBucketRecord>,
    pub local_fifo: VecDeque<u64>,
    pub remote: HashMap<NodeId, HashMap<u64, RemoteBucketState>>,
    pub remote_fifo: HashMap<NodeId, VecDeque<u64>>,
}

/// The outcome of touching one remote bucket during an acquire (spec §4.4
/// steps 1-4).
enum Touch {
    /// Already pinned and not pending; refcount bumped, nothing to send.
    AlreadyPinned,
    /// Newly created `PendingPin`, or chained onto an existing one; caller
    /// must await its `PendingAcquire`.
    Pending,
}

impl Table {
    /// Walk the buckets covering `[addr, addr+len)` on `peer`, per spec §4.4
    /// steps 1-4. Returns the bucket addresses that need a `new_regions`
    /// entry in the outgoing `FH_MOVE_REQ` (freshly PendingPin buckets
    /// only — buckets chained onto an already-pending bucket do not need a
    /// second pin request).
    pub fn touch_for_acquire(&mut self, peer: NodeId, buckets: &[u64], pending: &Arc<PendingAcquire>) -> Vec<u64> {
        let peer_table = self.remote.entry(peer).or_default();
        let peer_fifo = self.remote_fifo.entry(peer).or_default();
        let mut new_regions = Vec::new();
        let mut touches = Vec::with_capacity(buckets.len());
        for &addr in buckets {
            let touch = match peer_table.get_mut(&addr) {
                Some(RemoteBucketState::Pinned { refcount, .. }) => {
                    if *refcount == 0 {
                        peer_fifo.retain(|&a| a != addr);
                    }
                    *refcount += 1;
                    Touch::AlreadyPinned
                },
                Some(RemoteBucketState::PendingPin { waiters }) => {
                    waiters.push(pending.clone());
                    Touch::Pending
                },
                None => {
                    peer_table.insert(
                        addr,
                        RemoteBucketState::PendingPin { waiters: vec![pending.clone()] },
                    );
                    new_regions.push(addr);
                    Touch::Pending
                },
            };
            touches.push(touch);
        }
        let resolved_now = touches.iter().filter(|t| matches!(t, Touch::AlreadyPinned)).count();
        for _ in 0..resolved_now {
            pending.resolve_one();
        }
        new_regions
    }

    /// Pick eviction victims from `peer`'s remote FIFO so that, once
    /// `new_addrs` (the buckets `touch_for_acquire` just inserted as
    /// `PendingPin`) are pinned, `RemoteBucketsUsed[peer] ≤ RemoteBucketsM`
    /// (spec §4.4 step 5, invariant (b)). Evicted entries are removed from
    /// the cache entirely — the owner is told to unpin them via
    /// `old_regions` in the same `FH_MOVE_REQ`.
    ///
    /// `new_addrs` are already present in `peer_table` by the time this
    /// runs (`touch_for_acquire` inserts them before returning), so a plain
    /// `peer_table.len() + new_addrs.len()` would double-count them; this
    /// subtracts back out whichever of `new_addrs` are already reflected in
    /// the table before adding them in again.
    pub fn evict_remote_victims(&mut self, peer: NodeId, new_addrs: &[u64], budget: u64, bucket_size: u64) -> Vec<Region> {
        let peer_table_len = self.remote.get(&peer).map(|t| t.len()).unwrap_or(0);
        let already_counted = self
            .remote
            .get(&peer)
            .map(|t| new_addrs.iter().filter(|a| t.contains_key(a)).count())
            .unwrap_or(0);
        let used = peer_table_len.saturating_sub(already_counted);
        let projected = used + new_addrs.len();
        let over = projected.saturating_sub(budget as usize);
        if over == 0 {
            return Vec::new();
        }
        let peer_table = self.remote.entry(peer).or_default();
        let peer_fifo = self.remote_fifo.entry(peer).or_default();
        let mut victims = Vec::with_capacity(over);
        for _ in 0..over {
            let Some(addr) = peer_fifo.pop_front() else { break };
            peer_table.remove(&addr);
            victims.push(Region { addr, len: bucket_size });
        }
        victims
    }

    /// Resolve a `FH_MOVE_REP`: clear `PendingPin` on each named bucket and
    /// wake every chained `PendingAcquire` (spec §4.4 "FH_MOVE_REP
    /// handler").
    pub fn resolve_pins(&mut self, peer: NodeId, regions: &[crate::wire::RegionKeys]) {
        let Some(peer_table) = self.remote.get_mut(&peer) else { return };
        for r in regions {
            if let Some(state) = peer_table.get_mut(&r.addr) {
                if let RemoteBucketState::PendingPin { waiters } = state {
                    let holds = waiters.len() as u32;
                    for w in waiters.drain(..) {
                        w.resolve_one();
                    }
                    *state = RemoteBucketState::Pinned { refcount: holds, rkey: r.rkey, lkey: r.lkey };
                }
            }
        }
    }

    /// Decrement refcounts after an RDMA referencing `peer`'s buckets
    /// completes (spec §4.4 "Release").
    pub fn release_remote(&mut self, peer: NodeId, buckets: &[u64]) {
        let peer_table = self.remote.entry(peer).or_default();
        let peer_fifo = self.remote_fifo.entry(peer).or_default();
        for &addr in buckets {
            if let Some(RemoteBucketState::Pinned { refcount, .. }) = peer_table.get_mut(&addr) {
                if *refcount > 0 {
                    *refcount -= 1;
                }
                if *refcount == 0 {
                    peer_fifo.push_back(addr);
                }
            }
        }
    }

    /// `FH_MOVE_REQ` handler on the bucket owner: pin each new region
    /// (allocate a record with `remote += 1` if absent, bump `remote`
    /// otherwise) and unpin each old region outright (spec §4.4 "FH_MOVE_REQ
    /// handler": "Pin each new region... Unpin each old region").
    /// `pin`/`unpin` are the conduit's `register_mr`/`deregister_mr` calls,
    /// invoked only for genuinely new or fully-released buckets.
    pub fn apply_move_req(
        &mut self,
        new_regions: &[Region],
        old_regions: &[Region],
        mut pin: impl FnMut(u64) -> (u64, u64),
        mut unpin: impl FnMut(u64),
        cfg: &FirehoseConfig,
    ) -> Vec<crate::wire::RegionKeys> {
        let mut keys = Vec::with_capacity(new_regions.len());
        for r in new_regions {
            self.local_fifo.retain(|&a| a != r.addr);
            let (rkey, lkey) = pin(r.addr);
            let entry = self.local.entry(r.addr).or_default();
            entry.remote += 1;
            keys.push(crate::wire::RegionKeys { addr: r.addr, len: r.len, rkey, lkey });
        }
        for r in old_regions {
            if let Some(entry) = self.local.get_mut(&r.addr) {
                if entry.remote > 0 {
                    entry.remote -= 1;
                }
                if entry.is_idle() {
                    unpin(r.addr);
                    self.local.remove(&r.addr);
                } else if entry.remote == 0 && entry.local == 0 {
                    self.local_fifo.push_back(r.addr);
                }
            }
        }
        self.enforce_local_victim_budget(cfg, &mut unpin);
        keys
    }

    /// Evict idle local buckets past `MaxVictimBuckets` (spec §4.4
    /// "Release": "If the FIFO is overcommitted the oldest victims are
    /// evicted and unpinned", invariant (a)).
    fn enforce_local_victim_budget(&mut self, cfg: &FirehoseConfig, unpin: &mut impl FnMut(u64)) {
        let max = cfg.max_victim_buckets() as usize;
        while self.local_fifo.len() > max {
            if let Some(addr) = self.local_fifo.pop_front() {
                self.local.remove(&addr);
                unpin(addr);
            } else {
                break;
            }
        }
    }

    /// Spec §8 property 5 / §4.4 invariants (a)-(c), checked directly
    /// against table state for the test suite.
    #[cfg(test)]
    pub fn check_invariants(&self, cfg: &FirehoseConfig) -> Result<(), String> {
        let local_only_pinned = self
            .local
            .values()
            .filter(|b| b.remote == 0 && b.local == 0)
            .count();
        if local_only_pinned > cfg.max_victim_buckets() as usize {
            return Err(format!(
                "LocalOnlyBucketsPinned {} exceeds MaxVictimBuckets {}",
                local_only_pinned,
                cfg.max_victim_buckets()
            ));
        }
        for (peer, table) in &self.remote {
            if table.len() as u64 > cfg.remote_buckets_m {
                return Err(format!(
                    "RemoteBucketsUsed[{peer}] {} exceeds RemoteBucketsM {}",
                    table.len(),
                    cfg.remote_buckets_m
                ));
            }
        }
        for (peer, fifo) in &self.remote_fifo {
            let table = self.remote.get(peer);
            for addr in fifo {
                match table.and_then(|t| t.get(addr)) {
                    Some(RemoteBucketState::Pinned { refcount: 0, .. }) => {},
                    other => {
                        return Err(format!("fifo entry {peer}:{addr:#x} not InFifo: {:?}", other.is_some()))
                    },
                }
            }
        }
        Ok(())
    }
}
