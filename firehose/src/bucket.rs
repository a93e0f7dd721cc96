//! Bucket addressing and the per-bucket state machine (spec §3 "Firehose
//! bucket", "Firehose state machine").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Unit of pinning. One machine page by default (spec §3: "typically one
/// machine page").
pub const DEFAULT_BUCKET_SIZE: u64 = 4096;

/// Round `addr` down to its enclosing bucket's base address.
pub fn bucket_base(addr: u64, bucket_size: u64) -> u64 {
    addr - (addr % bucket_size)
}

/// The bucket-aligned addresses covering `[addr, addr+len)`, in ascending
/// order, with no duplicates.
pub fn buckets_for_range(addr: u64, len: u64, bucket_size: u64) -> Vec<u64> {
    if len == 0 {
        return Vec::new();
    }
    let first = bucket_base(addr, bucket_size);
    let last = bucket_base(addr + len - 1, bucket_size);
    let mut buckets = Vec::with_capacity(((last - first) / bucket_size + 1) as usize);
    let mut b = first;
    while b <= last {
        buckets.push(b);
        b += bucket_size;
    }
    buckets
}

/// Record for one of *our own* memory buckets (spec §3 local table): `local`
/// counts our own in-flight operations using this bucket as an RDMA source
/// or destination; `remote` counts distinct peer holds granted via
/// `FH_MOVE_REQ`. `InFifo` ⇔ both are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBucketRecord {
    pub local: u32,
    pub remote: u32,
}

impl LocalBucketRecord {
    pub fn is_idle(&self) -> bool {
        self.local == 0 && self.remote == 0
    }
}

/// One outstanding `acquire_remote` call's completion handle. Every bucket
/// the call touched that was not already pinned holds a clone; the call
/// resolves (the caller's await returns) once every touched bucket has
/// transitioned out of `PendingPin` (spec §4.4 step 6).
pub struct PendingAcquire {
    remaining: AtomicUsize,
    notify: Notify,
}

impl PendingAcquire {
    pub fn new(remaining: usize) -> Arc<Self> {
        Arc::new(PendingAcquire {
            remaining: AtomicUsize::new(remaining),
            notify: Notify::new(),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Called once per bucket this acquire touched, when that bucket's pin
    /// reply arrives. Wakes the awaiting caller when the last one resolves.
    pub fn resolve_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            // Create the `Notified` future before checking the condition: a
            // `notify_waiters()` landing between the check and the await
            // point would otherwise be missed, since `notify_waiters` only
            // wakes waiters that already exist at the time it runs.
            let notified = self.notify.notified();
            if self.is_resolved() {
                return;
            }
            notified.await;
        }
    }
}

/// A remote cache entry: our record of a peer's bucket that we have (or are
/// in the process of) pinning on our behalf (spec §3 "Firehose state
/// machine").
pub enum RemoteBucketState {
    /// Pin request sent, reply not yet observed. `waiters` are the
    /// `PendingAcquire`s of every acquire call that has touched this bucket
    /// while it was pending (spec §4.4 step 3).
    PendingPin { waiters: Vec<Arc<PendingAcquire>> },
    /// Pinned and usable for RDMA. `InFifo` is `refcount == 0`.
    Pinned { refcount: u32, rkey: u64, lkey: u64 },
}

impl RemoteBucketState {
    pub fn refcount(&self) -> u32 {
        match self {
            RemoteBucketState::PendingPin { .. } => 0,
            RemoteBucketState::Pinned { refcount, .. } => *refcount,
        }
    }
}
