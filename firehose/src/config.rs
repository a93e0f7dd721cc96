//! Firehose budget parameters, derived from `gasnet_core::Config` and the
//! job size at `firehose_init` time (spec §4.4 "Parameters").

use crate::bucket::DEFAULT_BUCKET_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct FirehoseConfig {
    pub bucket_size: u64,
    /// `M`: total bytes of pinning budget for this process.
    pub m: u64,
    /// `MaxVictim`: bytes kept pinned but idle.
    pub max_victim: u64,
    /// `RemoteBucketsM`: per-peer budget on the number of a peer's buckets
    /// we may cache as pinned at once.
    pub remote_buckets_m: u64,
    /// The largest pinning request that fits in one `FH_MOVE_REQ` AM
    /// Medium, bounded by half of the region-vector capacity.
    pub max_remote_buckets: u64,
}

impl FirehoseConfig {
    /// `firehoses = (M - prepinned) / bucket_size`, `RemoteBucketsM =
    /// firehoses / (nnodes - 1)` (spec §4.4, verbatim formulas).
    pub fn new(core: &gasnet_core::Config, nnodes: usize, prepinned: u64) -> Self {
        let bucket_size = DEFAULT_BUCKET_SIZE;
        let m = core.firehose_m;
        let max_victim = core.firehose_maxvictim_m;
        let firehoses = m.saturating_sub(prepinned) / bucket_size;
        let peers = (nnodes.saturating_sub(1)).max(1) as u64;
        let remote_buckets_m = (firehoses / peers).max(1);
        // Half of a Medium's region-vector capacity: an FH_MOVE_REQ Medium
        // spends 16 bytes per region entry across new+old, so bound one
        // acquire's new-region count to MaxMedium / 16 / 2.
        let max_remote_buckets = ((core.max_medium as u64 / 16) / 2).max(1);
        FirehoseConfig {
            bucket_size,
            m,
            max_victim,
            remote_buckets_m,
            max_remote_buckets,
        }
    }

    pub fn max_victim_buckets(&self) -> u64 {
        self.max_victim / self.bucket_size
    }
}
