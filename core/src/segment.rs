//! The per-process pinned segment exposed to remote peers (spec §3,
//! "Segment"), and the probed pinning limits consulted by `gasnet-firehose`.

use crate::node::NodeId;

/// A contiguous, page-aligned virtual region. `base` is an opaque handle
/// (conduit address space); the core never dereferences it directly, it
/// only validates bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub size: u64,
}

impl Segment {
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.base.saturating_add(self.size),
            None => false,
        }
    }
}

/// The per-node table of segments, published once by `attach` and read-only
/// thereafter (spec §3 lifecycle, §5 "Shared resources").
#[derive(Debug, Clone)]
pub struct SegInfoTable {
    segments: Vec<Segment>,
    aligned: bool,
}

impl SegInfoTable {
    /// `segments[i]` is node `i`'s segment. If `GASNET_ALIGNED_SEGMENTS` is
    /// requested, every segment's `base` must be identical — checked here
    /// post-attach, per spec §3.
    pub fn new(segments: Vec<Segment>, require_aligned: bool) -> Result<Self, String> {
        if require_aligned {
            if let Some(first) = segments.first() {
                if segments.iter().any(|s| s.base != first.base) {
                    return Err("GASNET_ALIGNED_SEGMENTS requires identical base across nodes".into());
                }
            }
        }
        Ok(SegInfoTable {
            segments,
            aligned: require_aligned,
        })
    }

    pub fn get(&self, node: NodeId) -> Option<Segment> {
        self.segments.get(node.as_usize()).copied()
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Bounds check for an `AMRequestLong` `dest_addr` (spec §4.1 failure
    /// semantics: "An out-of-segment dest_addr in Long is a programming
    /// error reported to the caller").
    pub fn bounds_check(&self, node: NodeId, addr: u64, len: u64) -> bool {
        self.get(node).map(|s| s.contains(addr, len)).unwrap_or(false)
    }
}

/// Probed limits for the segment/pin-probe component (spec §2 "Segment &
/// pin probe"). The actual mmap-search / pin-probe heuristics are out of
/// scope (spec §1); only the resulting numbers matter to the rest of the
/// system.
#[derive(Debug, Clone, Copy)]
pub struct PinProbe {
    pub max_local_segment_size: u64,
    pub max_pinnable_memory: u64,
}

impl PinProbe {
    pub fn max_global_segment_size(&self, nnodes: usize) -> u64 {
        // The global segment is the minimum per-node segment replicated
        // across the job; with aligned segments this is simply the local
        // probe, otherwise it is also bounded by the smallest peer - which
        // the core cannot know without the (out-of-scope) exchange
        // collective, so callers pass the already-exchanged minimum here.
        let _ = nnodes;
        self.max_local_segment_size
    }
}
