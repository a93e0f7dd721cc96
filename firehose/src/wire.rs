//! The `FH_MOVE_REQ` / `FH_MOVE_REP` wire layout (spec §6 "Firehose wire
//! layout"). Carried as an AM Medium payload over the core engine's system
//! handler range (SPEC_FULL.md §4.1).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use gasnet_core::error::{GasnetError, Result};

/// `region = { addr: u64, len: u64 }` (spec §6, verbatim).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub len: u64,
}

/// A pinned region plus the keys a requester needs to target it with RDMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionKeys {
    pub addr: u64,
    pub len: u64,
    pub rkey: u64,
    pub lkey: u64,
}

/// Merge bucket-aligned addresses into the smallest run-length list of
/// contiguous `(addr, len)` entries (spec §4.4 "Coalescing": "This gives a
/// worst-case `⌈B/2⌉ + 1` region entries for `B` uncontiguous buckets").
/// `buckets` must be sorted ascending.
pub fn coalesce(buckets: &[u64], bucket_size: u64) -> Vec<Region> {
    let mut regions: Vec<Region> = Vec::new();
    for &addr in buckets {
        match regions.last_mut() {
            Some(r) if r.addr + r.len == addr => r.len += bucket_size,
            _ => regions.push(Region { addr, len: bucket_size }),
        }
    }
    regions
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhMoveReq {
    pub new_regions: Vec<Region>,
    pub old_regions: Vec<Region>,
}

impl FhMoveReq {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 16 * (self.new_regions.len() + self.old_regions.len()));
        buf.put_u16(self.new_regions.len() as u16);
        buf.put_u16(self.old_regions.len() as u16);
        for r in &self.new_regions {
            buf.put_u64(r.addr);
            buf.put_u64(r.len);
        }
        for r in &self.old_regions {
            buf.put_u64(r.addr);
            buf.put_u64(r.len);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(GasnetError::BadArg("FH_MOVE_REQ truncated before counts".into()));
        }
        let new_count = bytes.get_u16() as usize;
        let old_count = bytes.get_u16() as usize;
        if bytes.len() < (new_count + old_count) * 16 {
            return Err(GasnetError::BadArg("FH_MOVE_REQ truncated before regions".into()));
        }
        let read_region = |b: &mut Bytes| Region { addr: b.get_u64(), len: b.get_u64() };
        let new_regions = (0..new_count).map(|_| read_region(&mut bytes)).collect();
        let old_regions = (0..old_count).map(|_| read_region(&mut bytes)).collect();
        Ok(FhMoveReq { new_regions, old_regions })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhMoveRep {
    pub regions: Vec<RegionKeys>,
}

impl FhMoveRep {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + 32 * self.regions.len());
        buf.put_u16(self.regions.len() as u16);
        for r in &self.regions {
            buf.put_u64(r.addr);
            buf.put_u64(r.len);
            buf.put_u64(r.rkey);
            buf.put_u64(r.lkey);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(GasnetError::BadArg("FH_MOVE_REP truncated before count".into()));
        }
        let count = bytes.get_u16() as usize;
        if bytes.len() < count * 32 {
            return Err(GasnetError::BadArg("FH_MOVE_REP truncated before regions".into()));
        }
        let regions = (0..count)
            .map(|_| RegionKeys {
                addr: bytes.get_u64(),
                len: bytes.get_u64(),
                rkey: bytes.get_u64(),
                lkey: bytes.get_u64(),
            })
            .collect();
        Ok(FhMoveRep { regions })
    }
}
