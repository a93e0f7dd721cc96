//! The `Transport` trait abstracts the conduit-specific NIC/verbs
//! primitives that spec §1 explicitly names but excludes from this
//! specification: queue-pair setup, `post_send`, `poll_cq`,
//! `register_mr`/`deregister_mr`. Real conduits (AXIOM, Elan, GM, LAPI,
//! ibverbs) implement this trait outside this workspace; the in-tree
//! `LoopbackTransport` is the one concrete implementation we ship, used by
//! tests and the `gasnet-test-utils` mesh builder — directly analogous to
//! the teacher's `transports::MemoryTransport` alongside its real
//! `TcpTransport`.

mod loopback;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::node::NodeId;

/// A registered (pinned) memory region handle, as produced by
/// `register_mr` and consumed by `deregister_mr`/RDMA calls. Opaque outside
/// the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// The conduit-specific primitives the send/receive core and Firehose rely
/// on (spec §1, §4.2, §4.4). A conduit implementation owns its own
/// queue-pairs / completion queues; this trait only exposes the operations
/// the portable core needs to drive them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one AM frame to `dest` and return once the transport has queued
    /// it (not necessarily once it has been acknowledged — see spec §4.2
    /// "Send path").
    async fn send(&self, dest: NodeId, frame: Bytes) -> Result<()>;

    /// Receive the next inbound frame addressed to this node, along with
    /// the sender. Used by the poll loop / receive thread (spec §4.2).
    async fn recv(&self) -> Option<(NodeId, Bytes)>;

    /// Non-blocking drain of one already-arrived frame, or `None` if the
    /// inbox is currently empty. `AMPoll` uses this to reap a bounded batch
    /// per call (spec §4.2 `RCV_REAP_LIMIT`) without suspending the caller
    /// when there is nothing to do.
    async fn try_recv(&self) -> Option<(NodeId, Bytes)>;

    /// Pin (register) a region of local memory for remote access. Real
    /// conduits call the underlying `ibv_reg_mr`/`GM_RegisterMemory`
    /// equivalent; the loopback transport is a no-op that always succeeds.
    fn register_mr(&self, addr: u64, len: u64) -> Result<MrHandle>;

    /// Unpin a previously-registered region.
    fn deregister_mr(&self, handle: MrHandle) -> Result<()>;

    /// Write `data` into the peer `dest`'s pinned segment at `dest_addr`
    /// (the out-of-band RDMA path for Long operations whose payload
    /// exceeds `packedlong_limit`, per spec §4.1).
    async fn rdma_write(&self, dest: NodeId, dest_addr: u64, data: Bytes) -> Result<()>;

    /// Read `len` bytes back from the peer `src`'s pinned segment at
    /// `src_addr`. Used by the Long-RDMA-readback test scenario in spec §8.
    async fn rdma_read(&self, src: NodeId, src_addr: u64, len: u64) -> Result<Bytes>;
}
