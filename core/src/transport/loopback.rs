//! An in-process, channel-based `Transport` used for tests and examples.
//! Mirrors the teacher's `transports::MemoryTransport`, extended with a
//! shared byte-array per node standing in for a pinned segment so that
//! `rdma_write`/`rdma_read` have somewhere to land.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{MrHandle, Transport};
use crate::error::{GasnetError, Result};
use crate::node::NodeId;

type Inbox = Mutex<mpsc::UnboundedReceiver<(NodeId, Bytes)>>;

/// Shared backing store for one node's segment, addressed by byte offset
/// from the segment base. Grows on demand — real conduits pre-allocate the
/// whole segment at `attach` time; the loopback transport defers that to
/// keep test setup trivial.
type SegmentMemory = Arc<Mutex<Vec<u8>>>;

/// A clique of `LoopbackTransport`s that can reach one another, built once
/// via [`LoopbackNetwork::build`].
pub struct LoopbackNetwork {
    outboxes: Vec<mpsc::UnboundedSender<(NodeId, Bytes)>>,
    segments: Vec<SegmentMemory>,
}

impl LoopbackNetwork {
    /// Build `nnodes` connected transports, one per logical node.
    pub fn build(nnodes: usize) -> Vec<LoopbackTransport> {
        let mut outboxes = Vec::with_capacity(nnodes);
        let mut inboxes = Vec::with_capacity(nnodes);
        for _ in 0..nnodes {
            let (tx, rx) = mpsc::unbounded_channel();
            outboxes.push(tx);
            inboxes.push(Mutex::new(rx));
        }
        let segments: Vec<SegmentMemory> = (0..nnodes).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let net = Arc::new(LoopbackNetwork { outboxes, segments });

        inboxes
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| LoopbackTransport {
                me: NodeId(i as u32),
                net: net.clone(),
                inbox: Arc::new(inbox),
            })
            .collect()
    }
}

pub struct LoopbackTransport {
    me: NodeId,
    net: Arc<LoopbackNetwork>,
    inbox: Arc<Inbox>,
}

impl LoopbackTransport {
    async fn ensure_len(mem: &SegmentMemory, len: usize) {
        let mut guard = mem.lock().await;
        if guard.len() < len {
            guard.resize(len, 0);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, dest: NodeId, frame: Bytes) -> Result<()> {
        let tx = self
            .net
            .outboxes
            .get(dest.as_usize())
            .ok_or_else(|| GasnetError::BadArg(format!("no such node {dest}")))?;
        tx.send((self.me, frame))
            .map_err(|_| GasnetError::RawMessage(format!("peer {dest} inbox closed")))
    }

    async fn recv(&self) -> Option<(NodeId, Bytes)> {
        self.inbox.lock().await.recv().await
    }

    async fn try_recv(&self) -> Option<(NodeId, Bytes)> {
        self.inbox.lock().await.try_recv().ok()
    }

    fn register_mr(&self, addr: u64, _len: u64) -> Result<MrHandle> {
        Ok(MrHandle(addr))
    }

    fn deregister_mr(&self, _handle: MrHandle) -> Result<()> {
        Ok(())
    }

    async fn rdma_write(&self, dest: NodeId, dest_addr: u64, data: Bytes) -> Result<()> {
        let mem = self
            .net
            .segments
            .get(dest.as_usize())
            .ok_or_else(|| GasnetError::BadArg(format!("no such node {dest}")))?;
        let end = dest_addr as usize + data.len();
        Self::ensure_len(mem, end).await;
        let mut guard = mem.lock().await;
        guard[dest_addr as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn rdma_read(&self, src: NodeId, src_addr: u64, len: u64) -> Result<Bytes> {
        let mem = self
            .net
            .segments
            .get(src.as_usize())
            .ok_or_else(|| GasnetError::BadArg(format!("no such node {src}")))?;
        let end = src_addr as usize + len as usize;
        Self::ensure_len(mem, end).await;
        let guard = mem.lock().await;
        Ok(Bytes::copy_from_slice(&guard[src_addr as usize..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_recv_round_trips() {
        let mut nodes = LoopbackNetwork::build(2);
        let n1 = nodes.pop().unwrap();
        let n0 = nodes.pop().unwrap();
        n0.send(NodeId(1), Bytes::from_static(b"hello")).await.unwrap();
        let (from, bytes) = n1.recv().await.unwrap();
        assert_eq!(from, NodeId(0));
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn try_recv_is_non_blocking() {
        let mut nodes = LoopbackNetwork::build(2);
        let n1 = nodes.pop().unwrap();
        let n0 = nodes.pop().unwrap();
        assert!(n1.try_recv().await.is_none());
        n0.send(NodeId(1), Bytes::from_static(b"x")).await.unwrap();
        let (from, bytes) = n1.try_recv().await.unwrap();
        assert_eq!(from, NodeId(0));
        assert_eq!(bytes, Bytes::from_static(b"x"));
        assert!(n1.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn rdma_write_then_read() {
        let mut nodes = LoopbackNetwork::build(2);
        let n1 = nodes.pop().unwrap();
        let n0 = nodes.pop().unwrap();
        n0.rdma_write(NodeId(1), 128, Bytes::from_static(b"payload")).await.unwrap();
        let back = n0.rdma_read(NodeId(1), 128, 7).await.unwrap();
        assert_eq!(back, Bytes::from_static(b"payload"));
        let _ = n1;
    }
}
