//! The prepinned buffer arena, buffer descriptors (bufds) and the send
//! token pool (spec §3 "Buffer descriptor (bufd)", "Token pool"; §4.2
//! "Send path").

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{GasnetError, Result};
use crate::node::NodeId;

bitflags::bitflags! {
    /// Category flags carried by a bufd, per spec §3.
    pub struct BufdFlags: u8 {
        const AM_REQ   = 0b0001;
        const AM_REPLY = 0b0010;
        const PAYLOAD  = 0b0100;
        const DMA      = 0b1000;
    }
}

/// Opaque identifier for a slot in the buffer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Metadata for one slot in the prepinned buffer arena (spec §3).
#[derive(Debug, Clone)]
pub struct BufDescriptor {
    pub id: BufferId,
    pub owning_node: Option<NodeId>,
    pub flags: BufdFlags,
    pub len: usize,
    pub source_addr: Option<u64>,
    pub dest_addr: Option<u64>,
}

/// The prepinned send/receive buffer arena. Per spec §3: "Exactly one arena
/// of descriptors exists per process; arenas are divided into: one reply
/// scratch buffer, (send_tokens - 1) request scratch buffers, and half of
/// the receive tokens for requests / half for replies."
pub struct BufferArena {
    slots: Vec<Mutex<Vec<u8>>>,
    descriptors: Vec<Mutex<BufDescriptor>>,
    reply_scratch: BufferId,
    request_scratch: Vec<BufferId>,
    recv_request: Vec<BufferId>,
    recv_reply: Vec<BufferId>,
    slot_size: usize,
}

impl BufferArena {
    pub fn new(send_tokens: usize, recv_tokens: usize, slot_size: usize) -> Result<Self> {
        if send_tokens == 0 {
            return Err(GasnetError::Resource("send_tokens must be > 0".into()));
        }
        let total = send_tokens + recv_tokens;
        let mut slots = Vec::with_capacity(total);
        let mut descriptors = Vec::with_capacity(total);
        for i in 0..total {
            slots.push(Mutex::new(vec![0u8; slot_size]));
            descriptors.push(Mutex::new(BufDescriptor {
                id: BufferId(i as u32),
                owning_node: None,
                flags: BufdFlags::empty(),
                len: 0,
                source_addr: None,
                dest_addr: None,
            }));
        }
        let reply_scratch = BufferId(0);
        let request_scratch = (1..send_tokens as u32).map(BufferId).collect();
        let half = recv_tokens / 2;
        let recv_request = (send_tokens as u32..(send_tokens + half) as u32).map(BufferId).collect();
        let recv_reply =
            ((send_tokens + half) as u32..(send_tokens + recv_tokens) as u32).map(BufferId).collect();
        Ok(BufferArena {
            slots,
            descriptors,
            reply_scratch,
            request_scratch,
            recv_request,
            recv_reply,
            slot_size,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn reply_scratch(&self) -> BufferId {
        self.reply_scratch
    }

    pub fn request_scratch_slots(&self) -> &[BufferId] {
        &self.request_scratch
    }

    pub fn recv_request_slots(&self) -> &[BufferId] {
        &self.recv_request
    }

    pub fn recv_reply_slots(&self) -> &[BufferId] {
        &self.recv_reply
    }

    pub async fn write(&self, id: BufferId, data: &[u8]) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(GasnetError::BadArg("payload exceeds buffer slot size".into()));
        }
        let mut slot = self.slots[id.0 as usize].lock().await;
        slot[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub async fn read(&self, id: BufferId, len: usize) -> Result<Vec<u8>> {
        let slot = self.slots[id.0 as usize].lock().await;
        Ok(slot[..len].to_vec())
    }

    pub async fn describe(&self, id: BufferId) -> BufDescriptor {
        self.descriptors[id.0 as usize].lock().await.clone()
    }

    pub async fn set_descriptor(&self, id: BufferId, f: impl FnOnce(&mut BufDescriptor)) {
        let mut d = self.descriptors[id.0 as usize].lock().await;
        f(&mut d);
    }
}

/// A fixed-capacity LIFO stack of send bufd ids, bounded by the transport's
/// send-token count (spec §3 "Token pool", §4.2 "Send path": "acquire a
/// send token (stack pop, blocks via condition variable if empty)").
pub struct TokenPool {
    free: Mutex<Vec<BufferId>>,
    semaphore: tokio::sync::Semaphore,
}

impl TokenPool {
    pub fn new(tokens: Vec<BufferId>) -> Self {
        let n = tokens.len();
        TokenPool {
            free: Mutex::new(tokens),
            semaphore: tokio::sync::Semaphore::new(n),
        }
    }

    /// Acquire a send token, blocking (suspending) until one is free. This
    /// is the `token_free` suspension condition named in spec §5.
    pub async fn acquire(self: &Arc<Self>) -> TokenPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("token pool semaphore never closed");
        let id = self.free.lock().await.pop().expect("permit implies a free slot");
        TokenPermit {
            id,
            pool: self.clone(),
            _permit: permit,
        }
    }

    async fn release(&self, id: BufferId) {
        self.free.lock().await.push(id);
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// An owned send-token slot; returned to the pool on drop, matching spec
/// §9's "buffer held until WR-completion" ownership note.
pub struct TokenPermit {
    id: BufferId,
    pool: Arc<TokenPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl TokenPermit {
    pub fn id(&self) -> BufferId {
        self.id
    }
}

impl Drop for TokenPermit {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let id = self.id;
        tokio::spawn(async move {
            pool.release(id).await;
        });
    }
}

/// Chunk size used to stream an unpinned Long source buffer through the
/// bounce pool (spec §4.2 "RDMA bounce buffers"). Not independently
/// configurable upstream — only `GASNET_BBUF_COUNT` (the pool's depth) is
/// named in spec §6 — so this is a fixed implementation constant.
pub const BOUNCE_CHUNK_SIZE: usize = 16 * 1024;

/// A small stack of prepinned staging buffers (spec §3 "Buffer descriptor",
/// §4.2 "RDMA bounce buffers": "a small stack (size BBUF_COUNT) of
/// prepinned buffers for staging unpinned-local data during Long
/// operations; bounce acquisition blocks on its own condition variable").
/// Used as the fallback path when a Long's source buffer is copied into a
/// prepinned slot before being handed to the transport, rather than posted
/// directly from caller-owned (and therefore possibly unpinned) memory.
pub struct BouncePool {
    slots: Mutex<Vec<Vec<u8>>>,
    semaphore: Arc<tokio::sync::Semaphore>,
    chunk_size: usize,
}

impl BouncePool {
    pub fn new(count: usize, chunk_size: usize) -> Self {
        BouncePool {
            slots: Mutex::new((0..count).map(|_| vec![0u8; chunk_size]).collect()),
            semaphore: Arc::new(tokio::sync::Semaphore::new(count)),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Acquire one staging buffer, suspending (the `bounce_free` condition
    /// named in spec §5) until the pool has a free slot.
    pub async fn acquire(self: &Arc<Self>) -> BounceSlot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("bounce pool semaphore never closed");
        let buf = self.slots.lock().await.pop().expect("permit implies a free slot");
        BounceSlot {
            buf: Some(buf),
            pool: self.clone(),
            _permit: permit,
        }
    }

    async fn release(&self, buf: Vec<u8>) {
        self.slots.lock().await.push(buf);
    }
}

/// An owned staging buffer, returned to the pool on drop.
pub struct BounceSlot {
    buf: Option<Vec<u8>>,
    pool: Arc<BouncePool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl BounceSlot {
    /// Copy `data` (at most `chunk_size` bytes) into this staging buffer and
    /// return the filled prefix, modeling the copy-before-RDMA step spec
    /// §4.2 describes.
    pub fn stage<'a>(&'a mut self, data: &[u8]) -> &'a [u8] {
        let buf = self.buf.as_mut().expect("buffer taken before drop");
        buf[..data.len()].copy_from_slice(data);
        &buf[..data.len()]
    }
}

impl Drop for BounceSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(buf).await;
            });
        }
    }
}
