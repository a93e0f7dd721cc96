//! The Active Message engine (spec §4.1, §4.2): ties the node map, segment
//! table, handler table, buffer arena and per-peer credit pool to a
//! `Transport` and exposes the six `AMRequest*`/`AMReply*` entry points plus
//! `AMGetMsgSource` and `AMPoll`. Grounded in the teacher's actor-handle
//! shape (a long-lived resource behind an `Arc`, methods taking `&self` or
//! `self: &Arc<Self>` where a spawned task needs its own handle) rather than
//! a raw mutable struct passed around by the caller.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{RwLock, Semaphore};

use super::frame::{AmFrame, Category, Cmd, BUCKET_ALIGN};
use super::token::Token;
use crate::buffer::{BouncePool, BufferArena, TokenPool, BOUNCE_CHUNK_SIZE};
use crate::config::Config;
use crate::error::{GasnetError, Result};
use crate::handler::{HandlerFn, HandlerTable};
use crate::node::{NodeId, NodeMap};
use crate::segment::SegInfoTable;
use crate::transport::Transport;

/// System handler ids are reserved below the client's `CORE_RANGE` start so
/// `gasnet-exit`/`gasnet-firehose` can register against the same table
/// without colliding with application handlers (SPEC_FULL.md §2 "Fixed
/// system AM handler ids").
pub const SYS_EXIT_ROLE_REQ: u8 = 1;
pub const SYS_EXIT_ROLE_REP: u8 = 2;
pub const SYS_EXIT_REQ: u8 = 3;
pub const SYS_EXIT_REP: u8 = 4;
pub const SYS_FH_MOVE_REQ: u8 = 5;
pub const SYS_FH_MOVE_REP: u8 = 6;

/// The AM engine. One instance per attached process.
pub struct Engine<T: Transport> {
    node_map: NodeMap,
    seg_table: SegInfoTable,
    config: Config,
    handlers: RwLock<HandlerTable>,
    transport: Arc<T>,
    arena: BufferArena,
    send_tokens: Arc<TokenPool>,
    /// Staging pool for the bulk (non-packed) half of a Long RDMA (spec
    /// §4.2 "RDMA bounce buffers"): the caller-owned source `Bytes` is
    /// copied through one of these prepinned slots, chunk by chunk, rather
    /// than posted directly — modeling "source is not pinned" as the
    /// common case for library-supplied buffers.
    bounce: Arc<BouncePool>,
    /// One request-credit semaphore per peer (spec §4.2 "Flow control");
    /// a request consumes a permit before it is sent, a reply replenishes
    /// one on arrival, regardless of which outstanding request it answers.
    credits: Vec<Arc<Semaphore>>,
}

impl<T: Transport> Engine<T> {
    pub fn new(node_map: NodeMap, seg_table: SegInfoTable, config: Config, transport: Arc<T>) -> Result<Arc<Self>> {
        let send_tokens_count = (config.am_credits_pp.max(2)) as usize;
        let recv_tokens_count = send_tokens_count;
        let slot_size = config
            .max_medium
            .max(config.packedlong_limit)
            .max(BUCKET_ALIGN as u32) as usize;
        let arena = BufferArena::new(send_tokens_count, recv_tokens_count, slot_size)?;
        let send_tokens = Arc::new(TokenPool::new(arena.request_scratch_slots().to_vec()));
        let bounce = Arc::new(BouncePool::new(config.bbuf_count.max(1) as usize, BOUNCE_CHUNK_SIZE));
        let nnodes = node_map.nnodes();
        let credits = (0..nnodes)
            .map(|_| Arc::new(Semaphore::new(config.am_credits_pp as usize)))
            .collect();
        Ok(Arc::new(Engine {
            node_map,
            seg_table,
            config,
            handlers: RwLock::new(HandlerTable::new()),
            transport,
            arena,
            send_tokens,
            bounce,
            credits,
        }))
    }

    pub fn mynode(&self) -> NodeId {
        self.node_map.mynode()
    }

    pub fn nnodes(&self) -> usize {
        self.node_map.nnodes()
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    pub fn seg_table(&self) -> &SegInfoTable {
        &self.seg_table
    }

    /// Exposes the underlying conduit primitives (`register_mr`,
    /// `deregister_mr`, `rdma_write`/`rdma_read`) to collaborators layered
    /// above the engine — `gasnet-firehose`'s `FH_MOVE_REQ` handler pins and
    /// unpins through this handle rather than duplicating a transport of
    /// its own (spec §4.4 "FH_MOVE_REQ handler").
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Publish the client's handlers at `attach` time. Spec §8 scenario
    /// "Non-unique handler": a failed registration must leave any prior
    /// table untouched, which `HandlerTable::register` already guarantees.
    pub async fn register_handlers(&self, entries: &[(u8, HandlerFn)]) -> Result<()> {
        self.handlers.write().await.register(entries)
    }

    fn validate_dest(&self, dest: NodeId) -> Result<()> {
        if !self.node_map.is_valid(dest) {
            return Err(GasnetError::BadArg(format!("no such node {dest}")));
        }
        Ok(())
    }

    fn validate_args(&self, args: &[u32]) -> Result<()> {
        if args.len() > self.config.max_args {
            return Err(GasnetError::BadArg(format!(
                "numargs {} exceeds MaxArgs {}",
                args.len(),
                self.config.max_args
            )));
        }
        Ok(())
    }

    fn consume_reply_token(&self, token: &Token) -> Result<()> {
        if !token.mark_replied() {
            return Err(GasnetError::BadArg(
                "AMReply* issued twice, or issued against a reply token".into(),
            ));
        }
        Ok(())
    }

    async fn acquire_credit(&self, dest: NodeId) -> Result<()> {
        let sem = self
            .credits
            .get(dest.as_usize())
            .ok_or_else(|| GasnetError::BadArg(format!("no such node {dest}")))?;
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("credit semaphore never closed");
        permit.forget();
        Ok(())
    }

    fn replenish_credit(&self, peer: NodeId) {
        if let Some(sem) = self.credits.get(peer.as_usize()) {
            sem.add_permits(1);
        }
    }

    /// Requests flow through the shared token pool (spec §3 "Token pool":
    /// "(send_tokens - 1) request scratch buffers").
    async fn send_request_frame(&self, dest: NodeId, frame: AmFrame) -> Result<()> {
        let bytes = frame.encode()?;
        let permit = self.send_tokens.acquire().await;
        self.arena.write(permit.id(), &bytes).await?;
        let out = self.arena.read(permit.id(), bytes.len()).await?;
        self.transport.send(dest, Bytes::from(out)).await
    }

    /// Replies share the single reply-scratch slot (spec §3): a real
    /// handler invocation is serialized with respect to other concurrent
    /// handlers replying at the same instant, by design of that layout.
    async fn send_reply_frame(&self, dest: NodeId, frame: AmFrame) -> Result<()> {
        let bytes = frame.encode()?;
        let id = self.arena.reply_scratch();
        self.arena.write(id, &bytes).await?;
        let out = self.arena.read(id, bytes.len()).await?;
        self.transport.send(dest, Bytes::from(out)).await
    }

    /// Stream `bulk` to `dest`'s segment through the bounce pool in
    /// `BOUNCE_CHUNK_SIZE`-byte pieces (spec §4.2 "RDMA bounce buffers").
    /// Below `nonbulkput_bounce_limit` this is the only path; at or above
    /// it the chunking still applies, since this engine has no notion of an
    /// already-pinned caller buffer to DMA from directly (spec §4.1: "the
    /// engine owns copy-before-return").
    async fn stage_and_write(&self, dest: NodeId, dest_addr: u64, bulk: Bytes) -> Result<()> {
        let chunk_size = self.bounce.chunk_size();
        let mut offset = 0usize;
        while offset < bulk.len() {
            let end = (offset + chunk_size).min(bulk.len());
            let mut slot = self.bounce.acquire().await;
            let staged = slot.stage(&bulk[offset..end]).to_vec();
            self.transport.rdma_write(dest, dest_addr + offset as u64, Bytes::from(staged)).await?;
            offset = end;
        }
        Ok(())
    }

    async fn send_long(
        &self,
        dest: NodeId,
        cmd: Cmd,
        handler_id: u8,
        args: Vec<u32>,
        payload: Bytes,
        dest_addr: u64,
        is_reply: bool,
    ) -> Result<()> {
        let packed = payload.len() <= self.config.packedlong_limit as usize;
        let frame = if packed {
            AmFrame {
                cmd,
                category: Category::Long,
                handler_id,
                offset: 0,
                size: payload.len() as u32,
                dest_addr,
                tail: Bytes::new(),
                args,
                payload,
            }
        } else {
            let tail_len = payload.len() % BUCKET_ALIGN;
            let split = payload.len() - tail_len;
            let mut bulk = payload;
            let tail = bulk.split_off(split);
            self.stage_and_write(dest, dest_addr, bulk).await?;
            AmFrame {
                cmd,
                category: Category::Long,
                handler_id,
                offset: 0,
                size: (split + tail_len) as u32,
                dest_addr,
                tail,
                args,
                payload: Bytes::new(),
            }
        };
        if is_reply {
            self.send_reply_frame(dest, frame).await
        } else {
            self.send_request_frame(dest, frame).await
        }
    }

    // -- AMRequest* (spec §4.1) -------------------------------------------

    pub async fn am_request_short(&self, dest: NodeId, handler_id: u8, args: Vec<u32>) -> Result<()> {
        self.validate_dest(dest)?;
        self.validate_args(&args)?;
        self.acquire_credit(dest).await?;
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Short,
            handler_id,
            offset: 0,
            size: 0,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload: Bytes::new(),
        };
        self.send_request_frame(dest, frame).await
    }

    pub async fn am_request_medium(&self, dest: NodeId, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.validate_dest(dest)?;
        self.validate_args(&args)?;
        if payload.len() as u32 > self.config.max_medium {
            return Err(GasnetError::BadArg("medium payload exceeds MaxMedium".into()));
        }
        self.acquire_credit(dest).await?;
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Medium,
            handler_id,
            offset: 0,
            size: payload.len() as u32,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload,
        };
        self.send_request_frame(dest, frame).await
    }

    /// `dest_addr` must fall inside the receiver's published segment (spec
    /// §4.1 "An out-of-segment dest_addr in Long is a programming error
    /// reported to the caller").
    pub async fn am_request_long(
        &self,
        dest: NodeId,
        handler_id: u8,
        args: Vec<u32>,
        payload: Bytes,
        dest_addr: u64,
    ) -> Result<()> {
        self.validate_dest(dest)?;
        self.validate_args(&args)?;
        if payload.len() as u32 > self.config.max_long_request {
            return Err(GasnetError::BadArg("long payload exceeds MaxLongRequest".into()));
        }
        if !self.seg_table.bounds_check(dest, dest_addr, payload.len() as u64) {
            return Err(GasnetError::BadArg("dest_addr outside remote segment".into()));
        }
        self.acquire_credit(dest).await?;
        self.send_long(dest, Cmd::ReqMessage, handler_id, args, payload, dest_addr, false).await
    }

    /// Non-blocking variant (spec §4.1, §9): the data movement and the
    /// notification frame are handed to a background task so the caller
    /// returns once the credit has been reserved, not once the remote
    /// side has observed the write.
    pub async fn am_request_long_async(
        self: &Arc<Self>,
        dest: NodeId,
        handler_id: u8,
        args: Vec<u32>,
        payload: Bytes,
        dest_addr: u64,
    ) -> Result<()> {
        self.validate_dest(dest)?;
        self.validate_args(&args)?;
        if payload.len() as u32 > self.config.max_long_request {
            return Err(GasnetError::BadArg("long payload exceeds MaxLongRequest".into()));
        }
        if !self.seg_table.bounds_check(dest, dest_addr, payload.len() as u64) {
            return Err(GasnetError::BadArg("dest_addr outside remote segment".into()));
        }
        self.acquire_credit(dest).await?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this
                .send_long(dest, Cmd::ReqMessage, handler_id, args, payload, dest_addr, false)
                .await
            {
                tracing::error!(%error, %dest, "AMRequestLongAsync delivery failed");
            }
        });
        Ok(())
    }

    // -- AMReply* (spec §4.1) ----------------------------------------------

    pub async fn am_reply_short(&self, token: &Token, handler_id: u8, args: Vec<u32>) -> Result<()> {
        self.consume_reply_token(token)?;
        self.validate_args(&args)?;
        let frame = AmFrame {
            cmd: Cmd::ReplyMessage,
            category: Category::Short,
            handler_id,
            offset: 0,
            size: 0,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload: Bytes::new(),
        };
        self.send_reply_frame(token.source(), frame).await
    }

    pub async fn am_reply_medium(&self, token: &Token, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.consume_reply_token(token)?;
        self.validate_args(&args)?;
        if payload.len() as u32 > self.config.max_medium {
            return Err(GasnetError::BadArg("medium payload exceeds MaxMedium".into()));
        }
        let frame = AmFrame {
            cmd: Cmd::ReplyMessage,
            category: Category::Medium,
            handler_id,
            offset: 0,
            size: payload.len() as u32,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload,
        };
        self.send_reply_frame(token.source(), frame).await
    }

    pub async fn am_reply_long(
        &self,
        token: &Token,
        handler_id: u8,
        args: Vec<u32>,
        payload: Bytes,
        dest_addr: u64,
    ) -> Result<()> {
        self.consume_reply_token(token)?;
        self.validate_args(&args)?;
        if payload.len() as u32 > self.config.max_long_reply {
            return Err(GasnetError::BadArg("long payload exceeds MaxLongReply".into()));
        }
        let source = token.source();
        if !self.seg_table.bounds_check(source, dest_addr, payload.len() as u64) {
            return Err(GasnetError::BadArg("dest_addr outside remote segment".into()));
        }
        self.send_long(source, Cmd::ReplyMessage, handler_id, args, payload, dest_addr, true).await
    }

    pub fn am_get_msg_source(&self, token: &Token) -> NodeId {
        token.source()
    }

    // -- System AMs (spec §6 core handler range; grounds gasnet-exit and
    // gasnet-firehose's wire protocols without borrowing application credit
    // capacity, so exit/pin-eviction traffic keeps flowing even when a
    // client has exhausted its own credits) ------------------------------

    pub async fn am_system_request(&self, dest: NodeId, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.validate_dest(dest)?;
        self.validate_args(&args)?;
        let category = if payload.is_empty() { Category::Short } else { Category::Medium };
        let frame = AmFrame {
            cmd: Cmd::System,
            category,
            handler_id,
            offset: 0,
            size: payload.len() as u32,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload,
        };
        self.send_request_frame(dest, frame).await
    }

    pub async fn am_system_reply(&self, token: &Token, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.consume_reply_token(token)?;
        self.validate_args(&args)?;
        let category = if payload.is_empty() { Category::Short } else { Category::Medium };
        let frame = AmFrame {
            cmd: Cmd::SystemReply,
            category,
            handler_id,
            offset: 0,
            size: payload.len() as u32,
            dest_addr: 0,
            tail: Bytes::new(),
            args,
            payload,
        };
        self.send_reply_frame(token.source(), frame).await
    }

    // -- AMPoll (spec §4.2) -------------------------------------------------

    /// Drains up to `rcv_reap_limit` inbound frames, dispatching each to its
    /// handler on its own task so a slow handler cannot stall draining.
    /// Returns the number of frames reaped.
    pub async fn poll(self: &Arc<Self>) -> Result<usize> {
        let mut reaped = 0;
        for _ in 0..self.config.rcv_reap_limit {
            let Some((from, bytes)) = self.transport.try_recv().await else {
                break;
            };
            let frame = AmFrame::decode(bytes)?;
            self.dispatch(from, frame);
            reaped += 1;
        }
        Ok(reaped)
    }

    /// The `WAIT_MODE=BLOCK`/`SPINBLOCK` variant of [`Self::poll`] (spec §6):
    /// suspends on the transport's blocking `recv` for the first frame
    /// instead of returning immediately when the inbox is empty, then drains
    /// up to `rcv_reap_limit` total the same way `poll` does. Used by the
    /// dedicated receive thread (`RCV_THREAD=1`) rather than by callers
    /// driving `AMPoll` themselves.
    pub async fn poll_blocking(self: &Arc<Self>) -> Result<usize> {
        let Some((from, bytes)) = self.transport.recv().await else {
            return Ok(0);
        };
        let frame = AmFrame::decode(bytes)?;
        self.dispatch(from, frame);
        let mut reaped = 1;
        for _ in 1..self.config.rcv_reap_limit {
            let Some((from, bytes)) = self.transport.try_recv().await else {
                break;
            };
            let frame = AmFrame::decode(bytes)?;
            self.dispatch(from, frame);
            reaped += 1;
        }
        Ok(reaped)
    }

    fn dispatch(self: &Arc<Self>, from: NodeId, frame: AmFrame) {
        if matches!(frame.cmd, Cmd::ReplyMessage) {
            self.replenish_credit(from);
        }
        let token = if frame.is_request() {
            Token::new_request(from)
        } else {
            Token::new_reply(from)
        };
        // A packed Long rides entirely inside the frame and still needs
        // copying into the segment at `dest_addr` before the handler runs
        // (spec §4.1 "Packed-vs-RDMA Long", mirroring gm-conduit's
        // `gasnetc_am_medcopy_inner`). A non-packed Long already landed its
        // bulk via RDMA before this notification arrived; only its
        // sub-BUCKET_ALIGN tail still needs placing, at the end of that
        // same run.
        let landing = if frame.category.is_long() && !frame.payload.is_empty() {
            Some((self.mynode(), frame.dest_addr, frame.payload.clone()))
        } else if frame.category.is_long() && !frame.tail.is_empty() {
            let bulk_len = frame.size as u64 - frame.tail.len() as u64;
            Some((self.mynode(), frame.dest_addr + bulk_len, frame.tail.clone()))
        } else {
            None
        };
        let payload = if frame.payload.is_empty() { None } else { Some(frame.payload) };
        let dest_addr = if frame.category.is_long() { Some(frame.dest_addr) } else { None };
        let handler_id = frame.handler_id;
        let args = frame.args;
        let this = self.clone();
        tokio::spawn(async move {
            if let Some((me, addr, data)) = landing {
                if let Err(error) = this.transport.rdma_write(me, addr, data).await {
                    tracing::error!(%error, handler_id, "failed to land Long payload");
                    return;
                }
            }
            let handler = match this.handlers.read().await.get(handler_id) {
                Ok(h) => h,
                Err(error) => {
                    tracing::warn!(%error, handler_id, "dropping frame for unregistered handler");
                    return;
                }
            };
            handler(token, args, payload, dest_addr).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::node::PhysicalId;
    use crate::segment::Segment;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    fn build_pair() -> (Arc<Engine<LoopbackTransport>>, Arc<Engine<LoopbackTransport>>) {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let node_map = |me: u32| NodeMap::new(NodeId(me), vec![PhysicalId(0), PhysicalId(1)]);
        let seg_table = || {
            SegInfoTable::new(
                vec![
                    Segment { base: 0, size: 1 << 20 },
                    Segment { base: 0, size: 1 << 20 },
                ],
                false,
            )
            .unwrap()
        };
        let e0 = Engine::new(node_map(0), seg_table(), Config::default(), Arc::new(t0)).unwrap();
        let e1 = Engine::new(node_map(1), seg_table(), Config::default(), Arc::new(t1)).unwrap();
        (e0, e1)
    }

    #[tokio::test]
    async fn short_request_drives_handler_and_replies() {
        let (e0, e1) = build_pair();
        let replied = Arc::new(AtomicU32::new(0));
        let r = replied.clone();
        let e1_for_handler = e1.clone();
        e1.register_handlers(&[(
            10,
            Arc::new(move |token: Token, _args, _payload, _dest| {
                let e1 = e1_for_handler.clone();
                let r = r.clone();
                Box::pin(async move {
                    e1.am_reply_short(&token, 11, vec![]).await.unwrap();
                    r.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )])
        .await
        .unwrap();

        let acked = Arc::new(AtomicU32::new(0));
        let a = acked.clone();
        e0.register_handlers(&[(
            11,
            Arc::new(move |_t, _a, _p, _d| {
                let a = a.clone();
                Box::pin(async move {
                    a.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )])
        .await
        .unwrap();

        e0.am_request_short(NodeId(1), 10, vec![7]).await.unwrap();
        e1.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        e0.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(replied.load(Ordering::SeqCst), 1);
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn long_request_above_packed_limit_uses_rdma_then_notifies() {
        let mut cfg = Config::default();
        cfg.packedlong_limit = 16;
        let node_map = |me: u32| NodeMap::new(NodeId(me), vec![PhysicalId(0), PhysicalId(1)]);
        let seg_table = || {
            SegInfoTable::new(
                vec![
                    Segment { base: 0, size: 1 << 20 },
                    Segment { base: 0, size: 1 << 20 },
                ],
                false,
            )
            .unwrap()
        };
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let e0 = Engine::new(node_map(0), seg_table(), cfg.clone(), Arc::new(t0)).unwrap();
        let e1 = Engine::new(node_map(1), seg_table(), cfg, Arc::new(t1)).unwrap();

        let got = Arc::new(AtomicU32::new(0));
        let g = got.clone();
        e1.register_handlers(&[(
            20,
            Arc::new(move |_t, _a, payload: Option<Bytes>, dest_addr: Option<u64>| {
                let g = g.clone();
                Box::pin(async move {
                    assert!(payload.is_none());
                    assert_eq!(dest_addr, Some(256));
                    g.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )])
        .await
        .unwrap();

        let payload = Bytes::from(vec![9u8; 200]);
        e0.am_request_long(NodeId(1), 20, vec![], payload, 256).await.unwrap();
        e1.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    /// Spans several `BOUNCE_CHUNK_SIZE`-sized bounce pool acquisitions
    /// (spec §4.2 "RDMA bounce buffers"): the readback must still be
    /// bit-identical across chunk boundaries.
    #[tokio::test]
    async fn long_payload_spanning_multiple_bounce_chunks_lands_intact() {
        let mut cfg = Config::default();
        cfg.packedlong_limit = 16;
        cfg.bbuf_count = 2;
        let node_map = |me: u32| NodeMap::new(NodeId(me), vec![PhysicalId(0), PhysicalId(1)]);
        let seg_table = || {
            SegInfoTable::new(
                vec![
                    Segment { base: 0, size: 1 << 20 },
                    Segment { base: 0, size: 1 << 20 },
                ],
                false,
            )
            .unwrap()
        };
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let e0 = Engine::new(node_map(0), seg_table(), cfg.clone(), Arc::new(t0)).unwrap();
        let e1 = Engine::new(node_map(1), seg_table(), cfg, Arc::new(t1)).unwrap();

        let expected: Vec<u8> = (0..=255u8).cycle().take(crate::buffer::BOUNCE_CHUNK_SIZE * 3 + 17).collect();
        e0.am_request_long(NodeId(1), 20, vec![], Bytes::from(expected.clone()), 4096)
            .await
            .unwrap();
        e1.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let landed = e1.transport().rdma_read(NodeId(1), 4096, expected.len() as u64).await.unwrap();
        assert_eq!(landed, Bytes::from(expected));
    }

    /// `poll_blocking` (the `WAIT_MODE=BLOCK`/`SPINBLOCK` receive path)
    /// suspends rather than returning `Ok(0)` immediately, and still
    /// dispatches once a frame lands.
    #[tokio::test]
    async fn poll_blocking_suspends_until_a_frame_arrives() {
        let (e0, e1) = build_pair();
        let got = Arc::new(AtomicU32::new(0));
        let g = got.clone();
        e1.register_handlers(&[(20, Arc::new(move |_t, _a, _p, _d| {
            let g = g.clone();
            Box::pin(async move { g.fetch_add(1, Ordering::SeqCst); })
        }))])
        .await
        .unwrap();

        let e1_poll = e1.clone();
        let poller = tokio::spawn(async move { e1_poll.poll_blocking().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!poller.is_finished(), "poll_blocking must suspend while the inbox is empty");

        e0.am_request_short(NodeId(1), 20, vec![]).await.unwrap();
        let reaped = tokio::time::timeout(Duration::from_millis(200), poller).await.unwrap().unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_blocks_when_peer_credits_exhausted() {
        let (e0, e1) = build_pair();
        let _ = e1;
        // drain every credit for node 1
        for _ in 0..e0.config().am_credits_pp {
            e0.am_request_short(NodeId(1), 10, vec![]).await.unwrap();
        }
        let attempt = e0.am_request_short(NodeId(1), 10, vec![]);
        tokio::select! {
            _ = attempt => panic!("request should not complete with no credits available"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn reply_against_a_reply_token_is_rejected() {
        let (e0, _e1) = build_pair();
        let token = Token::new_reply(NodeId(1));
        let err = e0.am_reply_short(&token, 11, vec![]).await.unwrap_err();
        matches!(err, GasnetError::BadArg(_));
    }
}
