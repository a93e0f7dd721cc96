//! The `Runtime` value spec §9 calls for: one per attached process, built
//! once by [`Runtime::init`] then [`Runtime::attach`], threaded explicitly
//! through every call site instead of living behind process globals.

use std::sync::Arc;

use bytes::Bytes;

use gasnet_core::am::engine::Engine;
use gasnet_core::handler::HandlerFn;
use gasnet_core::hsl::Hsl;
use gasnet_core::node::{NodeId, NodeMap, PhysicalId};
use gasnet_core::segment::{PinProbe, SegInfoTable, Segment};
use gasnet_core::transport::Transport;
use gasnet_core::{Config, Result, Token, WaitMode};
use gasnet_exit::ExitCoordinator;
use gasnet_firehose::{Firehose, FirehoseConfig};

/// Phase 1 of the lifecycle (spec §4 "Lifecycle": "bootstrap → probe
/// pinnable memory"): everything needed before a segment can be published.
/// The bootstrap spawner that produces `mynode`/`physical` is out of scope
/// (spec §1) — the caller is expected to have one and pass its results in.
pub struct Init<T: Transport> {
    node_map: NodeMap,
    config: Config,
    transport: Arc<T>,
    pin_probe: PinProbe,
}

impl<T: Transport> Init<T> {
    /// `init(argc*, argv*)` (spec §6), minus the argv parsing itself — the
    /// bootstrap layer that would produce `mynode`/`physical` from argv is
    /// out of scope (spec §1); its outputs are this function's inputs.
    pub fn init(mynode: NodeId, physical: Vec<PhysicalId>, config: Config, transport: Arc<T>, pin_probe: PinProbe) -> Self {
        Init {
            node_map: NodeMap::new(mynode, physical),
            config,
            transport,
            pin_probe,
        }
    }

    /// `attach(handlers[], numentries, segsize, minheapoffset)` (spec §6):
    /// publishes the segment table, merges the client's handlers with
    /// Firehose's and the exit coordinator's system entries, and makes the
    /// single bulk `register_handlers` call. Spec §8 scenario "Non-unique
    /// handler": a duplicate client index fails this call and leaves the
    /// runtime unattached, ready for a retried `attach`.
    pub async fn attach(
        self,
        handlers: &[(u8, HandlerFn)],
        segments: Vec<Segment>,
        require_aligned_segments: bool,
    ) -> Result<Arc<Runtime<T>>> {
        let seg_table = SegInfoTable::new(segments, require_aligned_segments)
            .map_err(gasnet_core::GasnetError::BadArg)?;
        let nnodes = self.node_map.nnodes();
        let engine = Engine::new(self.node_map, seg_table, self.config.clone(), self.transport)?;
        let firehose_cfg = FirehoseConfig::new(&self.config, nnodes, 0);
        let firehose = Firehose::new(engine.clone(), firehose_cfg);
        let exit_coordinator = ExitCoordinator::new(engine.clone());

        // `GASNET_USE_FIREHOSE=0` (spec §6) drops the dynamic-pinning cache
        // entirely, including its two system handlers — a conduit running
        // this mode is expected to have every segment pre-pinned already.
        let mut merged = if self.config.use_firehose { firehose.handler_entries() } else { Vec::new() };
        merged.extend(exit_coordinator.handler_entries());
        merged.extend(handlers.iter().cloned());
        engine.register_handlers(&merged).await?;

        let rcv_thread = self.config.rcv_thread;
        let runtime = Arc::new(Runtime {
            engine,
            firehose,
            exit_coordinator,
            pin_probe: self.pin_probe,
        });
        if rcv_thread {
            runtime.clone().spawn_receive_thread();
        }
        Ok(runtime)
    }
}

/// The attached runtime (spec §4 lifecycle, post-`attach`). Every client API
/// in spec §6 not already owned by `Init` hangs off this value.
pub struct Runtime<T: Transport> {
    engine: Arc<Engine<T>>,
    firehose: Arc<Firehose<T>>,
    exit_coordinator: Arc<ExitCoordinator<T>>,
    pin_probe: PinProbe,
}

impl<T: Transport> Runtime<T> {
    // -- accessors (spec §6) ----------------------------------------------

    pub fn mynode(&self) -> NodeId {
        self.engine.mynode()
    }

    pub fn nnodes(&self) -> usize {
        self.engine.nnodes()
    }

    pub fn max_local_segment_size(&self) -> u64 {
        self.pin_probe.max_local_segment_size
    }

    pub fn max_global_segment_size(&self) -> u64 {
        self.pin_probe.max_global_segment_size(self.nnodes())
    }

    pub fn max_args(&self) -> usize {
        self.engine.config().max_args
    }

    pub fn max_medium(&self) -> u32 {
        self.engine.config().max_medium
    }

    pub fn max_long_request(&self) -> u32 {
        self.engine.config().max_long_request
    }

    pub fn max_long_reply(&self) -> u32 {
        self.engine.config().max_long_reply
    }

    pub fn seginfo_table(&self) -> &SegInfoTable {
        self.engine.seg_table()
    }

    pub fn firehose(&self) -> &Arc<Firehose<T>> {
        &self.firehose
    }

    pub fn exit_coordinator(&self) -> &Arc<ExitCoordinator<T>> {
        &self.exit_coordinator
    }

    pub fn engine(&self) -> &Arc<Engine<T>> {
        &self.engine
    }

    /// Re-registers the whole handler table with `extra` merged in
    /// alongside fresh Firehose/exit entries. Needed because
    /// `HandlerTable::register` replaces the table wholesale (spec §8
    /// property 1 relies on that for `attach`'s own non-unique-index check)
    /// — a handler that itself needs an `Arc<Runtime<T>>` can only be built
    /// after `attach` returns one, so it cannot ride in `attach`'s own
    /// `handlers` argument the way a handler closing only over application
    /// state can.
    pub async fn extend_handlers(&self, extra: &[(u8, HandlerFn)]) -> Result<()> {
        let mut merged = if self.engine.config().use_firehose { self.firehose.handler_entries() } else { Vec::new() };
        merged.extend(self.exit_coordinator.handler_entries());
        merged.extend(extra.iter().cloned());
        self.engine.register_handlers(&merged).await
    }

    /// The signal the `AMPoll` spin loop should select on alongside its real
    /// work so it stops cooperatively once `exit` reaches Tail.
    pub fn shutdown_signal(&self) -> gasnet_shutdown::ShutdownSignal {
        self.exit_coordinator.shutdown_signal()
    }

    // -- AM entry points (spec §6 "six AM entry points", plus the
    // non-blocking Long variant spec §4.1/§9 documents as its own ownership
    // mode rather than folding it into AMRequestLong's signature) ---------

    pub async fn am_request_short(&self, dest: NodeId, handler_id: u8, args: Vec<u32>) -> Result<()> {
        self.engine.am_request_short(dest, handler_id, args).await
    }

    pub async fn am_request_medium(&self, dest: NodeId, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.engine.am_request_medium(dest, handler_id, args, payload).await
    }

    /// Ensures both endpoints are pinned via Firehose before posting the
    /// Long (spec §4.4: "Firehose is consulted on Long-category operations
    /// to ensure both endpoints of an RDMA are pinned"), and releases the
    /// hold once the transfer is posted. A no-op when `GASNET_USE_FIREHOSE=0`
    /// (spec §6): the peer's whole segment is then assumed pre-pinned, so
    /// there is nothing for Firehose to acquire or release.
    async fn acquire_remote_if_enabled(&self, peer: NodeId, addr: u64, len: u64) -> Result<()> {
        if self.engine.config().use_firehose {
            self.firehose.acquire_remote(peer, addr, len).await
        } else {
            Ok(())
        }
    }

    async fn release_remote_if_enabled(&self, peer: NodeId, addr: u64, len: u64) {
        if self.engine.config().use_firehose {
            self.firehose.release_remote(peer, addr, len).await;
        }
    }

    pub async fn am_request_long(&self, dest: NodeId, handler_id: u8, args: Vec<u32>, payload: Bytes, dest_addr: u64) -> Result<()> {
        let len = payload.len() as u64;
        self.acquire_remote_if_enabled(dest, dest_addr, len).await?;
        let result = self.engine.am_request_long(dest, handler_id, args, payload, dest_addr).await;
        self.release_remote_if_enabled(dest, dest_addr, len).await;
        result
    }

    pub async fn am_request_long_async(self: &Arc<Self>, dest: NodeId, handler_id: u8, args: Vec<u32>, payload: Bytes, dest_addr: u64) -> Result<()> {
        let len = payload.len() as u64;
        self.acquire_remote_if_enabled(dest, dest_addr, len).await?;
        let result = self.engine.am_request_long_async(dest, handler_id, args, payload, dest_addr).await;
        self.release_remote_if_enabled(dest, dest_addr, len).await;
        result
    }

    pub async fn am_reply_short(&self, token: &Token, handler_id: u8, args: Vec<u32>) -> Result<()> {
        self.engine.am_reply_short(token, handler_id, args).await
    }

    pub async fn am_reply_medium(&self, token: &Token, handler_id: u8, args: Vec<u32>, payload: Bytes) -> Result<()> {
        self.engine.am_reply_medium(token, handler_id, args, payload).await
    }

    pub async fn am_reply_long(&self, token: &Token, handler_id: u8, args: Vec<u32>, payload: Bytes, dest_addr: u64) -> Result<()> {
        let source = token.source();
        let len = payload.len() as u64;
        self.acquire_remote_if_enabled(source, dest_addr, len).await?;
        let result = self.engine.am_reply_long(token, handler_id, args, payload, dest_addr).await;
        self.release_remote_if_enabled(source, dest_addr, len).await;
        result
    }

    pub fn am_get_msg_source(&self, token: &Token) -> NodeId {
        self.engine.am_get_msg_source(token)
    }

    /// `AMPoll()` (spec §6): drains and dispatches inbound frames once.
    pub async fn am_poll(self: &Arc<Self>) -> Result<usize> {
        self.engine.poll().await
    }

    /// The `RCV_THREAD=1` alternative to a client driving `AMPoll` itself
    /// (spec §4.2 "Receive path", §6): a background task that reaps and
    /// dispatches inbound frames until `exit` reaches Tail, using the
    /// blocking or spinning transport call named by `GASNET_WAIT_MODE`.
    /// Mirrors the teacher's actor pattern — a `tokio::spawn(...run())` task
    /// owning the receive loop rather than the caller's own thread.
    fn spawn_receive_thread(self: Arc<Self>) {
        let wait_mode = self.engine.config().wait_mode;
        tokio::spawn(async move {
            let shutdown = self.shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    result = Self::poll_once(&self.engine, wait_mode) => {
                        if let Err(error) = result {
                            tracing::error!(%error, "dedicated receive thread poll failed");
                        }
                    }
                }
                if matches!(wait_mode, WaitMode::Spin) {
                    tokio::task::yield_now().await;
                }
            }
        });
    }

    async fn poll_once(engine: &Arc<Engine<T>>, wait_mode: WaitMode) -> Result<usize> {
        match wait_mode {
            WaitMode::Spin => engine.poll().await,
            WaitMode::Block | WaitMode::SpinBlock => engine.poll_blocking().await,
        }
    }

    // -- HSL (spec §6 "three HSL operations": init, lock, unlock) ----------
    // `lock`/`unlock` are `Hsl::lock` and the returned guard's `Drop`;
    // `hsl_init` is the one operation this facade adds, since an `Hsl<T>`
    // does not depend on any attached-runtime state.

    pub fn hsl_init<V>(value: V) -> Hsl<V> {
        Hsl::new(value)
    }

    // -- exit (spec §6, §4.5) ----------------------------------------------

    /// `exit(code)` (spec §6): runs Head/Election/Body/Tail to completion
    /// and returns the job's final exit code. The caller (a `main` binary,
    /// never this library) is responsible for calling
    /// `std::process::exit(code)` with the result.
    pub async fn exit(self: &Arc<Self>, code: i32) -> i32 {
        self.exit_coordinator.exit(code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasnet_core::node::PhysicalId;
    use gasnet_core::segment::Segment;
    use gasnet_core::transport::{LoopbackNetwork, LoopbackTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn attach_pair() -> (Arc<Runtime<LoopbackTransport>>, Arc<Runtime<LoopbackTransport>>) {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let probe = PinProbe { max_local_segment_size: 1 << 30, max_pinnable_memory: 1 << 32 };
        let physical = |_n: u32| vec![PhysicalId(0), PhysicalId(1)];
        let segs = || vec![Segment { base: 0, size: 1 << 20 }, Segment { base: 0, size: 1 << 20 }];
        let r0 = Init::init(NodeId(0), physical(0), Config::default(), Arc::new(t0), probe)
            .attach(&[], segs(), false)
            .await
            .unwrap();
        let r1 = Init::init(NodeId(1), physical(1), Config::default(), Arc::new(t1), probe)
            .attach(&[], segs(), false)
            .await
            .unwrap();
        (r0, r1)
    }

    /// `GASNET_USE_FIREHOSE=0` must still land a Long RDMA — the dynamic
    /// pinning cache is skipped entirely rather than required.
    #[tokio::test]
    async fn long_rdma_lands_with_firehose_disabled() {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let probe = PinProbe { max_local_segment_size: 1 << 30, max_pinnable_memory: 1 << 32 };
        let physical = |_n: u32| vec![PhysicalId(0), PhysicalId(1)];
        let segs = || vec![Segment { base: 0, size: 1 << 20 }, Segment { base: 0, size: 1 << 20 }];
        let mut cfg = Config::default();
        cfg.use_firehose = false;

        const H_NOOP: u8 = 220;
        let landed = Arc::new(AtomicU32::new(0));
        let l = landed.clone();
        let noop: HandlerFn = std::sync::Arc::new(move |_t, _a, _p, _d| {
            let l = l.clone();
            Box::pin(async move { l.fetch_add(1, Ordering::SeqCst); })
        });

        let r0 = Init::init(NodeId(0), physical(0), cfg.clone(), Arc::new(t0), probe)
            .attach(&[], segs(), false)
            .await
            .unwrap();
        let r1 = Init::init(NodeId(1), physical(1), cfg, Arc::new(t1), probe)
            .attach(&[(H_NOOP, noop)], segs(), false)
            .await
            .unwrap();

        let payload = Bytes::from(vec![0xEDu8; 4096]);
        r0.am_request_long(NodeId(1), H_NOOP, vec![], payload.clone(), 1024).await.unwrap();
        r1.am_poll().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(landed.load(Ordering::SeqCst), 1);

        let back = r0.engine().transport().rdma_read(NodeId(1), 1024, 4096).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn short_echo_round_trips_via_the_facade() {
        const H_ECHO: u8 = 200;
        const H_ACK: u8 = 201;
        let (r0, r1) = attach_pair().await;

        let acked = Arc::new(AtomicU32::new(0));
        let a = acked.clone();
        let r0_for_handler = r0.clone();
        r0.engine
            .register_handlers(&[(
                H_ACK,
                std::sync::Arc::new(move |_t, args: Vec<u32>, _p, _d| {
                    let a = a.clone();
                    let _ = &r0_for_handler;
                    Box::pin(async move {
                        assert_eq!(args, vec![0x1111_1111, 0x2222_2222]);
                        a.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )])
            .await
            .unwrap();

        let r1_for_handler = r1.clone();
        r1.engine
            .register_handlers(&[(
                H_ECHO,
                std::sync::Arc::new(move |token, _args, _p, _d| {
                    let r1 = r1_for_handler.clone();
                    Box::pin(async move {
                        r1.am_reply_short(&token, H_ACK, vec![0x1111_1111, 0x2222_2222]).await.unwrap();
                    })
                }),
            )])
            .await
            .unwrap();

        r0.am_request_short(NodeId(1), H_ECHO, vec![]).await.unwrap();
        r1.am_poll().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        r0.am_poll().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    /// `RCV_THREAD=1` (here: `Config::rcv_thread = true`) must dispatch
    /// inbound frames without either side ever calling `am_poll` itself.
    #[tokio::test]
    async fn dedicated_receive_thread_dispatches_without_manual_poll() {
        const H_ECHO: u8 = 210;
        const H_ACK: u8 = 211;

        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let probe = PinProbe { max_local_segment_size: 1 << 30, max_pinnable_memory: 1 << 32 };
        let physical = |_n: u32| vec![PhysicalId(0), PhysicalId(1)];
        let segs = || vec![Segment { base: 0, size: 1 << 20 }, Segment { base: 0, size: 1 << 20 }];
        let mut cfg = Config::default();
        cfg.rcv_thread = true;

        let acked = Arc::new(AtomicU32::new(0));
        let a = acked.clone();
        let ack_handler: HandlerFn = std::sync::Arc::new(move |_t, _a, _p, _d| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
            })
        });

        let r0 = Init::init(NodeId(0), physical(0), cfg.clone(), Arc::new(t0), probe)
            .attach(&[(H_ACK, ack_handler)], segs(), false)
            .await
            .unwrap();

        let r0_for_echo = r0.clone();
        let echo_handler: HandlerFn = std::sync::Arc::new(move |token, args: Vec<u32>, _p, _d| {
            let r0 = r0_for_echo.clone();
            Box::pin(async move {
                r0.am_reply_short(&token, H_ACK, args).await.unwrap();
            })
        });
        let r1 = Init::init(NodeId(1), physical(1), cfg, Arc::new(t1), probe)
            .attach(&[(H_ECHO, echo_handler)], segs(), false)
            .await
            .unwrap();

        r0.am_request_short(NodeId(1), H_ECHO, vec![42]).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(500), async {
            while acked.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dedicated receive thread should have dispatched the echo round trip");
    }

    #[test]
    fn hsl_init_lock_unlock_round_trip() {
        let hsl = Runtime::<LoopbackTransport>::hsl_init(7u32);
        {
            let mut guard = hsl.lock();
            *guard += 1;
        }
        assert_eq!(*hsl.lock(), 8);
    }
}
