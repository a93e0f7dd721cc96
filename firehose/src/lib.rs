//! GASNet-rs Firehose: the two-sided dynamic-pinning bucket cache that
//! amortizes memory-registration cost across Long RDMA operations and
//! enforces a global budget of pinned pages per peer (spec §4.4).
//!
//! Layered directly on `gasnet-core`'s `Engine`: Firehose registers two
//! entries in the shared handler table (`SYS_FH_MOVE_REQ`/`SYS_FH_MOVE_REP`)
//! and otherwise only calls public `Engine`/`Transport` methods, the same
//! way `tari_comms_dht` layers its own cache actor on top of `tari_comms`'s
//! connection manager rather than reaching into its internals.

pub mod bucket;
pub mod config;
pub mod table;
pub mod wire;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use gasnet_core::am::engine::{Engine, SYS_FH_MOVE_REP, SYS_FH_MOVE_REQ};
use gasnet_core::am::token::Token;
use gasnet_core::handler::HandlerFn;
use gasnet_core::node::NodeId;
use gasnet_core::transport::{MrHandle, Transport};
use gasnet_core::Result;

pub use bucket::{LocalBucketRecord, PendingAcquire, RemoteBucketState};
pub use config::FirehoseConfig;
pub use table::Table;
pub use wire::{coalesce, FhMoveRep, FhMoveReq, Region, RegionKeys};

use bucket::buckets_for_range;

/// The Firehose cache for one attached process. One instance per `Engine`.
pub struct Firehose<T: Transport> {
    engine: Arc<Engine<T>>,
    config: FirehoseConfig,
    table: Mutex<Table>,
}

impl<T: Transport> Firehose<T> {
    pub fn new(engine: Arc<Engine<T>>, config: FirehoseConfig) -> Arc<Self> {
        Arc::new(Firehose {
            engine,
            config,
            table: Mutex::new(Table::default()),
        })
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    /// The `(handler_id, HandlerFn)` pairs this component needs in the
    /// shared handler table. The caller (the `gasnet` facade's `attach`)
    /// merges these with the client's own entries and `gasnet-exit`'s
    /// before making the single `Engine::register_handlers` call — spec §6
    /// describes `attach` as taking the whole handler table at once.
    pub fn handler_entries(self: &Arc<Self>) -> Vec<(u8, HandlerFn)> {
        let fh_req = self.clone();
        let fh_rep = self.clone();
        vec![
            (
                SYS_FH_MOVE_REQ,
                Arc::new(move |token: Token, _args: Vec<u32>, payload: Option<Bytes>, _dest: Option<u64>| {
                    let fh = fh_req.clone();
                    Box::pin(async move {
                        let Some(payload) = payload else { return };
                        match FhMoveReq::decode(payload) {
                            Ok(req) => fh.handle_move_req(token, req).await,
                            Err(error) => tracing::error!(%error, "malformed FH_MOVE_REQ"),
                        }
                    }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
            (
                SYS_FH_MOVE_REP,
                Arc::new(move |token: Token, _args: Vec<u32>, payload: Option<Bytes>, _dest: Option<u64>| {
                    let fh = fh_rep.clone();
                    Box::pin(async move {
                        let Some(payload) = payload else { return };
                        let from = token.source();
                        match FhMoveRep::decode(payload) {
                            Ok(rep) => fh.handle_move_rep(from, rep).await,
                            Err(error) => tracing::error!(%error, "malformed FH_MOVE_REP"),
                        }
                    }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
        ]
    }

    /// Ensure every bucket in `[addr, addr+len)` of `peer`'s segment is
    /// pinned on our behalf before an outgoing Long RDMA targets it (spec
    /// §4.4 "Acquire remote region", called before a Long RDMA). Resolves
    /// once every touched bucket is no longer `PendingPin`.
    pub async fn acquire_remote(self: &Arc<Self>, peer: NodeId, addr: u64, len: u64) -> Result<()> {
        let buckets = buckets_for_range(addr, len, self.config.bucket_size);
        if buckets.is_empty() {
            return Ok(());
        }
        let pending = PendingAcquire::new(buckets.len());
        let (new_addrs, victims) = {
            let mut table = self.table.lock().await;
            let new_addrs = table.touch_for_acquire(peer, &buckets, &pending);
            let victims = if new_addrs.is_empty() {
                Vec::new()
            } else {
                table.evict_remote_victims(peer, &new_addrs, self.config.remote_buckets_m, self.config.bucket_size)
            };
            (new_addrs, victims)
        };
        if !new_addrs.is_empty() {
            let new_regions = coalesce(&new_addrs, self.config.bucket_size);
            let req = FhMoveReq { new_regions, old_regions: victims };
            self.engine.am_system_request(peer, SYS_FH_MOVE_REQ, vec![], req.encode()).await?;
        }
        pending.wait().await;
        Ok(())
    }

    /// Release a hold taken by `acquire_remote` once the RDMA it guarded has
    /// completed (spec §4.4 "Release").
    pub async fn release_remote(&self, peer: NodeId, addr: u64, len: u64) {
        let buckets = buckets_for_range(addr, len, self.config.bucket_size);
        self.table.lock().await.release_remote(peer, &buckets);
    }

    async fn handle_move_req(self: &Arc<Self>, token: Token, req: FhMoveReq) {
        let transport = self.engine.transport().clone();
        let mut pin_error = None;
        let keys = {
            let mut table = self.table.lock().await;
            table.apply_move_req(
                &req.new_regions,
                &req.old_regions,
                |addr| match transport.register_mr(addr, self.config.bucket_size) {
                    Ok(MrHandle(h)) => (h, h),
                    Err(error) => {
                        pin_error.get_or_insert(error);
                        (0, 0)
                    },
                },
                |addr| {
                    let _ = transport.deregister_mr(MrHandle(addr));
                },
                &self.config,
            )
        };
        if let Some(error) = pin_error {
            tracing::error!(%error, source = %token.source(), "firehose failed to pin region, dropping FH_MOVE_REQ");
            return;
        }
        let rep = FhMoveRep { regions: keys };
        if let Err(error) = self.engine.am_system_reply(&token, SYS_FH_MOVE_REP, vec![], rep.encode()).await {
            tracing::error!(%error, "failed to send FH_MOVE_REP");
        }
    }

    async fn handle_move_rep(&self, from: NodeId, rep: FhMoveRep) {
        self.table.lock().await.resolve_pins(from, &rep.regions);
    }

    /// Spec §8 property 5: invariants must hold after any sequence of
    /// acquire/release calls.
    #[cfg(test)]
    pub async fn check_invariants(&self) -> std::result::Result<(), String> {
        self.table.lock().await.check_invariants(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasnet_core::node::{NodeMap, PhysicalId};
    use gasnet_core::segment::{SegInfoTable, Segment};
    use gasnet_core::transport::{LoopbackNetwork, LoopbackTransport};
    use gasnet_core::Config;

    fn build_pair() -> (Arc<Firehose<LoopbackTransport>>, Arc<Firehose<LoopbackTransport>>) {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let node_map = |me: u32| NodeMap::new(NodeId(me), vec![PhysicalId(0), PhysicalId(1)]);
        let seg_table = || {
            SegInfoTable::new(
                vec![
                    Segment { base: 0, size: 1 << 30 },
                    Segment { base: 0, size: 1 << 30 },
                ],
                false,
            )
            .unwrap()
        };
        let core_cfg = Config::default();
        let e0 = Engine::new(node_map(0), seg_table(), core_cfg.clone(), Arc::new(t0)).unwrap();
        let e1 = Engine::new(node_map(1), seg_table(), core_cfg.clone(), Arc::new(t1)).unwrap();
        let fh_cfg = FirehoseConfig::new(&core_cfg, 2, 0);
        (Firehose::new(e0, fh_cfg), Firehose::new(e1, fh_cfg))
    }

    async fn install(engine: &Arc<Engine<LoopbackTransport>>, firehose: &Arc<Firehose<LoopbackTransport>>) {
        engine.register_handlers(&firehose.handler_entries()).await.unwrap();
    }

    /// A background task that keeps polling `engine` until `stop` fires, so
    /// the `FH_MOVE_REQ`/`FH_MOVE_REP` round trip can make progress while
    /// the test `.await`s `acquire_remote`.
    fn spawn_poller(engine: Arc<Engine<LoopbackTransport>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let _ = engine.poll().await;
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
    }

    #[tokio::test]
    async fn acquire_remote_round_trips_and_resolves() {
        let mut transports = LoopbackNetwork::build(2);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();
        let node_map = |me: u32| NodeMap::new(NodeId(me), vec![PhysicalId(0), PhysicalId(1)]);
        let seg_table = || {
            SegInfoTable::new(
                vec![
                    Segment { base: 0, size: 1 << 30 },
                    Segment { base: 0, size: 1 << 30 },
                ],
                false,
            )
            .unwrap()
        };
        let core_cfg = Config::default();
        let e0 = Engine::new(node_map(0), seg_table(), core_cfg.clone(), Arc::new(t0)).unwrap();
        let e1 = Engine::new(node_map(1), seg_table(), core_cfg.clone(), Arc::new(t1)).unwrap();
        let fh_cfg = FirehoseConfig::new(&core_cfg, 2, 0);
        let f0 = Firehose::new(e0.clone(), fh_cfg);
        let f1 = Firehose::new(e1.clone(), fh_cfg);
        install(&e0, &f0).await;
        install(&e1, &f1).await;

        let _p0 = spawn_poller(e0.clone());
        let _p1 = spawn_poller(e1.clone());

        f0.acquire_remote(NodeId(1), 0, 9000).await.unwrap();
        assert!(f0.check_invariants().await.is_ok());
        assert!(f1.check_invariants().await.is_ok());

        f0.release_remote(NodeId(1), 0, 9000).await;
        assert!(f0.check_invariants().await.is_ok());
    }

    #[tokio::test]
    async fn repeated_acquire_release_is_idempotent_on_refcounts() {
        let (f0, _f1) = build_pair();
        let mut table = f0.table.lock().await;
        let pending = PendingAcquire::new(0);
        let new = table.touch_for_acquire(NodeId(1), &[0], &pending);
        assert_eq!(new, vec![0]);
        table.resolve_pins(NodeId(1), &[RegionKeys { addr: 0, len: 4096, rkey: 1, lkey: 1 }]);
        table.release_remote(NodeId(1), &[0]);
        drop(table);
        assert!(f0.check_invariants().await.is_ok());
    }
}
