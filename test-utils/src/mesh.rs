//! Builds a loopback-connected mesh of attached nodes — an `Engine`, a
//! `Firehose`, and an `ExitCoordinator` per node, with every component's
//! `handler_entries()` merged into the single `register_handlers` call spec
//! §6 describes for `attach` — so integration tests (the `gasnet` facade's
//! end-to-end scenarios chief among them) don't each re-derive the ~30 lines
//! of wiring `gasnet-firehose` and `gasnet-exit`'s own unit tests do.

use std::sync::Arc;
use std::time::Duration;

use gasnet_core::am::engine::Engine;
use gasnet_core::handler::HandlerFn;
use gasnet_core::node::{NodeId, NodeMap, PhysicalId};
use gasnet_core::segment::{SegInfoTable, Segment};
use gasnet_core::transport::{LoopbackNetwork, LoopbackTransport};
use gasnet_core::Config;
use gasnet_exit::ExitCoordinator;
use gasnet_firehose::{Firehose, FirehoseConfig};

/// One node's attached components, as a client of the facade would see them
/// (minus the facade crate itself, which only adds the public-API surface
/// on top of these).
pub struct MeshNode {
    pub engine: Arc<Engine<LoopbackTransport>>,
    pub firehose: Arc<Firehose<LoopbackTransport>>,
    pub exit: Arc<ExitCoordinator<LoopbackTransport>>,
}

pub struct Mesh {
    pub nodes: Vec<MeshNode>,
}

impl Mesh {
    /// Build and attach `nnodes` loopback nodes, each with a `seg_size`-byte
    /// segment, extra application handlers from `extra_handlers(node_index)`,
    /// and every core/firehose/exit system handler already registered.
    pub async fn build(nnodes: usize, seg_size: u64, mut extra_handlers: impl FnMut(usize) -> Vec<(u8, HandlerFn)>) -> Mesh {
        let transports = LoopbackNetwork::build(nnodes);
        let core_cfg = Config::default();
        let mut nodes = Vec::with_capacity(nnodes);
        for (i, transport) in transports.into_iter().enumerate() {
            let node_map = NodeMap::new(NodeId(i as u32), (0..nnodes as u32).map(|p| PhysicalId(p as u64)).collect());
            let seg_table = SegInfoTable::new((0..nnodes).map(|_| Segment { base: 0, size: seg_size }).collect(), false).unwrap();
            let engine = Engine::new(node_map, seg_table, core_cfg.clone(), Arc::new(transport)).unwrap();
            let firehose = Firehose::new(engine.clone(), FirehoseConfig::new(&core_cfg, nnodes, 0));
            let exit = ExitCoordinator::new(engine.clone());

            let mut handlers = firehose.handler_entries();
            handlers.extend(exit.handler_entries());
            handlers.extend(extra_handlers(i));
            engine.register_handlers(&handlers).await.expect("mesh handler registration must not collide");

            nodes.push(MeshNode { engine, firehose, exit });
        }
        Mesh { nodes }
    }

    /// Spawn a background poller per node, each ceasing once that node's exit
    /// coordinator fires its shutdown signal.
    pub fn spawn_pollers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.nodes
            .iter()
            .map(|node| {
                let engine = node.engine.clone();
                let shutdown = node.exit.shutdown_signal();
                tokio::spawn(async move {
                    tokio::pin!(shutdown);
                    loop {
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = engine.poll() => {},
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                })
            })
            .collect()
    }

    pub fn node(&self, i: usize) -> &MeshNode {
        &self.nodes[i]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_a_mesh_and_every_node_can_reach_every_other() {
        let mesh = Mesh::build(3, 1 << 20, |_| vec![]).await;
        assert_eq!(mesh.len(), 3);
        let _pollers = mesh.spawn_pollers();
        mesh.node(0).firehose.acquire_remote(NodeId(1), 0, 4096).await.unwrap();
        mesh.node(0).firehose.release_remote(NodeId(1), 0, 4096).await;
    }
}
