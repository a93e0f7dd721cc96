//! GASNet-rs collective exit coordinator (spec §4.5): Head/Election/Body/Tail,
//! grounded in the same `Arc<Engine<T>>`-handle shape `gasnet-firehose` uses,
//! and in `gasnet_core.c`'s exit-role state machine for the election itself
//! (SPEC_FULL.md §4.5 supplement — CAS-style role assignment on node 0
//! rather than a decrement-based counter, so a duplicate `EXIT_ROLE_REQ`
//! replay can never hand out `Master` twice).

pub mod fatal;
pub mod signal;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use gasnet_core::am::engine::{Engine, SYS_EXIT_REP, SYS_EXIT_REQ, SYS_EXIT_ROLE_REP, SYS_EXIT_ROLE_REQ};
use gasnet_core::am::token::Token;
use gasnet_core::handler::HandlerFn;
use gasnet_core::node::NodeId;
use gasnet_core::transport::Transport;

use gasnet_shutdown::{Shutdown, ShutdownSignal};

/// The role node 0 assigns during Election (spec §4.5 "Election"): exactly
/// one node becomes `Master`, every other becomes `Slave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    fn as_u32(self) -> u32 {
        match self {
            Role::Master => 0,
            Role::Slave => 1,
        }
    }

    fn from_u32(v: u32) -> Self {
        if v == 0 {
            Role::Master
        } else {
            Role::Slave
        }
    }
}

struct Inner {
    head_taken: bool,
    code: Option<i32>,
    /// Node 0 only: the node assigned `Master`, set on the first
    /// `EXIT_ROLE_REQ`/local election to reach it.
    master: Option<NodeId>,
    /// This node's own pending election round trip, if it is not node 0.
    role_reply: Option<oneshot::Sender<Role>>,
    /// Master's bookkeeping while it waits for every peer's `EXIT_REP`.
    exit_reps_received: HashSet<NodeId>,
    exit_reps_target: usize,
    exit_reps_waiter: Option<oneshot::Sender<()>>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            head_taken: false,
            code: None,
            master: None,
            role_reply: None,
            exit_reps_received: HashSet::new(),
            exit_reps_target: 0,
            exit_reps_waiter: None,
        }
    }
}

/// One collective exit coordinator per attached process (spec §4.5). Drives
/// the four phases of a coordinated shutdown and exposes a [`ShutdownSignal`]
/// other long-lived tasks (the `AMPoll` loop, Firehose's background work)
/// select on to stop cooperatively once Tail has begun.
pub struct ExitCoordinator<T: Transport> {
    engine: Arc<Engine<T>>,
    mynode: NodeId,
    nnodes: usize,
    inner: Mutex<Inner>,
    tail_done: AtomicBool,
    shutdown: Mutex<Shutdown>,
}

impl<T: Transport> ExitCoordinator<T> {
    pub fn new(engine: Arc<Engine<T>>) -> Arc<Self> {
        let mynode = engine.mynode();
        let nnodes = engine.nnodes();
        Arc::new(ExitCoordinator {
            engine,
            mynode,
            nnodes,
            inner: Mutex::new(Inner::default()),
            tail_done: AtomicBool::new(false),
            shutdown: Mutex::new(Shutdown::new()),
        })
    }

    /// Fires once Tail has begun; every cooperative background task (the
    /// `AMPoll` loop chief among them) should `select!` on this alongside its
    /// real work.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.lock().unwrap().to_signal()
    }

    /// The `(handler_id, HandlerFn)` pairs this component needs, merged by
    /// the `gasnet` facade's `attach` alongside Firehose's and the client's
    /// own, in the single `Engine::register_handlers` call (spec §6).
    pub fn handler_entries(self: &Arc<Self>) -> Vec<(u8, HandlerFn)> {
        let role_req = self.clone();
        let role_rep = self.clone();
        let exit_req = self.clone();
        let exit_rep = self.clone();
        vec![
            (
                SYS_EXIT_ROLE_REQ,
                Arc::new(move |token: Token, _args: Vec<u32>, _payload: Option<Bytes>, _dest: Option<u64>| {
                    let this = role_req.clone();
                    Box::pin(async move { this.handle_role_req(token).await }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
            (
                SYS_EXIT_ROLE_REP,
                Arc::new(move |_token: Token, args: Vec<u32>, _payload: Option<Bytes>, _dest: Option<u64>| {
                    let this = role_rep.clone();
                    Box::pin(async move { this.handle_role_rep(args) }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
            (
                SYS_EXIT_REQ,
                Arc::new(move |token: Token, args: Vec<u32>, _payload: Option<Bytes>, _dest: Option<u64>| {
                    let this = exit_req.clone();
                    Box::pin(async move { this.handle_exit_req(token, args).await }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
            (
                SYS_EXIT_REP,
                Arc::new(move |token: Token, _args: Vec<u32>, _payload: Option<Bytes>, _dest: Option<u64>| {
                    let this = exit_rep.clone();
                    Box::pin(async move { this.handle_exit_rep(token) }) as futures::future::BoxFuture<'static, ()>
                }) as HandlerFn,
            ),
        ]
    }

    /// The collective exit entry point (spec §6 `exit(code)`). The first
    /// caller on this node drives Head/Election/Body/Tail to completion and
    /// returns the process's final exit code; later callers (this node's own
    /// concurrent threads, or a node reacting to someone else's `EXIT_REQ`)
    /// just wait for that work to finish and observe the same code.
    ///
    /// Returns the code rather than calling a termination primitive itself —
    /// a library has no business killing the process its embedder owns; the
    /// `gasnet` facade's binary-level entry point is the one that calls
    /// `std::process::exit` with the value this returns.
    pub async fn exit(self: &Arc<Self>, code: i32) -> i32 {
        let is_head = {
            let mut inner = self.inner.lock().unwrap();
            if inner.head_taken {
                false
            } else {
                inner.head_taken = true;
                inner.code = Some(code);
                true
            }
        };
        if !is_head {
            self.shutdown_signal().await;
            return self.inner.lock().unwrap().code.unwrap_or(code);
        }

        let timeout = Duration::from_secs_f64(2.0 + 0.25 * self.nnodes as f64);
        match self.elect_role().await {
            Role::Master => {
                self.run_master(code, timeout).await;
                self.run_tail().await;
            },
            Role::Slave => {
                // Tail for a Slave runs inside its own `EXIT_REQ` handler
                // (`handle_exit_req`), which may be racing this call on
                // another task; waiting for the shared signal is correct
                // either way.
                let _ = tokio::time::timeout(timeout, self.shutdown_signal()).await;
            },
        }
        self.inner.lock().unwrap().code.unwrap_or(code)
    }

    /// Election (spec §4.5): node 0 assigns itself or a requester `Master`
    /// the first time it is asked; everyone else becomes `Slave`.
    async fn elect_role(self: &Arc<Self>) -> Role {
        if self.mynode == NodeId(0) {
            return self.node0_assign(self.mynode);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().role_reply = Some(tx);
        if let Err(error) = self.engine.am_system_request(NodeId(0), SYS_EXIT_ROLE_REQ, vec![], Bytes::new()).await {
            tracing::error!(%error, "failed to send EXIT_ROLE_REQ, assuming Slave");
            return Role::Slave;
        }
        rx.await.unwrap_or(Role::Slave)
    }

    /// CAS-style assignment (SPEC_FULL.md §4.5 supplement): the first call —
    /// whether node 0's own local election or a remote `EXIT_ROLE_REQ` —
    /// claims `Master`; every later call, including a retransmitted replay of
    /// the same request, sees `Slave`.
    fn node0_assign(&self, candidate: NodeId) -> Role {
        let mut inner = self.inner.lock().unwrap();
        match inner.master {
            Some(m) if m == candidate => Role::Master,
            Some(_) => Role::Slave,
            None => {
                inner.master = Some(candidate);
                Role::Master
            },
        }
    }

    async fn handle_role_req(self: &Arc<Self>, token: Token) {
        let role = self.node0_assign(token.source());
        if let Err(error) = self
            .engine
            .am_system_reply(&token, SYS_EXIT_ROLE_REP, vec![role.as_u32()], Bytes::new())
            .await
        {
            tracing::error!(%error, "failed to send EXIT_ROLE_REP");
        }
    }

    fn handle_role_rep(&self, args: Vec<u32>) {
        let role = Role::from_u32(args.first().copied().unwrap_or(1));
        if let Some(tx) = self.inner.lock().unwrap().role_reply.take() {
            let _ = tx.send(role);
        }
    }

    /// Body, Master side (spec §4.5 "Master"): broadcast `EXIT_REQ` to every
    /// other node and wait for all `EXIT_REP`s, bounded by `timeout`.
    async fn run_master(self: &Arc<Self>, code: i32, timeout: Duration) {
        let peers: Vec<NodeId> = (0..self.nnodes as u32).map(NodeId).filter(|&n| n != self.mynode).collect();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.exit_reps_received.clear();
            inner.exit_reps_target = peers.len();
            inner.exit_reps_waiter = Some(tx);
        }
        for peer in &peers {
            if let Err(error) = self
                .engine
                .am_system_request(*peer, SYS_EXIT_REQ, vec![code as u32], Bytes::new())
                .await
            {
                tracing::error!(%error, %peer, "failed to send EXIT_REQ");
            }
        }
        if tokio::time::timeout(timeout, rx).await.is_err() {
            tracing::warn!(waited = ?timeout, "EXIT_REP collection timed out, proceeding to Tail anyway");
        }
    }

    /// Body, Slave side (spec §4.5 "Slave"): on receiving `EXIT_REQ`, claim
    /// Head locally if no one beat us to it (a remote-initiated exit, spec
    /// §8 scenario), reply, then run Tail for this node directly — the
    /// foreground `exit()` call, if any, is just waiting on the shared
    /// signal this sets at the end.
    async fn handle_exit_req(self: &Arc<Self>, token: Token, args: Vec<u32>) {
        let code = args.first().copied().unwrap_or(0) as i32;
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.head_taken {
                inner.head_taken = true;
                inner.code = Some(code);
            }
        }
        if let Err(error) = self.engine.am_system_reply(&token, SYS_EXIT_REP, vec![], Bytes::new()).await {
            tracing::error!(%error, "failed to send EXIT_REP");
        }
        self.run_tail().await;
    }

    fn handle_exit_rep(&self, token: Token) {
        let mut inner = self.inner.lock().unwrap();
        inner.exit_reps_received.insert(token.source());
        if inner.exit_reps_received.len() >= inner.exit_reps_target {
            if let Some(tx) = inner.exit_reps_waiter.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Tail (spec §4.5): disable the handler table so any frame still in
    /// flight lands harmlessly, flush stdout/stderr under a bounded alarm,
    /// and fire the shutdown signal every cooperative background task is
    /// selecting on. Idempotent — a node can reach this both from its own
    /// `exit()` call and from an incoming `EXIT_REQ`.
    async fn run_tail(&self) {
        if self.tail_done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.engine.register_handlers(&[]).await {
            tracing::error!(%error, "failed to disable handler table during exit Tail");
        }
        let flushed = tokio::time::timeout(Duration::from_secs(30), async {
            use tokio::io::AsyncWriteExt;
            let _ = tokio::io::stdout().flush().await;
            let _ = tokio::io::stderr().flush().await;
        })
        .await;
        if flushed.is_err() {
            tracing::warn!("stdout/stderr flush exceeded the 30s exit alarm, proceeding anyway");
        }
        let code = self.inner.lock().unwrap().code;
        tracing::info!(?code, "gasnet exit Tail complete");
        self.shutdown.lock().unwrap().trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasnet_core::node::{NodeMap, PhysicalId};
    use gasnet_core::segment::{SegInfoTable, Segment};
    use gasnet_core::transport::{LoopbackNetwork, LoopbackTransport};
    use gasnet_core::Config;

    fn build_trio() -> Vec<Arc<Engine<LoopbackTransport>>> {
        let n = 3;
        let transports = LoopbackNetwork::build(n);
        let node_map = |me: u32| NodeMap::new(NodeId(me), (0..n as u32).map(|i| PhysicalId(i as u64)).collect());
        transports
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let seg_table = SegInfoTable::new((0..n).map(|_| Segment { base: 0, size: 1 << 20 }).collect(), false).unwrap();
                Engine::new(node_map(i as u32), seg_table, Config::default(), Arc::new(t)).unwrap()
            })
            .collect()
    }

    fn spawn_poller(engine: Arc<Engine<LoopbackTransport>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let _ = engine.poll().await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    #[tokio::test]
    async fn node_zero_initiated_exit_reaches_every_node() {
        let engines = build_trio();
        let coords: Vec<_> = engines.iter().map(|e| ExitCoordinator::new(e.clone())).collect();
        for (engine, coord) in engines.iter().zip(&coords) {
            engine.register_handlers(&coord.handler_entries()).await.unwrap();
        }
        let _pollers: Vec<_> = engines.iter().cloned().map(spawn_poller).collect();

        let c0 = coords[0].clone();
        let code = c0.exit(7).await;
        assert_eq!(code, 7);

        for coord in &coords[1..] {
            tokio::time::timeout(Duration::from_secs(5), coord.shutdown_signal()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn remote_initiated_exit_drives_slaves_to_tail_without_a_local_call() {
        let engines = build_trio();
        let coords: Vec<_> = engines.iter().map(|e| ExitCoordinator::new(e.clone())).collect();
        for (engine, coord) in engines.iter().zip(&coords) {
            engine.register_handlers(&coord.handler_entries()).await.unwrap();
        }
        let _pollers: Vec<_> = engines.iter().cloned().map(spawn_poller).collect();

        // Only node 0 calls `exit`; nodes 1 and 2 never do, yet must still
        // reach Tail once their `EXIT_REQ` handler fires.
        let code = coords[0].exit(3).await;
        assert_eq!(code, 3);
        for coord in &coords[1..] {
            tokio::time::timeout(Duration::from_secs(5), coord.shutdown_signal()).await.unwrap();
            assert_eq!(coord.inner.lock().unwrap().code, Some(3));
        }
    }

    #[tokio::test]
    async fn a_second_local_exit_call_observes_the_first_callers_code() {
        let engines = build_trio();
        let coords: Vec<_> = engines.iter().map(|e| ExitCoordinator::new(e.clone())).collect();
        for (engine, coord) in engines.iter().zip(&coords) {
            engine.register_handlers(&coord.handler_entries()).await.unwrap();
        }
        let _pollers: Vec<_> = engines.iter().cloned().map(spawn_poller).collect();

        let c0a = coords[0].clone();
        let c0b = coords[0].clone();
        let (first, second) = tokio::join!(c0a.exit(11), c0b.exit(99));
        assert_eq!(first, 11);
        assert_eq!(second, 11);
    }
}
