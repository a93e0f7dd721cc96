//! GASNet-rs: the public client-facing facade (spec §6). Ties together
//! `gasnet-core`'s engine, `gasnet-firehose`'s pinning cache and
//! `gasnet-exit`'s collective coordinator behind the single `Runtime` value
//! spec §9 "Global mutable state" calls for — "constructed once by `init`
//! and passed explicitly ... to all engine routines. No transient globals."
//!
//! `init` and `attach` are split exactly as spec §4 "Lifecycle" orders them:
//! `init` only probes pinning limits and builds the node map (the bootstrap
//! spawner itself — argv/ssh/MPI job launch — is out of scope, spec §1);
//! `attach` publishes the segment and the merged handler table.

pub mod runtime;

pub use gasnet_core::{
    AmFrame, Category, Cmd, GasnetError, Hsl, HslGuard, NodeId, PinProbe, Result, Token, CLIENT_RANGE, CORE_RANGE,
    EXTENDED_RANGE,
};
pub use gasnet_core::handler::HandlerFn;
pub use gasnet_core::node::PhysicalId;
pub use gasnet_core::segment::{SegInfoTable, Segment};
pub use gasnet_core::transport::Transport;
pub use gasnet_core::Config;
pub use gasnet_exit::fatal::fatal_error;
pub use gasnet_exit::signal::{SignalClass, SignalSafeExit};
pub use gasnet_firehose::FirehoseConfig;

pub use runtime::{Init, Runtime};

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`, the way
/// the teacher's binaries wire up observability at `main` — distinct from
/// the conduit-private `TRACEFILE`/`TRACEMASK` env vars `Config::from_env`
/// recognizes but leaves inert (spec §6; see `gasnet_core::config`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
