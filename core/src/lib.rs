//! GASNet-rs hard core: the Active Message engine, send/receive plant,
//! buffer arena and Handler-Safe Locks (spec §§2-5). Everything above the
//! conduit boundary — Firehose pinning, collective exit, the public facade
//! — lives in the sibling `gasnet-firehose`/`gasnet-exit`/`gasnet` crates;
//! this crate only knows about one node's local state and a `Transport`.

pub mod am;
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod hsl;
pub mod node;
pub mod segment;
pub mod transport;

pub use am::{AmFrame, Category, Cmd, Engine, Token};
pub use config::{Config, WaitMode};
pub use error::{GasnetError, Result};
pub use handler::{HandlerFn, HandlerTable, CLIENT_RANGE, CORE_RANGE, EXTENDED_RANGE, MAX_NUMHANDLERS};
pub use hsl::{Hsl, HslGuard};
pub use node::{NodeId, NodeMap, PhysicalId};
pub use segment::{PinProbe, SegInfoTable, Segment};
