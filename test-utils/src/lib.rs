//! Test helpers shared across the GASNet-rs workspace.
//!
//! ## Modules
//!
//! - `random` - convenience generators for random test data
//! - `futures` - utilities which make testing future-based code easier
//! - `runtime` - a `tokio::Runtime` wrapper that fails tests loudly on a
//!   panicking spawned task
//! - `mesh` - builds a loopback-connected mesh of `Engine`/`Firehose`/
//!   `ExitCoordinator` for workspace-wide integration tests

#[macro_use]
pub mod futures;
pub mod mesh;
pub mod random;
pub mod runtime;
