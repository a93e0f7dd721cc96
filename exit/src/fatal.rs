//! `gasnet_exit` (spec §7): routes an unrecoverable conduit or protocol error
//! through the same coordinated shutdown a well-behaved `exit()` call would
//! use, rather than calling `std::process::abort` directly and leaving every
//! other node hung waiting for a peer that will never reply.

use std::sync::Arc;
use std::time::Duration;

use gasnet_core::transport::Transport;

use crate::ExitCoordinator;

/// Best-effort coordinated exit with code `1`, bounded by `budget`. If the
/// coordinator itself cannot finish within the budget (for instance because
/// the conduit that triggered the error is the one the coordinator would
/// need to broadcast over), falls back to an immediate abort — the one case
/// in this crate where a library does call a termination primitive directly,
/// because by this point there is no caller left to hand a code back to.
pub async fn fatal_error<T: Transport>(coordinator: &Arc<ExitCoordinator<T>>, budget: Duration, message: impl std::fmt::Display) -> i32 {
    tracing::error!(%message, "fatal error, attempting coordinated exit");
    match tokio::time::timeout(budget, coordinator.exit(1)).await {
        Ok(code) => code,
        Err(_) => {
            tracing::error!(?budget, "coordinated exit did not complete in time, aborting");
            std::process::abort();
        },
    }
}
