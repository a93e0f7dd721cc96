//! Error taxonomy for the GASNet-rs core, per spec §7.

use thiserror::Error;

/// The four-way error taxonomy named by the specification: API-level errors
/// are returned to the caller, in-handler/in-completion errors are routed to
/// the fatal path instead (see `gasnet-exit::fatal`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GasnetError {
    /// An API was called before `attach` completed, or after `exit` began.
    #[error("API called outside its legal phase: {0}")]
    NotInitialized(String),

    /// Malformed arguments: handler index out of range, `nbytes` over a
    /// limit, `dest_addr` outside the remote segment, duplicate handler
    /// index at registration, etc.
    #[error("bad argument: {0}")]
    BadArg(String),

    /// A transport allocation failed at init or attach time (send/receive
    /// token pool, bounce buffer arena, queue-pair setup).
    #[error("resource exhausted or unavailable: {0}")]
    Resource(String),

    /// A conduit-internal send failed after it was posted.
    #[error("raw message send failed: {0}")]
    RawMessage(String),

    /// A conduit-internal RDMA operation failed after it was posted.
    #[error("RDMA operation failed: {0}")]
    Rdma(String),
}

pub type Result<T> = std::result::Result<T, GasnetError>;
