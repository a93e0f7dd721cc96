//! The opaque per-invocation handle passed to a handler (spec §3 "Token").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::node::NodeId;

/// Identifies one in-flight request handler invocation. A `Token` is only
/// valid for the duration of the handler call that received it; `AMReply*`
/// is legal only against a request token, and only once (spec §4.1
/// "Dispatch protocol", §8 property 8).
#[derive(Clone)]
pub struct Token {
    source: NodeId,
    is_request: bool,
    replied: Arc<AtomicBool>,
}

impl Token {
    pub(crate) fn new_request(source: NodeId) -> Self {
        Token {
            source,
            is_request: true,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn new_reply(source: NodeId) -> Self {
        Token {
            source,
            is_request: false,
            replied: Arc::new(AtomicBool::new(true)),
        }
    }

    /// `AMGetMsgSource` (spec §4.1).
    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    /// Marks this token as replied. Returns `false` (which callers must
    /// treat as a fatal "issuing a second reply" error) if a reply has
    /// already been issued, or if this token does not originate from a
    /// request handler.
    pub(crate) fn mark_replied(&self) -> bool {
        if !self.is_request {
            return false;
        }
        self.replied.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_reply_is_rejected() {
        let token = Token::new_request(NodeId(3));
        assert!(token.mark_replied());
        assert!(!token.mark_replied());
    }

    #[test]
    fn reply_token_cannot_reply() {
        let token = Token::new_reply(NodeId(0));
        assert!(!token.mark_replied());
    }
}
