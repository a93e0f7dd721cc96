//! Supplement to spec §4.5, taken from `original_source/gasnet_internal.c`'s
//! signal handler: every signal the coordinator reacts to falls into one of
//! two classes, and the only thing a real signal handler may safely do is
//! ask [`SignalSafeExit`] whether it won the race to act on the first one.
//!
//! Actually trapping signals (`sigaction`, `alarm`, `_exit`) is a bootstrap
//! concern out of scope here (SPEC_FULL.md §1 Non-goals) — this module only
//! models the one-shot gate and the classification a handler would consult
//! before making any of those calls.

use std::sync::atomic::{AtomicBool, Ordering};

/// How a trapped signal should be handled once `SignalSafeExit` grants the
/// caller the right to act (spec §4.5 "last-ditch signal handler").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Deliberate operator abort (`SIGQUIT`, `SIGABRT`): run the Tail
    /// teardown, then re-raise so the default disposition still produces a
    /// core if one was requested.
    Abort,
    /// A crash the process did not choose (`SIGSEGV`, `SIGBUS`, `SIGFPE`,
    /// `SIGILL`) or the coordinator's own watchdog (`SIGALRM`): run the Tail
    /// teardown and terminate unconditionally.
    Terminate,
}

/// Standard POSIX signal numbers this taxonomy covers. Listed here only to
/// classify signals a bootstrap layer has already trapped — this crate does
/// not install signal handlers itself.
pub const SIGILL: i32 = 4;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGSEGV: i32 = 11;
pub const SIGALRM: i32 = 14;
pub const SIGQUIT: i32 = 3;

pub fn classify(signum: i32) -> Option<SignalClass> {
    match signum {
        SIGQUIT | SIGABRT => Some(SignalClass::Abort),
        SIGILL | SIGBUS | SIGFPE | SIGSEGV | SIGALRM => Some(SignalClass::Terminate),
        _ => None,
    }
}

/// A one-shot gate a signal handler consults before doing anything: the
/// first caller to win `claim()` is the one allowed to run the (signal-unsafe
/// in general, but bounded-effort-here) teardown; every later signal, on any
/// thread, backs off immediately instead of re-entering it.
#[derive(Default)]
pub struct SignalSafeExit {
    claimed: AtomicBool,
}

impl SignalSafeExit {
    pub const fn new() -> Self {
        SignalSafeExit { claimed: AtomicBool::new(false) }
    }

    /// Returns `true` exactly once across the lifetime of this gate.
    pub fn claim(&self) -> bool {
        self.claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_claim_succeeds() {
        let gate = SignalSafeExit::new();
        assert!(gate.claim());
        assert!(!gate.claim());
        assert!(!gate.claim());
    }

    #[test]
    fn classification_matches_the_two_classes() {
        assert_eq!(classify(SIGQUIT), Some(SignalClass::Abort));
        assert_eq!(classify(SIGABRT), Some(SignalClass::Abort));
        assert_eq!(classify(SIGSEGV), Some(SignalClass::Terminate));
        assert_eq!(classify(SIGALRM), Some(SignalClass::Terminate));
        assert_eq!(classify(9999), None);
    }
}
