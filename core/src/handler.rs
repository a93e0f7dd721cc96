//! The client handler table registration UI (spec §1 names this as an
//! out-of-scope collaborator, but a minimal registration surface is
//! required to make the engine callable — see SPEC_FULL.md §1). Handlers
//! are stored in a flat, fixed-size array indexed `[0..256)`, never a
//! vtable/trait-object-per-slot inheritance scheme, per spec §9 "Dynamic
//! dispatch".

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::am::token::Token;
use crate::error::{GasnetError, Result};

/// `[1..63]` core, `[64..127]` extended, `[128..255]` client; `0` is
/// reserved and invoking it is fatal (spec §6).
pub const MAX_NUMHANDLERS: usize = 256;
pub const CORE_RANGE: std::ops::Range<u8> = 1..64;
pub const EXTENDED_RANGE: std::ops::Range<u8> = 64..128;
pub const CLIENT_RANGE: std::ops::RangeInclusive<u8> = 128..=255;

/// `handler(token, args[], numargs[, payload, nbytes[, destaddr]])` (spec
/// §6). Expressed as an async closure so a request handler may `.await` an
/// `AMReply*` call without blocking the poll task.
pub type HandlerFn = Arc<dyn Fn(Token, Vec<u32>, Option<Bytes>, Option<u64>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: HandlerFn,
}

/// A fixed `MAX_NUMHANDLERS`-slot table, populated once by `attach` and
/// read-only thereafter.
#[derive(Clone, Default)]
pub struct HandlerTable {
    slots: Vec<Option<HandlerEntry>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable {
            slots: vec![None; MAX_NUMHANDLERS],
        }
    }

    /// Register `(index, handler)` pairs. Spec §8 property 1 / §8 scenario
    /// "Non-unique handler": duplicate indices are rejected with `BadArg`
    /// and must leave the table empty so a subsequent `attach` may succeed.
    pub fn register(&mut self, entries: &[(u8, HandlerFn)]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (index, _) in entries {
            if *index == 0 {
                return Err(GasnetError::BadArg("handler index 0 is reserved".into()));
            }
            if !seen.insert(*index) {
                return Err(GasnetError::BadArg(format!("duplicate handler index {index}")));
            }
        }
        let mut staged = vec![None; MAX_NUMHANDLERS];
        for (index, handler) in entries {
            staged[*index as usize] = Some(HandlerEntry { handler: handler.clone() });
        }
        self.slots = staged;
        Ok(())
    }

    pub fn get(&self, index: u8) -> Result<HandlerFn> {
        if index == 0 {
            return Err(GasnetError::BadArg("handler index 0 is reserved".into()));
        }
        self.slots
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.handler.clone())
            .ok_or_else(|| GasnetError::BadArg(format!("no handler registered at index {index}")))
    }

    pub fn is_registered(&self, index: u8) -> bool {
        self.slots.get(index as usize).map(|e| e.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_token, _args, _payload, _dest| Box::pin(async {}))
    }

    #[test]
    fn duplicate_index_rejected_and_table_left_unattached() {
        let mut table = HandlerTable::new();
        let err = table.register(&[(200, noop_handler()), (200, noop_handler())]).unwrap_err();
        matches!(err, GasnetError::BadArg(_));
        assert!(!table.is_registered(200));
        // a subsequent attach may still succeed
        table.register(&[(200, noop_handler())]).unwrap();
        assert!(table.is_registered(200));
    }

    #[test]
    fn index_zero_is_fatal_to_register_or_invoke() {
        let mut table = HandlerTable::new();
        assert!(table.register(&[(0, noop_handler())]).is_err());
        assert!(table.get(0).is_err());
    }

    #[tokio::test]
    async fn bijective_dispatch() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let hit_a = Arc::new(AtomicU32::new(0));
        let hit_b = Arc::new(AtomicU32::new(0));
        let (ha, hb) = (hit_a.clone(), hit_b.clone());
        let mut table = HandlerTable::new();
        table
            .register(&[
                (10, Arc::new(move |_t, _a, _p, _d| {
                    let ha = ha.clone();
                    Box::pin(async move {
                        ha.fetch_add(1, Ordering::SeqCst);
                    })
                })),
                (11, Arc::new(move |_t, _a, _p, _d| {
                    let hb = hb.clone();
                    Box::pin(async move {
                        hb.fetch_add(1, Ordering::SeqCst);
                    })
                })),
            ])
            .unwrap();
        (table.get(10).unwrap())(crate::am::token::Token::new_reply(crate::node::NodeId(0)), vec![], None, None)
            .await;
        assert_eq!(hit_a.load(Ordering::SeqCst), 1);
        assert_eq!(hit_b.load(Ordering::SeqCst), 0);
    }
}
