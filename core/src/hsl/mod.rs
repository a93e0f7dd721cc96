//! Handler-Safe Locks (spec §4.3): a thin wrapper around a blocking mutex
//! that clients may hold from inside a handler. HSLs are always acquired
//! outside all engine locks (spec §5, lock order) so a plain
//! `std::sync::Mutex` — not an async one — is the right primitive: holding
//! it never overlaps an `.await` point in engine code.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// A user-visible lock. Destruction while held is illegal per spec §4.3;
/// we do not attempt to detect that at runtime (the spec frames it as a
/// client programming error, not a condition the engine must recover from).
#[derive(Debug)]
pub struct Hsl<T> {
    inner: Mutex<T>,
    last_acquired: Mutex<Option<Instant>>,
}

/// An acquired HSL, releasing on drop and recording an acquire timestamp
/// for tracing as specified.
pub struct HslGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Hsl<T> {
    pub fn new(value: T) -> Self {
        Hsl {
            inner: Mutex::new(value),
            last_acquired: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> HslGuard<'_, T> {
        let now = Instant::now();
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.last_acquired.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);
        tracing::trace!(acquired_at = ?now, "hsl_lock acquired");
        HslGuard { guard }
    }

    pub fn last_acquired(&self) -> Option<Instant> {
        *self.last_acquired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<'a, T> std::ops::Deref for HslGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> std::ops::DerefMut for HslGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_tracks_acquire_time() {
        let hsl = Hsl::new(42u32);
        assert!(hsl.last_acquired().is_none());
        {
            let mut guard = hsl.lock();
            *guard += 1;
        }
        assert!(hsl.last_acquired().is_some());
        assert_eq!(*hsl.lock(), 43);
    }
}
