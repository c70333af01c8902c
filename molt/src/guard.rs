//! RAII critical-section guard.

use crate::reclaim::{enter_cs, exit_cs};
use std::marker::PhantomData;

/// Scoped read-side critical section.
///
/// Pointers loaded from shared structure while a `CsGuard` is alive stay
/// valid until it drops. Guards nest freely.
pub struct CsGuard {
    // Entry and exit must happen on the same thread.
    _not_send: PhantomData<*mut ()>,
}

impl CsGuard {
    /// Enters a critical section for the lifetime of the guard.
    #[inline]
    pub fn new() -> Self {
        enter_cs();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for CsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CsGuard {
    #[inline]
    fn drop(&mut self) {
        exit_cs();
    }
}
