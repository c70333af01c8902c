//! Lightweight word lock for growth-exclusive container sections.

use core::hint::spin_loop;
use std::sync::atomic::{AtomicUsize, Ordering};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;
const CONTENDED: usize = 2;

const MAX_SPINS: usize = 1000;

/// Single-word mutex: unlocked, locked, or locked-with-waiters.
///
/// The fast path is one CAS. Contended acquires spin briefly, then mark
/// the lock contended and park on its address; a contended release wakes
/// one waiter. Unlike a full mutex, there is no poisoning and no guard:
/// callers pair [`acquire`](Self::acquire) with [`release`](Self::release).
pub struct LwLock {
    state: AtomicUsize,
}

impl LwLock {
    /// Creates the lock in the unlocked state.
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
        }
    }

    /// Acquires the lock, blocking the thread on extended contention.
    pub fn acquire(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        self.acquire_slow();
    }

    #[cold]
    fn acquire_slow(&self) {
        loop {
            for _ in 0..MAX_SPINS {
                if self.state.load(Ordering::Relaxed) == UNLOCKED {
                    break;
                }
                spin_loop();
            }

            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }

            let addr = self as *const _ as usize;
            // SAFETY: the address identifies this lock for the park queue;
            // the validate closure re-checks the state under the queue lock.
            unsafe {
                parking_lot_core::park(
                    addr,
                    || self.state.load(Ordering::Relaxed) == CONTENDED,
                    || {},
                    |_, _| {},
                    parking_lot_core::DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }

    /// Releases the lock, waking one parked waiter if there is any.
    pub fn release(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let addr = self as *const _ as usize;
            // SAFETY: same queue key as used by `acquire_slow`.
            unsafe {
                parking_lot_core::unpark_one(addr, |_| parking_lot_core::DEFAULT_UNPARK_TOKEN);
            }
        }
    }
}

impl Default for LwLock {
    fn default() -> Self {
        Self::new()
    }
}
