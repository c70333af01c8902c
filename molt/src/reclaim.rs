//! Reader registry, two-phase grace periods and per-thread finalizer lists.
//!
//! Every thread that touches the library gets a registry entry holding one
//! atomic counter. The counter's low half is the critical-section nesting
//! depth; one high bit mirrors the phase of the global grace counter as
//! observed at the outermost `enter_cs`. A grace period ([`sync`]) polls
//! all entries, flips the phase, and polls the stragglers again: once an
//! entry has been seen inactive or in the new phase, that thread cannot
//! still hold a pointer unlinked before the flip.

use crate::retired::FinNode;
use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Phase bit of the grace counter and of per-thread counters.
const GP_PHASE: usize = 1 << (usize::BITS / 2);
/// Low half of the counter: critical-section nesting depth.
const GP_NEST_MASK: usize = GP_PHASE - 1;

/// Poll rounds spent yielding before falling back to millisecond sleeps.
const QS_ATTEMPTS: usize = 1000;

/// Pending finalizers per thread before a flush is forced.
const MAX_FINS: usize = 1000;

enum RdState {
    /// In a critical section begun in the current phase.
    Active,
    /// Not in any critical section.
    Inactive,
    /// Still inside a critical section begun in the previous phase.
    Old,
}

struct TdEntry {
    ctr: AtomicUsize,
}

impl TdEntry {
    fn state(&self, global: usize) -> RdState {
        let val = self.ctr.load(Ordering::Acquire);
        if val & GP_NEST_MASK == 0 {
            RdState::Inactive
        } else if (val ^ global) & GP_PHASE == 0 {
            RdState::Active
        } else {
            RdState::Old
        }
    }
}

struct Registry {
    /// Serializes grace periods. Held across both poll passes.
    grace: Mutex<()>,
    /// Registered reader threads. Locked only for short sections:
    /// registration, removal and the snapshot taken by `sync`.
    threads: Mutex<Vec<Arc<TdEntry>>>,
    /// Global grace counter: nest seed (1) in the low half, phase bit on top.
    ctr: CachePadded<AtomicUsize>,
}

impl Registry {
    fn new() -> Self {
        Self {
            grace: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
            ctr: CachePadded::new(AtomicUsize::new(1)),
        }
    }

    fn sync(&self) {
        let _grace = self.grace.lock();
        let mut readers: Vec<Arc<TdEntry>> = self.threads.lock().clone();
        if readers.is_empty() {
            return;
        }

        fence(Ordering::SeqCst);

        // First pass: wait out readers still in the previous phase, set
        // aside the ones active in the current phase.
        let mut out = Vec::with_capacity(readers.len());
        self.poll_readers(&mut readers, Some(&mut out));

        self.ctr.store(
            self.ctr.load(Ordering::Relaxed) ^ GP_PHASE,
            Ordering::Release,
        );

        // Second pass: the set-aside readers are now in the old phase.
        self.poll_readers(&mut out, None);
    }

    fn poll_readers(&self, readers: &mut Vec<Arc<TdEntry>>, mut out: Option<&mut Vec<Arc<TdEntry>>>) {
        for loops in 0.. {
            let global = self.ctr.load(Ordering::Relaxed);
            readers.retain(|td| match td.state(global) {
                RdState::Active => {
                    if let Some(out) = out.as_deref_mut() {
                        out.push(Arc::clone(td));
                    }
                    false
                }
                RdState::Inactive => false,
                RdState::Old => true,
            });

            if readers.is_empty() {
                break;
            }

            if loops < QS_ATTEMPTS {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

static REG: Lazy<Registry> = Lazy::new(Registry::new);

static SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

/// Per-thread engine state: registry entry, pending finalizers, PRNG.
struct Handle {
    entry: Arc<TdEntry>,
    fins: Cell<*mut FinNode>,
    n_fins: Cell<usize>,
    must_flush: Cell<bool>,
    rng: Cell<u64>,
}

impl Handle {
    fn new() -> Self {
        let entry = Arc::new(TdEntry {
            ctr: AtomicUsize::new(0),
        });
        REG.threads.lock().push(Arc::clone(&entry));
        let _ = ACTIVE.try_with(|a| a.set(true));

        // splitmix64 over a global stream counter and the entry address.
        let mut seed = SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
            ^ (Arc::as_ptr(&entry) as u64);
        seed ^= seed >> 30;
        seed = seed.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        seed ^= seed >> 27;
        seed = seed.wrapping_mul(0x94d0_49bb_1331_11eb);
        seed ^= seed >> 31;

        Self {
            entry,
            fins: Cell::new(ptr::null_mut()),
            n_fins: Cell::new(0),
            must_flush: Cell::new(false),
            rng: Cell::new(seed | 1),
        }
    }

    fn in_cs(&self) -> bool {
        self.entry.ctr.load(Ordering::Relaxed) & GP_NEST_MASK != 0
    }

    fn destroy_pending(&self) {
        let mut run = self.fins.replace(ptr::null_mut());
        self.n_fins.set(0);
        while !run.is_null() {
            unsafe {
                let next = (*run).next;
                ((*run).destroy)(run);
                run = next;
            }
        }
    }

    fn flush(&self) -> bool {
        if self.in_cs() {
            self.must_flush.set(true);
            return false;
        }

        REG.sync();
        self.destroy_pending();
        self.must_flush.set(false);
        true
    }

    fn finalize(&self, obj: *mut FinNode) {
        unsafe {
            (*obj).next = self.fins.get();
        }
        self.fins.set(obj);
        self.n_fins.set(self.n_fins.get() + 1);

        if self.n_fins.get() >= MAX_FINS {
            self.flush();
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.entry.ctr.store(0, Ordering::Release);
        REG.threads
            .lock()
            .retain(|td| !Arc::ptr_eq(td, &self.entry));
        let _ = ACTIVE.try_with(|a| a.set(false));

        if !self.fins.get().is_null() {
            REG.sync();
            self.destroy_pending();
        }
    }
}

thread_local! {
    static HANDLE: Handle = Handle::new();
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Enters a read-side critical section. Never blocks.
///
/// Critical sections nest; each `enter_cs` must be matched by an
/// [`exit_cs`] on the same thread. Prefer [`crate::CsGuard`].
pub fn enter_cs() {
    HANDLE.with(|h| {
        let val = h.entry.ctr.load(Ordering::Relaxed);
        let val = if val & GP_NEST_MASK == 0 {
            REG.ctr.load(Ordering::Relaxed)
        } else {
            val + 1
        };
        h.entry.ctr.store(val, Ordering::Release);
        fence(Ordering::SeqCst);
    });
}

/// Exits the innermost critical section.
///
/// Leaving the outermost section runs a deferred finalizer flush if one
/// was requested while the section was open.
pub fn exit_cs() {
    HANDLE.with(|h| {
        fence(Ordering::SeqCst);
        let val = h.entry.ctr.load(Ordering::Relaxed);
        debug_assert!(
            val & GP_NEST_MASK != 0,
            "exit_cs without matching enter_cs"
        );
        h.entry.ctr.store(val - 1, Ordering::Release);

        if (val - 1) & GP_NEST_MASK == 0 && h.must_flush.get() {
            h.flush();
        }
    });
}

/// Reports whether the calling thread is inside a critical section.
pub fn in_cs() -> bool {
    HANDLE.with(|h| h.in_cs())
}

/// Waits for a full grace period.
///
/// Returns `false` without blocking if called from inside a critical
/// section, where waiting would deadlock.
pub fn sync() -> bool {
    if in_cs() {
        return false;
    }

    REG.sync();
    true
}

/// Queues `obj` for destruction after the next grace period.
///
/// The object is destroyed by the calling thread once its pending list
/// crosses the flush threshold (or at the next [`flush_finalizers`]),
/// never while the thread is inside a critical section.
///
/// # Safety
///
/// `obj` must point to a live object headed by a [`FinNode`], already
/// unlinked from shared structure with release ordering, and must not be
/// passed to `finalize` again.
pub unsafe fn finalize(obj: *mut FinNode) {
    let done = HANDLE.try_with(|h| h.finalize(obj)).is_ok();
    if !done {
        // Thread-local state already torn down: reclaim inline.
        REG.sync();
        unsafe { ((*obj).destroy)(obj) };
    }
}

/// Forces destruction of the calling thread's pending finalizers.
///
/// Returns `true` if they were destroyed; `false` if the thread is inside
/// a critical section, in which case the flush is deferred to the next
/// outermost [`exit_cs`].
pub fn flush_finalizers() -> bool {
    HANDLE.with(|h| h.flush())
}

/// Thread-safe pseudo-random 32-bit value (xorshift64*, per-thread state).
pub fn xrand() -> u32 {
    HANDLE.with(|h| {
        let mut x = h.rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        h.rng.set(x);
        (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32
    })
}

/// `fork` hand-off callbacks; see [`atfork`].
pub struct AtFork {
    /// Call before forking: takes the grace and registry locks.
    pub prepare: fn(),
    /// Call in the parent after forking: releases the locks.
    pub parent: fn(),
    /// Call in the child: releases the locks and re-registers only the
    /// calling thread (no other thread exists in the child).
    pub child: fn(),
}

fn atfork_prepare() {
    std::mem::forget(REG.grace.lock());
    std::mem::forget(REG.threads.lock());
}

fn atfork_parent() {
    // SAFETY: matching locks were taken and leaked in `atfork_prepare`.
    unsafe {
        REG.threads.force_unlock();
        REG.grace.force_unlock();
    }
}

fn atfork_child() {
    // SAFETY: the child inherits the locks taken in `atfork_prepare`.
    unsafe {
        REG.threads.force_unlock();
        REG.grace.force_unlock();
    }

    let mut threads = REG.threads.lock();
    threads.clear();
    if ACTIVE.try_with(|a| a.get()).unwrap_or(false) {
        HANDLE.with(|h| threads.push(Arc::clone(&h.entry)));
    }
}

/// Returns the callbacks to wire into `pthread_atfork` (or equivalent) so
/// the registry survives forking.
pub fn atfork() -> AtFork {
    AtFork {
        prepare: atfork_prepare,
        parent: atfork_parent,
        child: atfork_child,
    }
}
