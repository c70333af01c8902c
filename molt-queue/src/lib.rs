//! Expanding slot-array FIFO queue.
//!
//! The queue is one atomic pointer to a *frame*: a fixed array of slot
//! words plus separate read and write indices. Pushes CAS the slot at the
//! write index from `FREE` to a value; pops CAS the slot at the read
//! index to `DELT`. A full frame is grown by *rearm*: the winning pusher
//! freezes every live slot with `XBIT`, copies the survivors into a frame
//! of twice the capacity, appends its own element and republishes the
//! frame pointer. Readers treat `XBIT` slots as transient and wait for
//! either the frame pointer to move or the freeze to be withdrawn.
//!
//! Frame slot transitions: `FREE` → value → `DELT`, with `XBIT` overlaid
//! on any of them during a rearm. Once published, a frame's capacity
//! never changes; `wr_idx` and `rd_idx` only grow.

#![warn(missing_docs)]

use core::hint::spin_loop;
use crossbeam_utils::Backoff;
use molt::{drop_boxed, finalize, CsGuard, FinNode, SlotValue};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[repr(C)]
struct QFrame {
    fin: FinNode,
    cap: usize,
    wr_idx: AtomicUsize,
    rd_idx: AtomicUsize,
    /// `cap + 1` words; the extra slot backs `back()` on an empty frame.
    slots: Box<[AtomicUsize]>,
}

impl QFrame {
    fn make(cap: usize, free: usize) -> *mut QFrame {
        let slots: Box<[AtomicUsize]> = (0..=cap).map(|_| AtomicUsize::new(free)).collect();
        Box::into_raw(Box::new(QFrame {
            fin: FinNode::new(drop_boxed::<QFrame>),
            cap,
            wr_idx: AtomicUsize::new(0),
            rd_idx: AtomicUsize::new(0),
            slots,
        }))
    }

    // Index bumps release their slot transition; index reads acquire, so
    // an observed `rd < wr` implies the slot contents are visible too.
    #[inline]
    fn wr(&self) -> usize {
        self.wr_idx.load(Ordering::Acquire)
    }

    #[inline]
    fn rd(&self) -> usize {
        self.rd_idx.load(Ordering::Acquire)
    }

    /// Tries to append `val`. Fails on a full frame or one being rearmed.
    fn push(&self, val: usize, xbit: usize, free: usize) -> bool {
        loop {
            let curr = self.wr();
            if curr >= self.cap {
                return false;
            }

            let xv = self.slots[curr].load(Ordering::Acquire);
            if xv & xbit != 0 {
                return false;
            }
            if xv == free
                && self.slots[curr]
                    .compare_exchange(xv, val, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                self.wr_idx.fetch_add(1, Ordering::Release);
                return true;
            }

            spin_loop();
        }
    }

    /// Pops the front slot. Returns `delt` when empty, `xbit` when the
    /// frame is frozen, the value word otherwise.
    fn pop(&self, xbit: usize, delt: usize) -> usize {
        loop {
            let curr = self.rd();
            if curr >= self.wr() {
                return delt;
            }

            let rv = self.slots[curr].load(Ordering::Acquire);
            if rv & xbit != 0 {
                return xbit;
            }
            if rv == delt {
                // A winner's rd_idx bump is still in flight.
                spin_loop();
                continue;
            }
            if self.slots[curr]
                .compare_exchange(rv, delt, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.rd_idx.fetch_add(1, Ordering::Release);
                return rv;
            }

            spin_loop();
        }
    }

    #[inline]
    fn front(&self) -> usize {
        self.slots[self.rd()].load(Ordering::Acquire)
    }

    #[inline]
    fn back(&self) -> usize {
        let idx = self.wr();
        if idx == 0 {
            self.slots[self.cap].load(Ordering::Acquire)
        } else {
            self.slots[idx - 1].load(Ordering::Acquire)
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.wr().saturating_sub(self.rd())
    }
}

/// Lock-free FIFO queue that grows by republishing a larger frame.
pub struct Queue<T: SlotValue> {
    frame: AtomicPtr<QFrame>,
    _marker: PhantomData<T>,
}

// SAFETY: payloads are encoded into slot words; extraction and deferred
// destruction can happen on any thread.
unsafe impl<T: SlotValue> Send for Queue<T> {}
unsafe impl<T: SlotValue> Sync for Queue<T> {}

impl<T: SlotValue> Queue<T> {
    /// Creates a queue with at least `cap` slots (rounded up, min 2).
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(2).next_power_of_two();
        Self {
            frame: AtomicPtr::new(QFrame::make(cap, T::FREE)),
            _marker: PhantomData,
        }
    }

    /// Creates a queue with the default capacity of 8.
    pub fn new() -> Self {
        Self::with_capacity(8)
    }

    /// Grows the queue after `frame` filled up (or was seen frozen).
    ///
    /// One caller wins the freeze of the head slot and performs the copy;
    /// everyone else waits for the new frame and returns `false`. `elem`
    /// is appended by the winner.
    fn rearm(&self, elem: usize, frame: *mut QFrame) -> bool {
        let q = unsafe { &*frame };

        let (ix, prev) = loop {
            if self.frame.load(Ordering::Acquire) != frame {
                return false;
            }

            let ix = q.rd();
            let prev = q.slots[ix].fetch_or(T::XBIT, Ordering::AcqRel);
            if prev == T::DELT {
                // A pop slipped in before bumping rd_idx; pick up the new head.
                spin_loop();
                continue;
            }
            if prev & T::XBIT != 0 {
                // Someone else is rearming: wait until they publish, or
                // until the freeze is withdrawn.
                loop {
                    if self.frame.load(Ordering::Acquire) != frame {
                        return false;
                    }
                    if q.slots[ix].load(Ordering::Acquire) & T::XBIT == 0 {
                        break;
                    }
                    spin_loop();
                }
                continue;
            }

            // We set the freeze bit. If the frame was swapped out from
            // under us in the meantime, undo and let the caller retry.
            if self.frame.load(Ordering::Acquire) != frame {
                q.slots[ix].fetch_and(!T::XBIT, Ordering::AcqRel);
                return false;
            }
            break (ix, prev);
        };

        let nq_ptr = QFrame::make(q.cap * 2, T::FREE);
        let nq = unsafe { &*nq_ptr };

        let mut out = 0;
        if prev != T::FREE && prev != T::DELT {
            nq.slots[out].store(prev, Ordering::Relaxed);
            out += 1;
        }
        for i in ix + 1..q.cap {
            let v = q.slots[i].fetch_or(T::XBIT, Ordering::AcqRel);
            if v != T::FREE && v != T::DELT {
                nq.slots[out].store(v, Ordering::Relaxed);
                out += 1;
            }
        }

        nq.slots[out].store(elem, Ordering::Relaxed);
        out += 1;
        nq.wr_idx.store(out, Ordering::Relaxed);

        // SAFETY: the old frame is fully frozen; readers mid-access hold
        // critical sections, so destruction waits for them.
        unsafe { finalize(frame as *mut FinNode) };
        self.frame.store(nq_ptr, Ordering::Release);
        true
    }

    /// Appends a value at the back of the queue.
    pub fn push(&self, value: T) {
        let _g = CsGuard::new();
        let val = T::make(value);

        loop {
            let frame = self.frame.load(Ordering::Acquire);
            let q = unsafe { &*frame };
            if q.push(val, T::XBIT, T::FREE) || self.rearm(val, frame) {
                return;
            }
        }
    }

    /// Removes and returns the front value, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let _g = CsGuard::new();

        loop {
            let frame = self.frame.load(Ordering::Acquire);
            let q = unsafe { &*frame };
            let val = q.pop(T::XBIT, T::DELT);

            if val == T::DELT {
                return None;
            }
            if val != T::XBIT {
                // SAFETY: we own the slot's transition to DELT; clone the
                // payload out before queueing the wrapper for reclamation.
                let out = unsafe { T::get(val) };
                unsafe { T::destroy(val) };
                return Some(out);
            }

            // Frozen: wait for the rearm to finish (or back off).
            let ix = q.rd();
            while self.frame.load(Ordering::Acquire) == frame
                && q.slots[ix].load(Ordering::Acquire) & T::XBIT != 0
            {
                spin_loop();
            }
        }
    }

    /// Returns a copy of the front value without removing it.
    pub fn front(&self) -> Option<T> {
        let _g = CsGuard::new();
        loop {
            let q = unsafe { &*self.frame.load(Ordering::Acquire) };
            let rv = q.front() & !T::XBIT;
            if rv == T::DELT {
                // Freshly popped; the read index is about to move.
                spin_loop();
                continue;
            }
            if rv == T::FREE {
                return None;
            }
            return Some(unsafe { T::get(rv) });
        }
    }

    /// Returns a copy of the back value without removing it.
    pub fn back(&self) -> Option<T> {
        let _g = CsGuard::new();
        loop {
            let q = unsafe { &*self.frame.load(Ordering::Acquire) };
            let rv = q.back() & !T::XBIT;
            if rv == T::DELT {
                spin_loop();
                continue;
            }
            if rv == T::FREE {
                return None;
            }
            return Some(unsafe { T::get(rv) });
        }
    }

    /// Number of values currently enqueued (snapshot).
    pub fn len(&self) -> usize {
        let _g = CsGuard::new();
        unsafe { &*self.frame.load(Ordering::Acquire) }.len()
    }

    /// Whether the queue holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the current frame.
    pub fn capacity(&self) -> usize {
        let _g = CsGuard::new();
        unsafe { &*self.frame.load(Ordering::Acquire) }.cap
    }

    /// Upper bound on the number of storable values.
    pub fn max_size(&self) -> usize {
        usize::MAX
    }

    /// Freezes the current frame against pushes and pops.
    ///
    /// Returns the frame and its saved write index. The head slot carries
    /// `XBIT` and `wr_idx` is parked at the capacity until the caller
    /// republishes or restores.
    fn lock_frame(&self) -> (*mut QFrame, usize) {
        let backoff = Backoff::new();
        loop {
            let frame = self.frame.load(Ordering::Acquire);
            let q = unsafe { &*frame };
            let ix = q.rd();
            let prev = q.slots[ix].fetch_or(T::XBIT, Ordering::AcqRel);

            if prev == T::DELT {
                backoff.spin();
                continue;
            }
            if prev & T::XBIT == 0 {
                if self.frame.load(Ordering::Acquire) != frame {
                    q.slots[ix].fetch_and(!T::XBIT, Ordering::AcqRel);
                    continue;
                }
                return (frame, q.wr_idx.swap(q.cap, Ordering::AcqRel));
            }

            while self.frame.load(Ordering::Acquire) == frame
                && q.slots[ix].load(Ordering::Acquire) & T::XBIT != 0
            {
                spin_loop();
            }
        }
    }

    /// Destroys every surviving value of a locked frame and replaces it.
    fn replace_frame(&self, frame: *mut QFrame, nq: *mut QFrame) {
        let q = unsafe { &*frame };
        let first = q.rd();
        for i in first..q.cap {
            let v = if i == first {
                q.slots[i].load(Ordering::Acquire) & !T::XBIT
            } else {
                q.slots[i].fetch_or(T::XBIT, Ordering::AcqRel)
            };
            if v != T::FREE && v != T::DELT {
                unsafe { T::destroy(v & !T::XBIT) };
            }
        }

        unsafe { finalize(frame as *mut FinNode) };
        self.frame.store(nq, Ordering::Release);
    }

    /// Removes every value.
    pub fn clear(&self) {
        let _g = CsGuard::new();
        let (frame, _) = self.lock_frame();
        self.replace_frame(frame, QFrame::make(8, T::FREE));
    }

    /// Replaces the contents with the items of `iter` (in push order).
    pub fn assign<I: IntoIterator<Item = T>>(&self, iter: I) {
        let nq = Self::build_frame(iter);
        let _g = CsGuard::new();
        let (frame, _) = self.lock_frame();
        self.replace_frame(frame, nq);
    }

    fn build_frame<I: IntoIterator<Item = T>>(iter: I) -> *mut QFrame {
        let vals: Vec<usize> = iter.into_iter().map(T::make).collect();
        let cap = vals.len().max(8).next_power_of_two();
        let nq_ptr = QFrame::make(cap, T::FREE);
        let nq = unsafe { &*nq_ptr };
        for (i, v) in vals.iter().enumerate() {
            nq.slots[i].store(*v, Ordering::Relaxed);
        }
        nq.wr_idx.store(vals.len(), Ordering::Relaxed);
        nq_ptr
    }

    /// Atomically exchanges the contents of two queues.
    pub fn swap(&self, other: &Self) {
        if ptr::eq(self, other) {
            return;
        }

        let _g = CsGuard::new();
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };

        let (fa, wa) = first.lock_frame();
        let (fb, wb) = second.lock_frame();

        first.frame.store(fb, Ordering::Release);
        second.frame.store(fa, Ordering::Release);

        unsafe {
            (*fa).wr_idx.store(wa, Ordering::Relaxed);
            (*fb).wr_idx.store(wb, Ordering::Relaxed);

            let qa = &*fa;
            qa.slots[qa.rd()].fetch_and(!T::XBIT, Ordering::AcqRel);
            let qb = &*fb;
            qb.slots[qb.rd()].fetch_and(!T::XBIT, Ordering::AcqRel);
        }
    }

    /// Iterates front-to-back over a snapshot of the queue.
    pub fn iter(&self) -> Iter<T> {
        let guard = CsGuard::new();
        let frame = self.frame.load(Ordering::Acquire);
        let idx = unsafe { &*frame }.rd();
        Iter {
            _guard: guard,
            frame,
            idx,
            _marker: PhantomData,
        }
    }
}

impl<T: SlotValue> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SlotValue> FromIterator<T> for Queue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            frame: AtomicPtr::new(Self::build_frame(iter)),
            _marker: PhantomData,
        }
    }
}

impl<T: SlotValue> Clone for Queue<T> {
    fn clone(&self) -> Self {
        self.iter().collect()
    }
}

impl<T: SlotValue + PartialEq> PartialEq for Queue<T> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<T: SlotValue + Eq> Eq for Queue<T> {}

impl<T: SlotValue + PartialOrd> PartialOrd for Queue<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.iter().partial_cmp(other.iter())
    }
}

impl<T: SlotValue> Drop for Queue<T> {
    fn drop(&mut self) {
        let frame = *self.frame.get_mut();
        let q = unsafe { &*frame };
        for i in q.rd()..q.cap {
            let v = q.slots[i].load(Ordering::Relaxed) & !T::XBIT;
            if v != T::FREE && v != T::DELT {
                unsafe { T::free(v) };
            }
        }
        unsafe { drop(Box::from_raw(frame)) };
    }
}

/// Guard-holding snapshot iterator over a [`Queue`].
///
/// Walks the frame observed at creation; a concurrent rearm does not
/// redirect it. Slots popped or frozen mid-walk are skipped.
pub struct Iter<T> {
    _guard: CsGuard,
    frame: *const QFrame,
    idx: usize,
    _marker: PhantomData<T>,
}

impl<T: SlotValue> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let q = unsafe { &*self.frame };
        while self.idx < q.cap {
            let v = q.slots[self.idx].load(Ordering::Acquire) & !T::XBIT;
            self.idx += 1;
            if v != T::FREE && v != T::DELT {
                return Some(unsafe { T::get(v) });
            }
        }
        None
    }
}
