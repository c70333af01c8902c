//! Probabilistic ordered set (skip list) with lazy physical unlinking.
//!
//! Nodes carry one forward pointer per level; the low bit of a forward
//! pointer (`XBIT`) marks its owning node logically deleted at that
//! level. Erasure tags a node's pointers top-down, then physical removal
//! happens cooperatively: any traversal in *assist* mode CASes tagged
//! nodes out of its path, and the eraser finishes with a *force* pass.
//!
//! The root header node stores `(len << 1) | lock` in a sentinel word;
//! the lock bit serializes whole-container exchanges (swap). A CAS-bumped
//! `hi_water` tracks the tallest level in use so probes skip empty ones.

#![warn(missing_docs)]

use core::hint::spin_loop;
use crossbeam_utils::Backoff;
use molt::{destroy_now, finalize, xrand, CsGuard, DestroyFn, FinNode};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

const SL_XBIT: usize = 1;
const SL_MAX_DEPTH: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Unlink {
    /// Follow tagged pointers without helping.
    Skip,
    /// Plain lookup; tagged pointers are followed to their targets.
    None,
    /// Opportunistically unlink tagged nodes along the way.
    Assist,
    /// Walk the full width, unlinking the target everywhere.
    Force,
}

#[repr(C)]
struct SlNode<T> {
    fin: FinNode,
    nlvl: usize,
    /// Root only: `(len << 1) | lock`.
    len_lock: AtomicUsize,
    next: Box<[AtomicUsize]>,
    key: MaybeUninit<T>,
}

unsafe fn node_destroy<T>(p: *mut FinNode) {
    let node = p as *mut SlNode<T>;
    unsafe {
        ptr::drop_in_place((*node).key.as_mut_ptr());
        drop(Box::from_raw(node));
    }
}

unsafe fn root_destroy<T>(p: *mut FinNode) {
    unsafe { drop(Box::from_raw(p as *mut SlNode<T>)) };
}

impl<T> SlNode<T> {
    fn alloc(nlvl: usize, key: MaybeUninit<T>, destroy: DestroyFn) -> *mut Self {
        Box::into_raw(Box::new(Self {
            fin: FinNode::new(destroy),
            nlvl,
            len_lock: AtomicUsize::new(0),
            next: (0..nlvl).map(|_| AtomicUsize::new(0)).collect(),
            key,
        }))
    }

    fn make_root(depth: usize) -> usize {
        Self::alloc(depth, MaybeUninit::uninit(), root_destroy::<T>) as usize
    }

    fn make(nlvl: usize, key: T) -> usize {
        Self::alloc(nlvl, MaybeUninit::new(key), node_destroy::<T>) as usize
    }
}

#[inline]
unsafe fn node_ref<'a, T>(addr: usize) -> &'a SlNode<T> {
    unsafe { &*((addr & !SL_XBIT) as *const SlNode<T>) }
}

#[inline]
unsafe fn next_of<'a, T: 'a>(addr: usize, lvl: usize) -> &'a AtomicUsize {
    unsafe { &node_ref::<T>(addr).next[lvl] }
}

#[inline]
unsafe fn key_of<'a, T>(addr: usize) -> &'a T {
    unsafe { node_ref::<T>(addr).key.assume_init_ref() }
}

/// CAS returning the previous value, success or not.
#[inline]
fn cas_val(a: &AtomicUsize, current: usize, new: usize) -> usize {
    match a.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(prev) | Err(prev) => prev,
    }
}

#[inline]
fn cas_bool(a: &AtomicUsize, current: usize, new: usize) -> bool {
    a.compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}

/// Steps to the next live node along level 0, skipping deleted ones.
unsafe fn advance<T>(mut addr: usize) -> usize {
    loop {
        let next = unsafe { next_of::<T>(addr, 0) }.load(Ordering::Acquire) & !SL_XBIT;
        if next == 0 {
            return 0;
        }
        if unsafe { next_of::<T>(next, 0) }.load(Ordering::Acquire) & SL_XBIT == 0 {
            return next;
        }
        addr = next;
    }
}

/// Lock-free ordered set.
pub struct SkipList<T> {
    head: AtomicUsize,
    hi_water: AtomicUsize,
    max_depth: usize,
    _marker: PhantomData<T>,
}

// SAFETY: keys are cloned out of shared nodes and dropped on whichever
// thread drains its finalizer list.
unsafe impl<T: Send + Sync> Send for SkipList<T> {}
unsafe impl<T: Send + Sync> Sync for SkipList<T> {}

impl<T: Ord + Clone + Send + Sync + 'static> SkipList<T> {
    /// Creates an empty list with the given maximum level count,
    /// clamped to `[1, 24]`.
    pub fn with_depth(depth: usize) -> Self {
        let depth = depth.clamp(1, SL_MAX_DEPTH);
        Self {
            head: AtomicUsize::new(SlNode::<T>::make_root(depth)),
            hi_water: AtomicUsize::new(1),
            max_depth: depth,
            _marker: PhantomData,
        }
    }

    /// Creates an empty list with the default depth of 24.
    pub fn new() -> Self {
        Self::with_depth(SL_MAX_DEPTH)
    }

    #[inline]
    fn head_addr(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Draws a level for a fresh node: a biased geometric bounded by the
    /// high-water mark, which grows one level at a time.
    fn rand_lvl(&self) -> usize {
        let lvl = xrand().trailing_zeros() as usize * 2 / 3;
        if lvl == 0 {
            return 1;
        }
        loop {
            let prev = self.hi_water.load(Ordering::Relaxed);
            if lvl <= prev {
                return lvl;
            }
            if prev == self.max_depth {
                return prev;
            }
            if self
                .hi_water
                .compare_exchange_weak(prev, prev + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return prev + 1;
            }
            spin_loop();
        }
    }

    /// Walks the list, filling `preds`/`succs` for an `n`-level insert.
    ///
    /// Returns the address of the node matching `key` (0 if none). In
    /// `Force` mode equal keys do not stop the walk, so the tagged target
    /// gets unlinked at every level. `outp` receives the root observed at
    /// the start of the walk.
    fn find_preds(
        &self,
        n: usize,
        key: &T,
        unlink: Unlink,
        mut preds: Option<&mut [usize; SL_MAX_DEPTH]>,
        mut succs: Option<&mut [usize; SL_MAX_DEPTH]>,
        mut outp: Option<&mut usize>,
    ) -> usize {
        'restart: loop {
            let mut got = false;
            let mut pr = self.head_addr();
            let mut it = 0usize;

            if let Some(o) = outp.as_deref_mut() {
                *o = pr;
            }

            let hiw = self
                .hi_water
                .load(Ordering::Relaxed)
                .min(unsafe { node_ref::<T>(pr) }.nlvl);
            for lvl in (0..hiw).rev() {
                let mut next = unsafe { next_of::<T>(pr, lvl) }.load(Ordering::Acquire);
                if next == 0 && lvl >= n {
                    continue;
                }
                if next & SL_XBIT != 0 {
                    // Our predecessor got deleted under us.
                    continue 'restart;
                }

                it = next;
                while it != 0 {
                    let mut nxt = unsafe { next_of::<T>(it, lvl) }.load(Ordering::Acquire);
                    while nxt & SL_XBIT != 0 {
                        match unlink {
                            Unlink::Skip | Unlink::None => {
                                // Follow the tagged pointer to its target.
                                it = nxt & !SL_XBIT;
                                if it == 0 {
                                    break;
                                }
                                nxt = unsafe { next_of::<T>(it, lvl) }.load(Ordering::Acquire);
                            }
                            Unlink::Assist | Unlink::Force => {
                                let prev = cas_val(
                                    unsafe { next_of::<T>(pr, lvl) },
                                    it,
                                    nxt & !SL_XBIT,
                                );
                                if prev == it {
                                    it = nxt & !SL_XBIT;
                                } else {
                                    if prev & SL_XBIT != 0 {
                                        continue 'restart;
                                    }
                                    it = prev;
                                }
                                nxt = if it != 0 {
                                    unsafe { next_of::<T>(it, lvl) }.load(Ordering::Acquire)
                                } else {
                                    0
                                };
                            }
                        }
                    }

                    if it == 0 {
                        break;
                    }
                    let ik = unsafe { key_of::<T>(it) };
                    if key < ik {
                        break;
                    }
                    if unlink != Unlink::Force && !(ik < key) {
                        got = true;
                        break;
                    }

                    pr = it;
                    it = nxt;
                }

                if let (Some(p), Some(s)) = (preds.as_deref_mut(), succs.as_deref_mut()) {
                    p[lvl] = pr;
                    s[lvl] = it;
                }
            }

            return if got || unlink == Unlink::Skip { it } else { 0 };
        }
    }

    /// Returns a copy of the stored key equal to `key`.
    pub fn find(&self, key: &T) -> Option<T> {
        let _g = CsGuard::new();
        let it = self.find_preds(0, key, Unlink::None, None, None, None);
        if it == 0 {
            None
        } else {
            Some(unsafe { key_of::<T>(it) }.clone())
        }
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &T) -> bool {
        let _g = CsGuard::new();
        self.find_preds(0, key, Unlink::None, None, None, None) != 0
    }

    /// Largest key strictly less than `key`.
    pub fn lower_bound(&self, key: &T) -> Option<T> {
        let _g = CsGuard::new();
        let mut preds = [0usize; SL_MAX_DEPTH];
        let mut succs = [0usize; SL_MAX_DEPTH];
        self.find_preds(
            0,
            key,
            Unlink::None,
            Some(&mut preds),
            Some(&mut succs),
            None,
        );

        let pred = preds[0];
        if pred == 0 || pred == self.head_addr() {
            None
        } else {
            Some(unsafe { key_of::<T>(pred) }.clone())
        }
    }

    /// Smallest key strictly greater than `key`.
    pub fn upper_bound(&self, key: &T) -> Option<T> {
        let _g = CsGuard::new();
        let it = self.find_preds(0, key, Unlink::Skip, None, None, None);
        if it == 0 {
            return None;
        }

        let ik = unsafe { key_of::<T>(it) };
        if ik > key {
            return Some(ik.clone());
        }
        // Landed on the key itself; step past it.
        let next = unsafe { advance::<T>(it) };
        if next == 0 {
            None
        } else {
            Some(unsafe { key_of::<T>(next) }.clone())
        }
    }

    /// Inserts `key`. Returns `false` when an equal key is present.
    pub fn insert(&self, key: T) -> bool {
        let _g = CsGuard::new();
        let backoff = Backoff::new();

        loop {
            let mut preds = [0usize; SL_MAX_DEPTH];
            let mut succs = [0usize; SL_MAX_DEPTH];
            let mut xroot = 0usize;

            // The root's level count bounds n in case a swap installed a
            // shallower root.
            let n = self
                .rand_lvl()
                .min(unsafe { node_ref::<T>(self.head_addr()) }.nlvl);
            if self.find_preds(
                n,
                &key,
                Unlink::Assist,
                Some(&mut preds),
                Some(&mut succs),
                Some(&mut xroot),
            ) != 0
            {
                return false;
            }

            let nv = SlNode::make(n, key.clone());
            for (lvl, &succ) in succs.iter().enumerate().take(n) {
                unsafe { next_of::<T>(nv, lvl) }.store(succ, Ordering::Relaxed);
            }

            // Publish at the base level; this is the linearization point.
            if !cas_bool(unsafe { next_of::<T>(preds[0], 0) }, succs[0], nv) {
                // Never observable yet; tear it down synchronously.
                unsafe { node_destroy::<T>(nv as *mut FinNode) };
                backoff.spin();
                continue;
            }

            // Link the upper levels, refreshing the walk on contention.
            'link: for lvl in 1..n {
                loop {
                    if preds[lvl] == 0 {
                        // The high-water mark receded (root swap); the
                        // node simply stays shorter.
                        break 'link;
                    }
                    if cas_bool(unsafe { next_of::<T>(preds[lvl], lvl) }, succs[lvl], nv) {
                        break;
                    }

                    backoff.spin();
                    self.find_preds(
                        n,
                        &key,
                        Unlink::Assist,
                        Some(&mut preds),
                        Some(&mut succs),
                        None,
                    );
                    for ix in lvl..n {
                        let pred = unsafe { next_of::<T>(nv, ix) }.load(Ordering::Acquire);
                        if pred == succs[ix] {
                            continue;
                        }
                        if cas_val(unsafe { next_of::<T>(nv, ix) }, pred, succs[ix]) & SL_XBIT != 0
                        {
                            // A concurrent erase targeted this very key.
                            // The node was published at the base level, so
                            // the eraser's decrement needs a matching bump.
                            unsafe { node_ref::<T>(xroot) }
                                .len_lock
                                .fetch_add(2, Ordering::AcqRel);
                            self.find_preds(0, &key, Unlink::Force, None, None, None);
                            return false;
                        }
                    }
                }
            }

            if unsafe { next_of::<T>(nv, n - 1) }.load(Ordering::Acquire) & SL_XBIT != 0 {
                unsafe { node_ref::<T>(xroot) }
                    .len_lock
                    .fetch_add(2, Ordering::AcqRel);
                self.find_preds(0, &key, Unlink::Force, None, None, None);
                return false;
            }

            unsafe { node_ref::<T>(xroot) }
                .len_lock
                .fetch_add(2, Ordering::AcqRel);
            return true;
        }
    }

    /// Tags and unlinks the node equal to `key`; returns its address.
    fn erase_node(&self, key: &T) -> usize {
        let mut xroot = 0usize;
        let it = self.find_preds(
            self.hi_water.load(Ordering::Relaxed),
            key,
            Unlink::None,
            None,
            None,
            Some(&mut xroot),
        );
        if it == 0 {
            return 0;
        }

        let backoff = Backoff::new();
        let node = unsafe { node_ref::<T>(it) };
        for lvl in (0..node.nlvl).rev() {
            let mut prev = node.next[lvl].load(Ordering::Acquire);
            loop {
                let next = prev;
                prev = cas_val(&node.next[lvl], next, next | SL_XBIT);
                if prev & SL_XBIT != 0 {
                    if lvl == 0 {
                        // Another eraser won the base level.
                        return 0;
                    }
                    break;
                }
                if next == prev {
                    break;
                }
                backoff.spin();
            }
        }

        self.find_preds(0, key, Unlink::Force, None, None, None);
        unsafe { node_ref::<T>(xroot) }
            .len_lock
            .fetch_sub(2, Ordering::AcqRel);
        it
    }

    /// Removes `key`. Returns `true` when it was present.
    pub fn erase(&self, key: &T) -> bool {
        let _g = CsGuard::new();
        let it = self.erase_node(key);
        if it == 0 {
            return false;
        }
        unsafe { finalize((it & !SL_XBIT) as *mut FinNode) };
        true
    }

    /// Removes `key`, returning the stored copy.
    pub fn remove(&self, key: &T) -> Option<T> {
        let _g = CsGuard::new();
        let it = self.erase_node(key);
        if it == 0 {
            return None;
        }
        let out = unsafe { key_of::<T>(it) }.clone();
        unsafe { finalize((it & !SL_XBIT) as *mut FinNode) };
        Some(out)
    }

    /// Number of keys: the root's length word, shifted past the lock bit.
    pub fn len(&self) -> usize {
        let _g = CsGuard::new();
        unsafe { node_ref::<T>(self.head_addr()) }
            .len_lock
            .load(Ordering::Relaxed)
            >> 1
    }

    /// Whether the list holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound on the number of storable keys.
    pub fn max_size(&self) -> usize {
        usize::MAX >> 1
    }

    /// Finalizes a detached root and every node reachable from it.
    ///
    /// Each node's base-level pointer is claimed with `XBIT` first: a node
    /// an eraser tagged already belongs to that eraser, and a late insert
    /// into the detached chain fails against the claimed predecessor.
    fn fini_root(&self, root: usize) {
        let root = root & !SL_XBIT;
        let prev = unsafe { next_of::<T>(root, 0) }.fetch_or(SL_XBIT, Ordering::AcqRel);
        unsafe { finalize(root as *mut FinNode) };

        let mut run = prev & !SL_XBIT;
        while run != 0 {
            let prev = unsafe { next_of::<T>(run, 0) }.fetch_or(SL_XBIT, Ordering::AcqRel);
            if prev & SL_XBIT == 0 {
                unsafe { finalize(run as *mut FinNode) };
            }
            run = prev & !SL_XBIT;
        }
    }

    /// Removes every key by publishing a fresh root.
    ///
    /// The outgoing root is locked first, so a racing [`swap`](Self::swap)
    /// cannot republish it.
    pub fn clear(&self) {
        let _g = CsGuard::new();
        let fresh = SlNode::<T>::make_root(self.max_depth);
        let prev = self.lock_root();
        self.head.store(fresh, Ordering::Release);
        self.fini_root(prev);
    }

    /// Replaces the contents with the items of `iter`.
    pub fn assign<I: IntoIterator<Item = T>>(&self, iter: I) {
        let tmp = SkipList::with_depth(self.max_depth);
        for v in iter {
            tmp.insert(v);
        }
        let hiw = tmp.hi_water.load(Ordering::Relaxed);
        let fresh = tmp.head.swap(0, Ordering::AcqRel);

        let _g = CsGuard::new();
        let prev = self.lock_root();
        self.hi_water.store(hiw, Ordering::Relaxed);
        self.head.store(fresh, Ordering::Release);
        self.fini_root(prev);
    }

    /// Locks the current root's length word, returning the root address.
    fn lock_root(&self) -> usize {
        loop {
            let root = self.head_addr();
            let lp = &unsafe { node_ref::<T>(root) }.len_lock;
            let val = lp.load(Ordering::Relaxed);
            if val & 1 == 0 && lp.compare_exchange_weak(val, val | 1, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                if self.head_addr() == root {
                    return root;
                }
                // The root moved while we were locking a stale one.
                lp.fetch_and(!1, Ordering::AcqRel);
            }
            spin_loop();
        }
    }

    /// Atomically exchanges the contents of two lists.
    pub fn swap(&self, other: &Self) {
        if ptr::eq(self, other) {
            return;
        }

        let _g = CsGuard::new();
        // Address order keeps concurrent swaps from deadlocking.
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };

        let ra = first.lock_root();
        let rb = second.lock_root();

        let wa = first.hi_water.load(Ordering::Relaxed);
        let wb = second.hi_water.load(Ordering::Relaxed);
        first.hi_water.store(wb, Ordering::Relaxed);
        second.hi_water.store(wa, Ordering::Relaxed);

        first.head.store(rb, Ordering::Release);
        second.head.store(ra, Ordering::Release);

        unsafe {
            node_ref::<T>(rb).len_lock.fetch_and(!1, Ordering::AcqRel);
            node_ref::<T>(ra).len_lock.fetch_and(!1, Ordering::AcqRel);
        }
    }

    /// Iterates in ascending key order, skipping logically deleted nodes.
    pub fn iter(&self) -> Iter<T> {
        let guard = CsGuard::new();
        let head = self.head_addr();
        let first = unsafe { advance::<T>(head) };
        Iter {
            _guard: guard,
            node: first,
            _marker: PhantomData,
        }
    }
}

impl<T: Ord + Clone + Send + Sync + 'static> Default for SkipList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + Send + Sync + 'static> FromIterator<T> for SkipList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let list = Self::new();
        for v in iter {
            list.insert(v);
        }
        list
    }
}

impl<T: Ord + Clone + Send + Sync + 'static> Clone for SkipList<T> {
    fn clone(&self) -> Self {
        let list = Self::with_depth(self.max_depth);
        for v in self.iter() {
            list.insert(v);
        }
        list
    }
}

impl<T: Ord + Clone + Send + Sync + 'static> PartialEq for SkipList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<T: Ord + Clone + Send + Sync + 'static> Eq for SkipList<T> {}

impl<T: Ord + Clone + Send + Sync + 'static> PartialOrd for SkipList<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.iter().partial_cmp(other.iter())
    }
}

impl<T> Drop for SkipList<T> {
    fn drop(&mut self) {
        let mut run = *self.head.get_mut() & !SL_XBIT;
        while run != 0 {
            let next =
                unsafe { next_of::<T>(run, 0) }.load(Ordering::Relaxed) & !SL_XBIT;
            unsafe { destroy_now(run as *mut FinNode) };
            run = next;
        }
    }
}

/// Guard-holding ascending iterator over a [`SkipList`].
pub struct Iter<T> {
    _guard: CsGuard,
    node: usize,
    _marker: PhantomData<T>,
}

impl<T: Clone> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.node == 0 {
            return None;
        }
        let out = unsafe { key_of::<T>(self.node) }.clone();
        self.node = unsafe { advance::<T>(self.node) };
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_insert_and_bounds() {
        let l = SkipList::new();
        for v in [5, 1, 9, 3, 7] {
            assert!(l.insert(v));
        }
        assert!(!l.insert(5));
        assert_eq!(l.len(), 5);

        let seen: Vec<i32> = l.iter().collect();
        assert_eq!(seen, [1, 3, 5, 7, 9]);

        assert_eq!(l.lower_bound(&5), Some(3));
        assert_eq!(l.lower_bound(&1), None);
        assert_eq!(l.upper_bound(&5), Some(7));
        assert_eq!(l.upper_bound(&4), Some(5));
        assert_eq!(l.upper_bound(&9), None);
    }

    #[test]
    fn erase_twice() {
        let l = SkipList::new();
        l.insert("a".to_owned());
        assert!(l.erase(&"a".to_owned()));
        assert!(!l.erase(&"a".to_owned()));
        assert!(l.is_empty());
    }
}
