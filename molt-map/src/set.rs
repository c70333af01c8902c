//! Hash set: power-of-two frames of single key slots.

use crate::clamp_load_factor;
use crossbeam_utils::Backoff;
use molt::{drop_boxed, finalize, CsGuard, FinNode, LwLock, SlotValue};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

const NPOS: usize = usize::MAX;

fn upsize(size: usize) -> usize {
    size.max(8).next_power_of_two()
}

#[repr(C)]
struct HsFrame {
    fin: FinNode,
    entries: usize,
    nelems: AtomicUsize,
    data: Box<[AtomicUsize]>,
}

impl HsFrame {
    fn make(entries: usize, fill: usize) -> *mut HsFrame {
        let data: Box<[AtomicUsize]> = (0..entries).map(|_| AtomicUsize::new(fill)).collect();
        Box::into_raw(Box::new(HsFrame {
            fin: FinNode::new(drop_boxed::<HsFrame>),
            entries,
            nelems: AtomicUsize::new(0),
            data,
        }))
    }
}

/// Unfreezes a frame's key slots if a rehash unwinds, then releases the
/// growth lock.
struct HsSentry<'a> {
    lock: &'a LwLock,
    xbit: usize,
    frame: Option<&'a HsFrame>,
}

impl<'a> HsSentry<'a> {
    fn new(lock: &'a LwLock, xbit: usize) -> Self {
        lock.acquire();
        Self {
            lock,
            xbit,
            frame: None,
        }
    }
}

impl Drop for HsSentry<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame {
            for slot in frame.data.iter() {
                slot.fetch_and(!self.xbit, Ordering::AcqRel);
            }
        }
        self.lock.release();
    }
}

/// Lock-free hash set.
///
/// Tables are powers of two probed triangularly (step 1, 2, 3, …), which
/// visits every slot before cycling. Each slot is one key word.
pub struct HashSet<K: SlotValue + Hash + Eq, S = foldhash::fast::FixedState> {
    frame: AtomicPtr<HsFrame>,
    grow_limit: AtomicIsize,
    loadf_bits: AtomicU32,
    lock: LwLock,
    hasher: S,
    _marker: PhantomData<K>,
}

// SAFETY: keys are slot words; cross-thread destruction goes through the
// reclamation engine.
unsafe impl<K: SlotValue + Hash + Eq, S: Send> Send for HashSet<K, S> {}
unsafe impl<K: SlotValue + Hash + Eq, S: Sync> Sync for HashSet<K, S> {}

impl<K: SlotValue + Hash + Eq> HashSet<K> {
    /// Creates an empty set with the default hasher.
    pub fn new() -> Self {
        Self::with_params(0, 0.85, Default::default())
    }

    /// Creates a set pre-sized for `size` keys.
    pub fn with_capacity(size: usize) -> Self {
        Self::with_params(size, 0.85, Default::default())
    }
}

impl<K: SlotValue + Hash + Eq, S: BuildHasher> HashSet<K, S> {
    /// Creates an empty set with a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_params(0, 0.85, hasher)
    }

    /// Creates a set with explicit size, load factor and hasher.
    pub fn with_params(size: usize, ldf: f32, hasher: S) -> Self {
        let ldf = clamp_load_factor(ldf);
        let entries = upsize(size);
        Self {
            frame: AtomicPtr::new(HsFrame::make(entries, K::FREE)),
            grow_limit: AtomicIsize::new((entries as f32 * ldf) as isize),
            loadf_bits: AtomicU32::new(ldf.to_bits()),
            lock: LwLock::new(),
            hasher,
            _marker: PhantomData,
        }
    }

    /// Current load factor.
    pub fn load_factor(&self) -> f32 {
        f32::from_bits(self.loadf_bits.load(Ordering::Relaxed))
    }

    /// Number of live keys (snapshot).
    pub fn len(&self) -> usize {
        let _g = CsGuard::new();
        unsafe { &*self.frame.load(Ordering::Acquire) }
            .nelems
            .load(Ordering::Relaxed)
    }

    /// Whether the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest supported table size.
    pub fn max_size(&self) -> usize {
        1 << (usize::BITS - 2)
    }

    fn probe(&self, key: &K, frame: &HsFrame, put: bool) -> (usize, bool) {
        let mask = frame.entries - 1;
        let mut idx = self.hasher.hash_one(key) as usize & mask;

        let mut step = 1;
        loop {
            // Mask the freeze bit: a frozen slot still terminates or
            // matches on its underlying key.
            let k = frame.data[idx].load(Ordering::Acquire) & !K::XBIT;
            if k == K::FREE {
                return if put { (idx, true) } else { (NPOS, false) };
            }
            if k != K::DELT && unsafe { K::with_ref(k, |sk| sk == key) } {
                return (idx, false);
            }

            idx = (idx + step) & mask;
            step += 1;
            if step > frame.entries {
                return (NPOS, false);
            }
        }
    }

    fn find_word(&self, key: &K, frame: &HsFrame) -> Option<usize> {
        let (idx, _) = self.probe(key, frame, false);
        if idx == NPOS {
            None
        } else {
            Some(frame.data[idx].load(Ordering::Acquire) & !K::XBIT)
        }
    }

    /// Returns a copy of the stored key equal to `key`.
    pub fn find(&self, key: &K) -> Option<K> {
        let _g = CsGuard::new();
        let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
        self.find_word(key, frame).map(|w| unsafe { K::get(w) })
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let _g = CsGuard::new();
        let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
        self.find_word(key, frame).is_some()
    }

    fn decr_limit(&self) -> bool {
        self.grow_limit.fetch_sub(1, Ordering::AcqRel) > 0
    }

    fn rehash_slot(&self, key_word: usize, frame: &HsFrame) {
        let mask = frame.entries - 1;
        let mut idx =
            unsafe { K::with_ref(key_word, |k| self.hasher.hash_one(k)) } as usize & mask;
        let mut step = 1;
        loop {
            if frame.data[idx].load(Ordering::Relaxed) == K::FREE {
                frame.data[idx].store(key_word, Ordering::Relaxed);
                return;
            }
            idx = (idx + step) & mask;
            step += 1;
        }
    }

    /// Doubles the table, migrating live keys under the lock.
    fn rehash(&self) {
        let mut sentry = HsSentry::new(&self.lock, K::XBIT);
        if self.grow_limit.load(Ordering::Relaxed) > 0 {
            return;
        }

        let old_ptr = self.frame.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let np_ptr = HsFrame::make(old.entries << 1, K::FREE);
        let np = unsafe { &*np_ptr };
        let mut nelem = 0usize;

        sentry.frame = Some(old);
        for i in 0..old.entries {
            let k = old.data[i].fetch_or(K::XBIT, Ordering::AcqRel);
            if k != K::FREE && k != K::DELT {
                self.rehash_slot(k, np);
                nelem += 1;
            }
        }
        sentry.frame = None;

        np.nelems.store(nelem, Ordering::Relaxed);
        self.grow_limit.store(
            (np.entries as f32 * self.load_factor()) as isize - nelem as isize,
            Ordering::Relaxed,
        );
        fence(Ordering::Release);
        self.frame.store(np_ptr, Ordering::Release);
        unsafe { finalize(old_ptr as *mut FinNode) };
    }

    /// Inserts `key`. Returns `false` when it was already present.
    pub fn insert(&self, key: K) -> bool {
        let _g = CsGuard::new();
        let backoff = Backoff::new();

        loop {
            let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
            let (idx, found_free) = self.probe(&key, frame, true);

            if idx != NPOS && !found_free {
                return false;
            }
            if idx != NPOS && self.decr_limit() {
                let k = K::make(key.clone());
                if frame.data[idx]
                    .compare_exchange(K::FREE, k, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    frame.nelems.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                unsafe { K::free(k) };
                backoff.spin();
                continue;
            }

            self.rehash();
        }
    }

    fn erase_value(&self, key: &K) -> Option<K> {
        let _g = CsGuard::new();
        let backoff = Backoff::new();

        loop {
            let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
            let (idx, _) = self.probe(key, frame, false);
            if idx == NPOS {
                return None;
            }

            let old = frame.data[idx].load(Ordering::Acquire);
            if old & K::XBIT == 0 {
                if old == K::DELT || old == K::FREE {
                    return None;
                }
                if frame.data[idx]
                    .compare_exchange(old, K::DELT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    backoff.spin();
                    continue;
                }

                frame.nelems.fetch_sub(1, Ordering::AcqRel);
                let out = unsafe { K::get(old) };
                unsafe { K::destroy(old) };
                return Some(out);
            }

            // Frozen mid-rehash; help and retry.
            self.rehash();
        }
    }

    /// Removes `key`. Returns `true` when it was present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_value(key).is_some()
    }

    /// Removes `key`, returning the stored copy.
    pub fn remove(&self, key: &K) -> Option<K> {
        self.erase_value(key)
    }

    /// Removes every key in place.
    pub fn clear(&self) {
        self.lock.acquire();
        self.grow_limit.store(0, Ordering::Release);

        let frame = unsafe { &*self.frame.load(Ordering::Relaxed) };
        for i in 0..frame.entries {
            let k = frame.data[i].swap(K::FREE, Ordering::AcqRel) & !K::XBIT;
            if k != K::FREE && k != K::DELT {
                unsafe { K::destroy(k) };
            }
        }

        frame.nelems.store(0, Ordering::Release);
        self.grow_limit.store(
            (frame.entries as f32 * self.load_factor()) as isize,
            Ordering::Release,
        );
        self.lock.release();
    }

    /// Replaces the contents with the keys of `iter`.
    pub fn assign<I: IntoIterator<Item = K>>(&self, iter: I)
    where
        S: Clone,
    {
        let tmp = HashSet::with_params(0, self.load_factor(), self.hasher.clone());
        for k in iter {
            tmp.insert(k);
        }
        let np = tmp.frame.swap(ptr::null_mut(), Ordering::AcqRel);
        let grow = tmp.grow_limit.load(Ordering::Relaxed);

        self.lock.acquire();
        let old_ptr = self.frame.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        for i in 0..old.entries {
            let k = old.data[i].fetch_or(K::XBIT, Ordering::AcqRel);
            if k != K::FREE && k != K::DELT {
                unsafe { K::destroy(k) };
            }
        }
        self.grow_limit.store(grow, Ordering::Relaxed);
        fence(Ordering::Release);
        self.frame.store(np, Ordering::Release);
        self.lock.release();
        unsafe { finalize(old_ptr as *mut FinNode) };
    }

    /// Atomically exchanges the contents of two sets.
    ///
    /// Both sets must hash identically (the default hasher does).
    pub fn swap(&self, other: &Self) {
        if ptr::eq(self, other) {
            return;
        }

        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        first.lock.acquire();
        second.lock.acquire();

        self.grow_limit.store(0, Ordering::Release);
        other.grow_limit.store(0, Ordering::Release);

        let fa = self.frame.load(Ordering::Relaxed);
        let fb = other.frame.load(Ordering::Relaxed);
        self.frame.store(fb, Ordering::Release);
        other.frame.store(fa, Ordering::Release);

        unsafe {
            let qa = &*fb;
            self.grow_limit.store(
                (qa.entries as f32 * self.load_factor()) as isize
                    - qa.nelems.load(Ordering::Relaxed) as isize,
                Ordering::Release,
            );
            let qb = &*fa;
            other.grow_limit.store(
                (qb.entries as f32 * other.load_factor()) as isize
                    - qb.nelems.load(Ordering::Relaxed) as isize,
                Ordering::Release,
            );
        }

        second.lock.release();
        first.lock.release();
    }

    /// Iterates over a snapshot frame in unspecified order.
    pub fn iter(&self) -> Iter<K> {
        let guard = CsGuard::new();
        let frame = self.frame.load(Ordering::Acquire);
        Iter {
            _guard: guard,
            frame,
            idx: 0,
            _marker: PhantomData,
        }
    }
}

impl<K: SlotValue + Hash + Eq> Default for HashSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SlotValue + Hash + Eq, S: BuildHasher + Default> FromIterator<K> for HashSet<K, S> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let set = Self::with_params(0, 0.85, S::default());
        for k in iter {
            set.insert(k);
        }
        set
    }
}

impl<K: SlotValue + Hash + Eq, S: BuildHasher + Clone> Clone for HashSet<K, S> {
    fn clone(&self) -> Self {
        let set = Self::with_params(self.len(), self.load_factor(), self.hasher.clone());
        for k in self.iter() {
            set.insert(k);
        }
        set
    }
}

impl<K: SlotValue + Hash + Eq, S: BuildHasher> PartialEq for HashSet<K, S> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|k| other.contains(&k))
    }
}

impl<K, S> std::fmt::Debug for HashSet<K, S>
where
    K: SlotValue + Hash + Eq + std::fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K: SlotValue + Hash + Eq, S> Drop for HashSet<K, S> {
    fn drop(&mut self) {
        let frame = *self.frame.get_mut();
        if frame.is_null() {
            return;
        }
        let f = unsafe { &*frame };
        for i in 0..f.entries {
            let k = f.data[i].load(Ordering::Relaxed) & !K::XBIT;
            if k != K::FREE && k != K::DELT {
                unsafe { K::free(k) };
            }
        }
        unsafe { drop(Box::from_raw(frame)) };
    }
}

/// Guard-holding snapshot iterator over a [`HashSet`].
pub struct Iter<K> {
    _guard: CsGuard,
    frame: *const HsFrame,
    idx: usize,
    _marker: PhantomData<K>,
}

impl<K: SlotValue + Hash + Eq> Iterator for Iter<K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let frame = unsafe { &*self.frame };
        while self.idx < frame.entries {
            let k = frame.data[self.idx].load(Ordering::Acquire) & !K::XBIT;
            self.idx += 1;
            if k != K::FREE && k != K::DELT {
                return Some(unsafe { K::get(k) });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_erase() {
        let s: HashSet<String> = HashSet::new();
        assert!(s.insert("a".into()));
        assert!(!s.insert("a".into()));
        assert!(s.contains(&"a".to_owned()));
        assert_eq!(s.len(), 1);

        assert!(s.erase(&"a".to_owned()));
        assert!(!s.erase(&"a".to_owned()));
        assert!(s.is_empty());
    }

    #[test]
    fn grows_past_initial_size() {
        let s: HashSet<i32> = HashSet::with_capacity(8);
        for i in 0..1000 {
            assert!(s.insert(i));
        }
        assert_eq!(s.len(), 1000);
        for i in 0..1000 {
            assert!(s.contains(&i), "missing {i}");
        }
    }
}
