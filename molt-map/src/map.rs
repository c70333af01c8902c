//! Hash table: prime-sized frames of (key, value) word pairs.

use crate::clamp_load_factor;
use crossbeam_utils::Backoff;
use molt::{drop_boxed, finalize, CsGuard, FinNode, LwLock, SlotValue, WordPair, HAS_DCAS};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Table sizes; double hashing needs a prime slot count.
const PRIMES: [usize; 18] = [
    0xb, 0x25, 0x71, 0x15b, 0x419, 0xc4d, 0x24f5, 0x6ee3, 0x14cb3, 0x3e61d, 0xbb259, 0x23170f,
    0x694531, 0x13bcf95, 0x3b36ec3, 0xb1a4c4b, 0x214ee4e3, 0x63ecaead,
];

const NPOS: usize = usize::MAX;

/// Picks the first prime fitting `size` entries; returns (index, grow limit).
fn find_hsize(size: usize, ldf: f32) -> (usize, isize) {
    let pidx = PRIMES
        .iter()
        .position(|&p| p >= size)
        .unwrap_or(PRIMES.len() - 1);
    (pidx, (PRIMES[pidx] as f32 * ldf) as isize)
}

/// Secondary probe step; coprime to every table prime.
#[inline]
fn secondary_hash(code: usize) -> usize {
    [2, 3, 5, 7][code & 3]
}

#[repr(C)]
struct HFrame {
    fin: FinNode,
    entries: usize,
    pidx: usize,
    nelems: AtomicUsize,
    data: Box<[WordPair]>,
}

impl HFrame {
    fn make(pidx: usize, key_free: usize, val_free: usize) -> *mut HFrame {
        let entries = PRIMES[pidx];
        let data: Box<[WordPair]> = (0..entries)
            .map(|_| WordPair::new(key_free, val_free))
            .collect();
        Box::into_raw(Box::new(HFrame {
            fin: FinNode::new(drop_boxed::<HFrame>),
            entries,
            pidx,
            nelems: AtomicUsize::new(0),
            data,
        }))
    }
}

/// Unfreezes a frame's value slots if a rehash unwinds, then releases the
/// growth lock.
struct HtSentry<'a> {
    lock: &'a LwLock,
    xbit: usize,
    frame: Option<&'a HFrame>,
}

impl<'a> HtSentry<'a> {
    fn new(lock: &'a LwLock, xbit: usize) -> Self {
        lock.acquire();
        Self {
            lock,
            xbit,
            frame: None,
        }
    }
}

impl Drop for HtSentry<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame {
            for pair in frame.data.iter() {
                pair.fetch_and_hi(!self.xbit, Ordering::AcqRel);
            }
        }
        self.lock.release();
    }
}

/// Lock-free hash table with sentinel-encoded open addressing.
///
/// Lookups and erases are obstruction-free; inserts may trigger a rehash
/// that runs under the container's word lock while readers keep going on
/// the old frame.
pub struct HashMap<K: SlotValue + Hash + Eq, V: SlotValue, S = foldhash::fast::FixedState> {
    frame: AtomicPtr<HFrame>,
    grow_limit: AtomicIsize,
    loadf_bits: AtomicU32,
    lock: LwLock,
    hasher: S,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: payloads are slot words; cross-thread destruction goes through
// the reclamation engine.
unsafe impl<K: SlotValue + Hash + Eq, V: SlotValue, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: SlotValue + Hash + Eq, V: SlotValue, S: Sync> Sync for HashMap<K, V, S> {}

impl<K: SlotValue + Hash + Eq, V: SlotValue> HashMap<K, V> {
    /// Creates an empty table with the default hasher.
    pub fn new() -> Self {
        Self::with_params(0, 0.85, Default::default())
    }

    /// Creates a table pre-sized for `size` entries.
    pub fn with_capacity(size: usize) -> Self {
        Self::with_params(size, 0.85, Default::default())
    }
}

impl<K: SlotValue + Hash + Eq, V: SlotValue, S: BuildHasher> HashMap<K, V, S> {
    /// Creates an empty table with a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_params(0, 0.85, hasher)
    }

    /// Creates a table with explicit size, load factor and hasher.
    ///
    /// The load factor is clamped to `[0.4, 0.9]`.
    pub fn with_params(size: usize, ldf: f32, hasher: S) -> Self {
        let ldf = clamp_load_factor(ldf);
        let (pidx, grow) = find_hsize(size, ldf);
        Self {
            frame: AtomicPtr::new(HFrame::make(pidx, K::FREE, V::FREE)),
            grow_limit: AtomicIsize::new(grow),
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

    /// Sets the load factor (clamped), returning the previous one.
    pub fn set_load_factor(&self, ldf: f32) -> f32 {
        self.lock.acquire();
        let prev = self.load_factor();
        self.loadf_bits
            .store(clamp_load_factor(ldf).to_bits(), Ordering::Relaxed);
        self.lock.release();
        prev
    }

    /// Number of live entries (snapshot).
    pub fn len(&self) -> usize {
        let _g = CsGuard::new();
        unsafe { &*self.frame.load(Ordering::Acquire) }
            .nelems
            .load(Ordering::Relaxed)
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest supported table size.
    pub fn max_size(&self) -> usize {
        PRIMES[PRIMES.len() - 1]
    }

    /// Probes for `key`. With `put` set, the first `FREE` slot is an
    /// insertion candidate (second tuple element `true`); otherwise the
    /// index of the live key, or `NPOS`.
    fn probe(&self, key: &K, frame: &HFrame, put: bool) -> (usize, bool) {
        let code = self.hasher.hash_one(key) as usize;
        let entries = frame.entries;
        let mut idx = code % entries;
        let initial = idx;
        let sec = secondary_hash(code);

        loop {
            let k = frame.data[idx].load_lo(Ordering::Acquire);
            if k == K::FREE {
                return if put { (idx, true) } else { (NPOS, false) };
            }
            if k != K::DELT && unsafe { K::with_ref(k, |sk| sk == key) } {
                return (idx, false);
            }

            idx = (idx + sec) % entries;
            if idx == initial {
                return (NPOS, false);
            }
        }
    }

    fn find_word(&self, key: &K, frame: &HFrame) -> Option<usize> {
        let (idx, _) = self.probe(key, frame, false);
        if idx == NPOS {
            return None;
        }
        let v = frame.data[idx].load_hi(Ordering::Acquire) & !V::XBIT;
        if v == V::FREE || v == V::DELT {
            None
        } else {
            Some(v)
        }
    }

    /// Returns a copy of the value stored under `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let _g = CsGuard::new();
        let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
        self.find_word(key, frame).map(|w| unsafe { V::get(w) })
    }

    /// Returns the value stored under `key`, or `dfl` when absent.
    pub fn find_or(&self, key: &K, dfl: V) -> V {
        self.find(key).unwrap_or(dfl)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let _g = CsGuard::new();
        let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
        self.find_word(key, frame).is_some()
    }

    fn decr_limit(&self) -> bool {
        if self.grow_limit.load(Ordering::Relaxed) <= 0 {
            return false;
        }
        // A failed insert afterwards leaves the limit slightly small; the
        // table just rehashes a bit early, which is harmless. Never add
        // the count back: over-crediting could postpone a needed rehash.
        self.grow_limit.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Probes a private frame during rehash; no concurrent writers exist.
    fn gprobe(&self, key_word: usize, frame: &HFrame) -> usize {
        let code = unsafe { K::with_ref(key_word, |k| self.hasher.hash_one(k)) } as usize;
        let entries = frame.entries;
        let mut idx = code % entries;
        if frame.data[idx].load_lo(Ordering::Relaxed) == K::FREE {
            return idx;
        }
        let sec = secondary_hash(code);
        loop {
            idx = (idx + sec) % entries;
            if frame.data[idx].load_lo(Ordering::Relaxed) == K::FREE {
                return idx;
            }
        }
    }

    /// Grows to the next prime, migrating live pairs under the lock.
    fn rehash(&self) {
        let mut sentry = HtSentry::new(&self.lock, V::XBIT);
        if self.grow_limit.load(Ordering::Relaxed) > 0 {
            // Someone else grew the table while we waited for the lock.
            return;
        }

        let old_ptr = self.frame.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let np_ptr = HFrame::make(
            (old.pidx + 1).min(PRIMES.len() - 1),
            K::FREE,
            V::FREE,
        );
        let np = unsafe { &*np_ptr };
        let mut nelem = 0usize;

        sentry.frame = Some(old);
        for i in 0..old.entries {
            let key = old.data[i].load_lo(Ordering::Acquire);
            let val = old.data[i].fetch_or_hi(V::XBIT, Ordering::AcqRel);

            if key != K::FREE && key != K::DELT && val != V::FREE && val != V::DELT {
                let nidx = self.gprobe(key, np);
                np.data[nidx].store_lo(key, Ordering::Relaxed);
                np.data[nidx].store_hi(val, Ordering::Relaxed);
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

        // A concurrent writer may decrement the limit against the old
        // frame here; that only means an earlier rehash next time.
        self.frame.store(np_ptr, Ordering::Release);
        unsafe { finalize(old_ptr as *mut FinNode) };
    }

    /// Shared insert/update machinery.
    ///
    /// `on_absent` produces the value word for a fresh entry, `on_present`
    /// maps the current value word to a replacement (returning the same
    /// word means "leave as is"). Returns `true` when a new entry was
    /// created.
    fn upsert(
        &self,
        key: &K,
        mut on_absent: impl FnMut() -> usize,
        mut on_present: impl FnMut(usize) -> usize,
    ) -> bool {
        let _g = CsGuard::new();
        let backoff = Backoff::new();

        loop {
            let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
            let (idx, found_free) = self.probe(key, frame, true);

            if idx == NPOS {
                // Saturated with DELT slots; force a migration.
                self.rehash();
                continue;
            }

            if !found_free {
                let pair = &frame.data[idx];
                let tmp = pair.load_hi(Ordering::Acquire);
                if tmp != V::DELT && tmp != V::FREE && tmp & V::XBIT == 0 {
                    let v = on_present(tmp);
                    if v == tmp {
                        return false;
                    }
                    if pair.cas_hi(tmp, v) {
                        unsafe { V::destroy(tmp) };
                        return false;
                    }
                    // Lost to a concurrent update or erase.
                    unsafe { V::free(v) };
                    backoff.spin();
                    continue;
                }
                // Value slot deleted or frozen under us: fall through.
            } else if self.decr_limit() {
                let k = K::make(key.clone());
                let v = on_absent();

                let published = if HAS_DCAS {
                    frame.data[idx].dcas((K::FREE, V::FREE), (k, v))
                } else if frame.data[idx].cas_lo(K::FREE, k) {
                    if frame.data[idx].cas_hi(V::FREE, v) {
                        true
                    } else {
                        // The value slot was frozen between the two steps.
                        // Retract the half-published key and retry against
                        // the new frame; probers may already have seen the
                        // key, so its wrapper takes the deferred path.
                        let _ = frame.data[idx].cas_lo(k, K::DELT);
                        unsafe {
                            K::destroy(k);
                            V::free(v);
                        }
                        continue;
                    }
                } else {
                    false
                };

                if published {
                    frame.nelems.fetch_add(1, Ordering::AcqRel);
                    return true;
                }

                unsafe {
                    K::free(k);
                    V::free(v);
                }
                backoff.spin();
                continue;
            }

            // The table is being (or needs to be) rehashed; help and retry.
            self.rehash();
        }
    }

    /// Inserts `(key, val)`. An existing entry has its value replaced.
    ///
    /// Returns `true` when the key was absent.
    pub fn insert(&self, key: K, val: V) -> bool {
        self.upsert(
            &key,
            || V::make(val.clone()),
            |_| V::make(val.clone()),
        )
    }

    /// Upserts through `f`, which sees the current value when present.
    ///
    /// Returns `true` when a new entry was created.
    pub fn update<F>(&self, key: K, f: F) -> bool
    where
        F: Fn(Option<&V>) -> V,
    {
        self.upsert(
            &key,
            || V::make(f(None)),
            |old| {
                let nv = unsafe { V::with_ref(old, |ov| f(Some(ov))) };
                V::make(nv)
            },
        )
    }

    fn erase_value(&self, key: &K) -> Option<V> {
        let _g = CsGuard::new();
        let backoff = Backoff::new();

        loop {
            let frame = unsafe { &*self.frame.load(Ordering::Acquire) };
            let (idx, _) = self.probe(key, frame, false);
            if idx == NPOS {
                return None;
            }

            let pair = &frame.data[idx];
            let oldk = pair.load_lo(Ordering::Acquire);
            let oldv = pair.load_hi(Ordering::Acquire);

            if oldv & V::XBIT == 0 {
                if oldk == K::DELT || oldk == K::FREE || oldv == V::DELT || oldv == V::FREE {
                    return None;
                }
                if !pair.cas_hi(oldv, V::DELT) {
                    backoff.spin();
                    continue;
                }

                frame.nelems.fetch_sub(1, Ordering::AcqRel);
                // The DELT value already bars reuse of the slot, so the
                // key word needs no CAS.
                pair.store_lo(K::DELT, Ordering::Release);

                let out = unsafe { V::get(oldv) };
                unsafe {
                    K::destroy(oldk);
                    V::destroy(oldv);
                }
                return Some(out);
            }

            // Frozen mid-rehash; help and retry.
            self.rehash();
        }
    }

    /// Removes `key`. Returns `true` when an entry was erased.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_value(key).is_some()
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.erase_value(key)
    }

    /// Destroys every live pair of the current frame and installs `np`.
    fn assign_frame(&self, np: *mut HFrame, grow: isize) {
        self.lock.acquire();
        let old_ptr = self.frame.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };

        for i in 0..old.entries {
            let v = old.data[i].fetch_or_hi(V::XBIT, Ordering::AcqRel);
            if v != V::FREE && v != V::DELT {
                let k = old.data[i].load_lo(Ordering::Relaxed);
                unsafe {
                    K::destroy(k);
                    V::destroy(v);
                }
            }
        }

        self.grow_limit.store(grow, Ordering::Relaxed);
        fence(Ordering::Release);
        self.frame.store(np, Ordering::Release);
        self.lock.release();
        unsafe { finalize(old_ptr as *mut FinNode) };
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let (pidx, grow) = find_hsize(0, self.load_factor());
        let np = HFrame::make(pidx, K::FREE, V::FREE);
        self.assign_frame(np, grow);
    }

    /// Replaces the contents with the pairs of `iter`.
    pub fn assign<I: IntoIterator<Item = (K, V)>>(&self, iter: I)
    where
        S: Clone,
    {
        let tmp = HashMap::with_params(0, self.load_factor(), self.hasher.clone());
        for (k, v) in iter {
            tmp.insert(k, v);
        }
        let np = tmp.frame.swap(ptr::null_mut(), Ordering::AcqRel);
        let grow = tmp.grow_limit.load(Ordering::Relaxed);
        self.assign_frame(np, grow);
    }

    /// Atomically exchanges the contents of two tables.
    ///
    /// Both tables must hash identically (the default hasher does); the
    /// frames trade places but each hasher stays put.
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

        // Stop insertions on both sides; erases may keep landing on the
        // old frames, which travel with their own element counts.
        self.grow_limit.store(0, Ordering::Release);
        other.grow_limit.store(0, Ordering::Release);

        let fa = self.frame.load(Ordering::Relaxed);
        let fb = other.frame.load(Ordering::Relaxed);
        self.frame.store(fb, Ordering::Release);
        other.frame.store(fa, Ordering::Release);

        let la = self.loadf_bits.load(Ordering::Relaxed);
        let lb = other.loadf_bits.load(Ordering::Relaxed);
        self.loadf_bits.store(lb, Ordering::Relaxed);
        other.loadf_bits.store(la, Ordering::Relaxed);

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
    ///
    /// The iterator holds a critical section and does not observe
    /// rehashes: it walks the frame that was current at creation.
    pub fn iter(&self) -> Iter<K, V> {
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

impl<K: SlotValue + Hash + Eq, V: SlotValue> Default for HashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SlotValue + Hash + Eq, V: SlotValue, S: BuildHasher + Default> FromIterator<(K, V)>
    for HashMap<K, V, S>
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_params(0, 0.85, S::default());
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K: SlotValue + Hash + Eq, V: SlotValue, S: BuildHasher + Clone> Clone for HashMap<K, V, S> {
    fn clone(&self) -> Self {
        let map = Self::with_params(self.len(), self.load_factor(), self.hasher.clone());
        for (k, v) in self.iter() {
            map.insert(k, v);
        }
        map
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: SlotValue + Hash + Eq,
    V: SlotValue + PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.find(&k).map_or(false, |ov| ov == v))
    }
}

impl<K, V, S> std::fmt::Debug for HashMap<K, V, S>
where
    K: SlotValue + Hash + Eq + std::fmt::Debug,
    V: SlotValue + std::fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: SlotValue + Hash + Eq, V: SlotValue, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        let frame = *self.frame.get_mut();
        if frame.is_null() {
            return;
        }
        let f = unsafe { &*frame };
        for i in 0..f.entries {
            let k = f.data[i].load_lo(Ordering::Relaxed) & !K::XBIT;
            if k == K::FREE || k == K::DELT {
                continue;
            }
            let v = f.data[i].load_hi(Ordering::Relaxed) & !V::XBIT;
            unsafe {
                K::free(k);
                if v != V::FREE && v != V::DELT {
                    V::free(v);
                }
            }
        }
        unsafe { drop(Box::from_raw(frame)) };
    }
}

/// Guard-holding snapshot iterator over a [`HashMap`].
pub struct Iter<K, V> {
    _guard: CsGuard,
    frame: *const HFrame,
    idx: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: SlotValue + Hash + Eq, V: SlotValue> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let frame = unsafe { &*self.frame };
        while self.idx < frame.entries {
            let pair = &frame.data[self.idx];
            self.idx += 1;

            let k = pair.load_lo(Ordering::Acquire) & !K::XBIT;
            let v = pair.load_hi(Ordering::Acquire) & !V::XBIT;
            if k != K::FREE && k != K::DELT && v != V::FREE && v != V::DELT {
                return Some(unsafe { (K::get(k), V::get(v)) });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_erase() {
        let m: HashMap<i32, String> = HashMap::new();
        assert!(m.insert(1, "one".into()));
        assert!(m.insert(2, "two".into()));
        assert!(!m.insert(1, "uno".into()));
        assert_eq!(m.find(&1).as_deref(), Some("uno"));
        assert_eq!(m.len(), 2);

        assert!(m.erase(&1));
        assert!(!m.erase(&1));
        assert_eq!(m.find(&1), None);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn update_existing_and_missing() {
        let m: HashMap<i32, String> = HashMap::new();
        m.insert(7, "x".into());
        assert!(!m.update(7, |old| format!("{}!", old.unwrap())));
        assert_eq!(m.find(&7).as_deref(), Some("x!"));

        assert!(m.update(8, |old| {
            assert!(old.is_none());
            "fresh".into()
        }));
        assert_eq!(m.find(&8).as_deref(), Some("fresh"));
    }
}
