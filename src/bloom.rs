//! C3 — rotating Bloom filter pair (spec §4.3).
//!
//! Two rotations live behind a single [`RotatingBloom`]: a current
//! generation and a previous one. Membership probes consult both;
//! additions only ever touch the current generation. Rotation discards
//! the previous generation, promotes current to previous, and allocates a
//! fresh current — an O(1) pointer swap.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A fixed-capacity Bloom filter with word-sized atomic bit storage.
/// Reads never block; additions use atomic fetch-or, so concurrent
/// inserts from multiple callers are race-free without an external lock.
struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    k: u32,
    hasher1: RandomState,
    hasher2: RandomState,
}

impl BloomFilter {
    fn new(capacity: usize, fp_rate: f64) -> Self {
        let n = (capacity.max(1)) as f64;
        let p = fp_rate.clamp(1e-6, 0.5);
        let m = (-(n * p.ln()) / (std::f64::consts::LN_2.powi(2))).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).round().max(1.0) as u32;
        let words = (m / 64) + 1;
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits: words * 64,
            k: k.min(16),
            hasher1: RandomState::new(),
            hasher2: RandomState::new(),
        }
    }

    /// Kirsch-Mitzenmacher double hashing: derive `k` indices from two
    /// independent 64-bit hashes instead of running `k` hash functions.
    fn indices(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = self.hash_with(&self.hasher1, item);
        let h2 = self.hash_with(&self.hasher2, item);
        (0..self.k).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            combined % self.num_bits
        })
    }

    fn hash_with(&self, state: &RandomState, item: &[u8]) -> u64 {
        let mut hasher = state.build_hasher();
        item.hash(&mut hasher);
        hasher.finish()
    }

    fn insert(&self, item: &[u8]) {
        for idx in self.indices(item) {
            let word = idx / 64;
            let bit = idx % 64;
            self.bits[word as usize].fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    fn contains(&self, item: &[u8]) -> bool {
        self.indices(item).all(|idx| {
            let word = idx / 64;
            let bit = idx % 64;
            self.bits[word as usize].load(Ordering::Relaxed) & (1 << bit) != 0
        })
    }
}

struct Generations {
    current: BloomFilter,
    previous: BloomFilter,
    rotated_at: i64,
}

/// Rotating current/previous Bloom filter pair, used for two independent
/// optimizations: negative idempotency-key lookups and ghost-task
/// elision during claim (spec §4.3).
pub struct RotatingBloom {
    inner: RwLock<Generations>,
    capacity: usize,
    fp_rate: f64,
    rotate_interval_secs: i64,
}

impl RotatingBloom {
    pub fn new(capacity: usize, fp_rate: f64, rotate_interval_secs: i64, now: i64) -> Self {
        Self {
            inner: RwLock::new(Generations {
                current: BloomFilter::new(capacity, fp_rate),
                previous: BloomFilter::new(capacity, fp_rate),
                rotated_at: now,
            }),
            capacity,
            fp_rate,
            rotate_interval_secs,
        }
    }

    /// Probe both generations. A `false` result is a hard guarantee of
    /// absence (no false negatives within a generation's lifetime); a
    /// `true` result may be a false positive, whose cost is bounded by the
    /// caller's fallback (an extra store round-trip or a wasted
    /// set-remove-and-retry).
    pub fn maybe_present(&self, item: &[u8]) -> bool {
        let g = self.inner.read().expect("bloom lock poisoned");
        g.current.contains(item) || g.previous.contains(item)
    }

    pub fn insert(&self, item: &[u8]) {
        let g = self.inner.read().expect("bloom lock poisoned");
        g.current.insert(item);
    }

    /// Rotate if the configured interval has elapsed since the last
    /// rotation. Pointer-swap only; held under a single write lock for
    /// the swap's duration.
    pub fn maybe_rotate(&self, now: i64) {
        let needs_rotation = {
            let g = self.inner.read().expect("bloom lock poisoned");
            now.saturating_sub(g.rotated_at) >= self.rotate_interval_secs
        };
        if !needs_rotation {
            return;
        }
        let mut g = self.inner.write().expect("bloom lock poisoned");
        // Re-check under the write lock: another caller may have already
        // rotated between our read check and acquiring the write lock.
        if now.saturating_sub(g.rotated_at) < self.rotate_interval_secs {
            return;
        }
        let fresh = BloomFilter::new(self.capacity, self.fp_rate);
        let promoted = std::mem::replace(&mut g.current, fresh);
        g.previous = promoted;
        g.rotated_at = now;
    }
}
