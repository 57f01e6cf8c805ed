// Seeded pseudo-random generator for segment fabrication.
//
// xoshiro256++ (Blackman & Vigna, 2019) expanded from a single `u64` seed with
// SplitMix64. Every random decision the engine makes goes through a `FabRng`
// value that the caller owns and hands down explicitly: selection bag draws,
// delta-arc shuffles, mute rolls, sticky-bun values, and the identifiers of
// test fixtures. There is no process-wide generator anywhere in the workspace.
//
// Two fabrication runs that start from the same seed and the same content make
// the same choices, which is what lets the engine tests assert on exact
// outcomes. Production callers seed from wherever they like; reproducibility
// across runs is not promised by the engine itself (sticky buns are the
// mechanism for that).
//
// See also: `fabrica_engine::bag` (the main consumer), `fabrica_engine::ids`
// for `ContentUuid::new_v4`, `fabrica_music::sticky_bun`.
//
// **Critical constraint: portability.** The integer core must produce the
// same stream on every platform. Floating point only appears in the derived
// helpers (`next_f64`, `zero_to_limit`), never in the state update.

use serde::{Deserialize, Serialize};

/// xoshiro256++ state. Cheap to clone; `fork` derives an independent stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabRng {
    s: [u64; 4],
}

impl FabRng {
    /// Seed a generator. Equal seeds give equal streams.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        let s = [
            splitmix64(&mut sm),
            splitmix64(&mut sm),
            splitmix64(&mut sm),
            splitmix64(&mut sm),
        ];
        Self { s }
    }

    /// Derive a child generator whose stream does not overlap the parent's
    /// in practice. The parent advances by one draw.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    pub fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = self.s;
        let out = s0.wrapping_add(s3).rotate_left(23).wrapping_add(s0);
        let t = s1 << 17;
        let mut n = [s0, s1, s2 ^ s0, s3 ^ s1];
        n[1] ^= n[2];
        n[0] ^= n[3];
        n[2] ^= t;
        n[3] = n[3].rotate_left(45);
        self.s = n;
        out
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform `f64` in [0, 1) built from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Sixteen random bytes, the raw material for a v4 identifier.
    pub fn next_128_bits(&mut self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.next_u64().to_le_bytes());
        out[8..].copy_from_slice(&self.next_u64().to_le_bytes());
        out
    }

    /// Uniform integer in `[low, high)`, rejection sampled so small ranges
    /// carry no modulo bias. An empty range yields `low`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let span = high - low;
        if span.is_power_of_two() {
            return low + (self.next_u64() & (span - 1));
        }
        let zone = span.wrapping_neg() % span;
        loop {
            let r = self.next_u64();
            if r >= zone {
                return low + r % span;
            }
        }
    }

    /// Uniform index in `[low, high)`. An empty range yields `low`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// Uniform real in `[0, limit)`; zero when `limit` is not positive.
    pub fn zero_to_limit(&mut self, limit: f64) -> f64 {
        if limit <= 0.0 {
            return 0.0;
        }
        self.next_f64() * limit
    }

    /// `true` with probability `p`. `p <= 0` never fires, `p >= 1` always does.
    pub fn random_bool(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// In-place Fisher–Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_usize(0, i + 1);
            items.swap(i, j);
        }
    }

    /// A uniformly chosen element, or `None` for an empty slice.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let i = self.range_usize(0, items.len());
        items.get(i)
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = FabRng::new(7);
        let mut b = FabRng::new(7);
        for _ in 0..500 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn fork_diverges_from_parent() {
        let mut parent = FabRng::new(99);
        let mut child = parent.fork();
        assert_ne!(parent.next_u64(), child.next_u64());
    }

    #[test]
    fn range_u64_stays_in_bounds() {
        let mut rng = FabRng::new(3);
        for _ in 0..10_000 {
            let v = rng.range_u64(10, 17);
            assert!((10..17).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn empty_range_yields_low() {
        let mut rng = FabRng::new(3);
        assert_eq!(rng.range_u64(5, 5), 5);
        assert_eq!(rng.range_usize(9, 2), 9);
        assert_eq!(rng.zero_to_limit(0.0), 0.0);
        assert_eq!(rng.zero_to_limit(-3.0), 0.0);
    }

    #[test]
    fn range_covers_every_value() {
        let mut rng = FabRng::new(11);
        let mut seen = [false; 6];
        for _ in 0..2_000 {
            seen[rng.range_usize(0, 6)] = true;
        }
        assert!(seen.iter().all(|s| *s), "some values never drawn: {seen:?}");
    }

    #[test]
    fn f64_in_unit_interval() {
        let mut rng = FabRng::new(12345);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "f64 out of range: {v}");
        }
    }

    #[test]
    fn random_bool_extremes() {
        let mut rng = FabRng::new(1);
        for _ in 0..1_000 {
            assert!(!rng.random_bool(0.0));
            assert!(rng.random_bool(1.0));
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = FabRng::new(2024);
        let mut items: Vec<u32> = (0..50).collect();
        rng.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(items, sorted, "50 items should not shuffle to identity");
    }

    #[test]
    fn choose_from_empty_is_none() {
        let mut rng = FabRng::new(5);
        let empty: [u8; 0] = [];
        assert!(rng.choose(&empty).is_none());
        assert_eq!(rng.choose(&[42]), Some(&42));
    }

    #[test]
    fn serde_round_trip_preserves_stream() {
        let mut rng = FabRng::new(77);
        rng.next_u64();
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: FabRng = serde_json::from_str(&json).unwrap();
        assert_eq!(rng.next_u64(), restored.next_u64());
    }
}
