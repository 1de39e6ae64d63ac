//! Seeded randomness for access decisions and write payloads
//!
//! One `Randomizer` per owner (planner state, engine slot, worker thread).
//! Uses xoshiro256++ like the rest of the crate's hot paths; its statistical
//! quality is more than enough for load generation and it costs a handful of
//! cycles per draw.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Resolution of the bernoulli draws: ratios are effectively quantized to
/// multiples of 1/1024.
pub const RATIO_PRECISION: u32 = 1024;

pub struct Randomizer {
    rng: Xoshiro256PlusPlus,
}

impl Randomizer {
    pub fn new() -> Self {
        Randomizer {
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(seed: u64) -> Self {
        Randomizer {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// True with probability `ratio` (clamped to [0,1] by its callers).
    #[inline]
    pub fn bernoulli(&mut self, ratio: f64) -> bool {
        self.rng.gen_range(0..RATIO_PRECISION) < (ratio * RATIO_PRECISION as f64) as u32
    }

    /// Uniform draw from `[0, upper)`; 0 when `upper` is 0.
    #[inline]
    pub fn uniform(&mut self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        self.rng.gen_range(0..upper)
    }

    /// Overwrite the whole buffer with random 64-bit words.
    pub fn fill(&mut self, buffer: &mut [u8]) {
        self.refresh(buffer, 1);
    }

    /// Overwrite every `step`-th 64-bit word, starting at a random lane.
    ///
    /// Used before rewriting a buffer that was just written, so repeated
    /// writes do not land byte-identical content: step 20 perturbs ~5% of
    /// the payload.
    pub fn refresh(&mut self, buffer: &mut [u8], step: usize) {
        assert!(step > 0);
        let words = buffer.len() / 8;
        let first = if step > 1 {
            self.rng.gen_range(0..step)
        } else {
            0
        };
        let mut i = first;
        while i < words {
            let value: u64 = self.rng.gen();
            buffer[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
            i += step;
        }
    }
}

impl Default for Randomizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bernoulli_extremes() {
        let mut rnd = Randomizer::with_seed(1);
        for _ in 0..1000 {
            assert!(!rnd.bernoulli(0.0));
            assert!(rnd.bernoulli(1.0));
        }
    }

    #[test]
    fn test_bernoulli_ratio() {
        let mut rnd = Randomizer::with_seed(2);
        let hits = (0..10_000).filter(|_| rnd.bernoulli(0.25)).count();
        assert!((2000..3000).contains(&hits), "hits = {}", hits);
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rnd = Randomizer::with_seed(3);
        assert_eq!(rnd.uniform(0), 0);
        for _ in 0..1000 {
            assert!(rnd.uniform(17) < 17);
        }
    }

    #[test]
    fn test_fill_changes_whole_buffer() {
        let mut rnd = Randomizer::with_seed(4);
        let mut buf = vec![0u8; 4096];
        rnd.fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
        // every word lane should have been touched at least somewhere
        let untouched = buf.chunks(8).filter(|w| w.iter().all(|&b| b == 0)).count();
        assert!(untouched < 4, "untouched words = {}", untouched);
    }

    #[test]
    fn test_refresh_touches_sparse_words() {
        let mut rnd = Randomizer::with_seed(5);
        let mut buf = vec![0u8; 4096];
        rnd.refresh(&mut buf, 20);
        let touched = buf.chunks(8).filter(|w| w.iter().any(|&b| b != 0)).count();
        // 512 words, one in twenty rewritten
        assert!((20..=30).contains(&touched), "touched = {}", touched);
    }
}
