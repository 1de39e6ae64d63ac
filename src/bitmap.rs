//! Used-block bitmap for the random access path
//!
//! Random offsets must not collide with I/O still in flight on the same
//! offset, so every block position handed out is marked used and stays used
//! until the map reaches its fill threshold, at which point a new generation
//! starts from an empty map. Lookups have locality: the search begins at the
//! caller's hint and advances word by word with wrap-around.

use anyhow::bail;
use log::{debug, info};

use crate::Result;

const MIN_SIZE: u64 = 10;
const WORD_BITS: u64 = 64;
// 1 Gbit of positions; the map itself then costs at most ~128 MiB.
const MAX_MEMORY_BYTES: u64 = 1_000_000_000 / 8;

pub struct Bitmap {
    size: u64,
    words: Vec<u64>,
    /// Valid bits in the trailing word; `WORD_BITS` when `size % 64 == 0`.
    last_word_bits: u64,
    used: u64,
    collisions: u64,
    used_threshold: u64,
}

impl Bitmap {
    /// Create a map of `size` positions, all unused.
    ///
    /// `used_threshold` of 0 selects the default of 90% of `size`. Fails
    /// with an invalid-argument error when `size < 10`, when the threshold
    /// is out of `[10, size]`, or when the map would exceed the memory cap.
    pub fn new(size: u64, used_threshold: u64) -> Result<Self> {
        if size < MIN_SIZE {
            bail!("invalid bitmap size {} (must be >= {})", size, MIN_SIZE);
        }

        let word_count = (size + WORD_BITS - 1) / WORD_BITS;
        if word_count * 8 > MAX_MEMORY_BYTES {
            bail!(
                "bitmap would require {}MiB (the maximum is {}MiB)",
                (word_count * 8) / (1024 * 1024),
                MAX_MEMORY_BYTES / (1024 * 1024)
            );
        }

        let threshold = if used_threshold == 0 {
            size - size / 10
        } else if used_threshold >= MIN_SIZE && used_threshold <= size {
            used_threshold
        } else {
            bail!(
                "invalid used_threshold={} (must be >= {} and <= size={})",
                used_threshold,
                MIN_SIZE,
                size
            );
        };

        let last_word_bits = match size % WORD_BITS {
            0 => WORD_BITS,
            rem => rem,
        };
        debug!(
            "bitmap: size={}, words={}, last_word_bits={}, used_threshold={}",
            size, word_count, last_word_bits, threshold
        );

        Ok(Bitmap {
            size,
            words: vec![0u64; word_count as usize],
            last_word_bits,
            used: 0,
            collisions: 0,
            used_threshold: threshold,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Reset to an empty generation.
    pub fn clear(&mut self) {
        info!(
            "cleaning bitmap (used={}, collisions={})",
            self.used, self.collisions
        );
        self.used = 0;
        self.collisions = 0;
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Mask of the valid bits in word `idx`. All-ones for every word except
    /// a partially used trailing word.
    fn full_mask(&self, idx: usize) -> u64 {
        if idx + 1 < self.words.len() || self.last_word_bits == WORD_BITS {
            u64::MAX
        } else {
            (1u64 << self.last_word_bits) - 1
        }
    }

    /// Return an unused position near `hint` and mark it used.
    ///
    /// When the fill already reached the threshold the map is cleared first,
    /// then the request is serviced against the fresh generation. `hint`
    /// itself is returned when free; otherwise the lowest free bit of its
    /// word wins, and a fully set word advances the search to the next word
    /// modulo the word count. One collision is counted whenever the first
    /// probed bit was taken.
    pub fn next_unused(&mut self, hint: u64) -> Result<u64> {
        if hint >= self.size {
            bail!(
                "bit position {} is out of range (0-{})",
                hint,
                self.size - 1
            );
        }

        if self.used >= self.used_threshold {
            self.clear();
        }

        let mut word_idx = (hint / WORD_BITS) as usize;
        let mut bit = hint % WORD_BITS;
        let mut collided = false;

        loop {
            let mask = self.full_mask(word_idx);
            let bits = self.words[word_idx];
            if bits != mask {
                if bits & (1u64 << bit) != 0 {
                    // hint taken: lowest free bit of the word wins
                    collided = true;
                    bit = (!bits & mask).trailing_zeros() as u64;
                }
                self.words[word_idx] |= 1u64 << bit;
                self.used += 1;
                if collided {
                    self.collisions += 1;
                }
                let pos = word_idx as u64 * WORD_BITS + bit;
                debug_assert!(pos < self.size);
                return Ok(pos);
            }
            collided = true;
            word_idx = (word_idx + 1) % self.words.len();
            bit = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_small_size() {
        assert!(Bitmap::new(9, 0).is_err());
        assert!(Bitmap::new(10, 0).is_ok());
    }

    #[test]
    fn test_rejects_bad_threshold() {
        assert!(Bitmap::new(100, 5).is_err());
        assert!(Bitmap::new(100, 101).is_err());
        assert!(Bitmap::new(100, 100).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_hint() {
        let mut map = Bitmap::new(10, 0).unwrap();
        assert!(map.next_unused(10).is_err());
    }

    #[test]
    fn test_hint_returned_when_free() {
        let mut map = Bitmap::new(128, 0).unwrap();
        assert_eq!(map.next_unused(37).unwrap(), 37);
        assert_eq!(map.used(), 1);
        assert_eq!(map.collisions(), 0);
    }

    #[test]
    fn test_collision_picks_lowest_free_bit() {
        let mut map = Bitmap::new(128, 0).unwrap();
        assert_eq!(map.next_unused(5).unwrap(), 5);
        let next = map.next_unused(5).unwrap();
        assert_eq!(next, 0);
        assert_eq!(map.collisions(), 1);
    }

    #[test]
    fn test_full_word_advances_to_next() {
        let mut map = Bitmap::new(130, 130).unwrap();
        for i in 0..64 {
            assert_eq!(map.next_unused(i).unwrap(), i);
        }
        // word 0 is full: the search must move into word 1
        let pos = map.next_unused(3).unwrap();
        assert_eq!(pos, 64);
    }

    #[test]
    fn test_never_returns_used_position() {
        let mut map = Bitmap::new(100, 100).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let pos = map.next_unused(42).unwrap();
            assert!(seen.insert(pos), "position {} returned twice", pos);
        }
        assert_eq!(map.used(), 100);
    }

    #[test]
    fn test_auto_clear_at_threshold() {
        let mut map = Bitmap::new(20, 10).unwrap();
        for _ in 0..10 {
            map.next_unused(0).unwrap();
        }
        assert_eq!(map.used(), 10);
        // threshold reached: this request runs against a fresh generation
        let pos = map.next_unused(0).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(map.used(), 1);
    }

    #[test]
    fn test_clear_makes_all_positions_available() {
        let mut map = Bitmap::new(64, 64).unwrap();
        for _ in 0..64 {
            map.next_unused(0).unwrap();
        }
        map.clear();
        assert_eq!(map.used(), 0);
        assert_eq!(map.next_unused(63).unwrap(), 63);
    }

    #[test]
    fn test_size_exact_multiple_of_word() {
        // trailing word mask must be all-ones, not zero
        let mut map = Bitmap::new(128, 128).unwrap();
        for i in 64..128 {
            assert_eq!(map.next_unused(i).unwrap(), i);
        }
        // trailing word now full; hint there must wrap to word 0
        let pos = map.next_unused(100).unwrap();
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_wraps_around_last_word() {
        let mut map = Bitmap::new(70, 70).unwrap();
        for i in 64..70 {
            assert_eq!(map.next_unused(i).unwrap(), i);
        }
        // positions 64..70 used; a hint in the trailing word wraps to word 0
        assert_eq!(map.next_unused(65).unwrap(), 0);
    }
}
