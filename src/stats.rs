//! I/O accounting
//!
//! `Stats` is a plain bundle of monotonic counters; the reporter keeps a
//! snapshot per interval and emits the componentwise delta. `SharedStats`
//! is the live, concurrently updated variant: relaxed atomics are exact for
//! pure counting and keep the multithreaded engines off any lock in the
//! completion path.

use std::ops::{AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter snapshot: block and KiB totals split by direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub blocks: u64,
    pub blocks_read: u64,
    pub blocks_write: u64,
    pub kb_read: u64,
    pub kb_write: u64,
}

impl Stats {
    /// The delta of one completed access of `block_size` KiB.
    pub fn for_access(write: bool, block_size_kib: u64) -> Stats {
        Stats {
            blocks: 1,
            blocks_read: if write { 0 } else { 1 },
            blocks_write: if write { 1 } else { 0 },
            kb_read: if write { 0 } else { block_size_kib },
            kb_write: if write { block_size_kib } else { 0 },
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        self.blocks += rhs.blocks;
        self.blocks_read += rhs.blocks_read;
        self.blocks_write += rhs.blocks_write;
        self.kb_read += rhs.kb_read;
        self.kb_write += rhs.kb_write;
    }
}

impl Sub for Stats {
    type Output = Stats;

    fn sub(self, rhs: Stats) -> Stats {
        Stats {
            blocks: self.blocks - rhs.blocks,
            blocks_read: self.blocks_read - rhs.blocks_read,
            blocks_write: self.blocks_write - rhs.blocks_write,
            kb_read: self.kb_read - rhs.kb_read,
            kb_write: self.kb_write - rhs.kb_write,
        }
    }
}

/// Live counters shared between the engine (writers) and reporter (reader)
#[derive(Debug, Default)]
pub struct SharedStats {
    blocks: AtomicU64,
    blocks_read: AtomicU64,
    blocks_write: AtomicU64,
    kb_read: AtomicU64,
    kb_write: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, delta: &Stats) {
        self.blocks.fetch_add(delta.blocks, Ordering::Relaxed);
        self.blocks_read
            .fetch_add(delta.blocks_read, Ordering::Relaxed);
        self.blocks_write
            .fetch_add(delta.blocks_write, Ordering::Relaxed);
        self.kb_read.fetch_add(delta.kb_read, Ordering::Relaxed);
        self.kb_write.fetch_add(delta.kb_write, Ordering::Relaxed);
    }

    #[inline]
    pub fn blocks_write(&self) -> u64 {
        self.blocks_write.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            blocks: self.blocks.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_write: self.blocks_write.load(Ordering::Relaxed),
            kb_read: self.kb_read.load(Ordering::Relaxed),
            kb_write: self.kb_write.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_access_read() {
        let s = Stats::for_access(false, 4);
        assert_eq!(s.blocks, 1);
        assert_eq!(s.blocks_read, 1);
        assert_eq!(s.blocks_write, 0);
        assert_eq!(s.kb_read, 4);
        assert_eq!(s.kb_write, 0);
    }

    #[test]
    fn test_for_access_write() {
        let s = Stats::for_access(true, 16);
        assert_eq!(s.blocks_write, 1);
        assert_eq!(s.kb_write, 16);
        assert_eq!(s.kb_read, 0);
    }

    #[test]
    fn test_add_and_delta() {
        let mut total = Stats::default();
        total += Stats::for_access(false, 4);
        total += Stats::for_access(true, 4);
        total += Stats::for_access(true, 4);

        let earlier = Stats::for_access(false, 4);
        let delta = total - earlier;
        assert_eq!(delta.blocks, 2);
        assert_eq!(delta.blocks_read, 0);
        assert_eq!(delta.blocks_write, 2);
        assert_eq!(delta.kb_write, 8);
    }

    #[test]
    fn test_shared_stats_accumulates_exactly() {
        let shared = SharedStats::new();
        for _ in 0..100 {
            shared.add(&Stats::for_access(false, 8));
        }
        for _ in 0..50 {
            shared.add(&Stats::for_access(true, 8));
        }
        let snap = shared.snapshot();
        assert_eq!(snap.blocks, 150);
        assert_eq!(snap.blocks_read, 100);
        assert_eq!(snap.blocks_write, 50);
        assert_eq!(snap.kb_read, 800);
        assert_eq!(snap.kb_write, 400);
    }
}
