//! I/O engine abstraction and access planning
//!
//! An engine submits batches of block accesses against the workload file and
//! accounts their completions. Three strategies exist, one per kernel
//! interface:
//!
//! - **posix**: blocking `read`/`write`, exactly one request in flight
//! - **libaio**: kernel AIO with a fixed slot pool and dynamic iodepth
//! - **prwv2**: a thread pool issuing `preadv`/`pwritev2`
//!
//! The set is closed, so dispatch is a tagged enum rather than a trait
//! object: each variant carries its own very different state (nothing, an
//! AIO context, a thread pool) and only `make_requests` is hot.
//!
//! All engines pull their per-request decisions from one `AccessPlanner`,
//! which owns the pieces that must change together when the block size is
//! mutated at runtime.

pub mod controller;
pub mod libaio;
pub mod posix;
pub mod prwv2;

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::bitmap::Bitmap;
use crate::params::{EngineKind, EngineParams};
use crate::random::Randomizer;
use crate::stats::SharedStats;
use crate::Result;

pub use controller::EngineController;
pub use libaio::AioEngine;
pub use posix::PosixEngine;
pub use prwv2::PrwEngine;

/// One planned block access
///
/// Invariants: `size = block_size * 1024`, `offset` is a multiple of `size`
/// and `offset + size` never exceeds the file length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    /// Block size in KiB, for stats accounting
    pub block_size: u64,
    /// Transfer length in bytes
    pub size: usize,
    /// File offset in bytes
    pub offset: i64,
    pub write: bool,
    pub dsync: bool,
}

/// State that must be swapped as one unit when `block_size` changes.
struct PlannerState {
    block_size: u64,
    buffer_size: u64,
    file_blocks: u64,
    cur_block: u64,
    bitmap: Bitmap,
    rng: Randomizer,
}

/// Per-request access decisions, shared by every engine worker
///
/// `write` and `random` are bernoulli draws on the live ratios; the random
/// path asks the bitmap for an unused position near a uniform hint (keeping
/// concurrent random I/O off colliding offsets), the sequential path is
/// previous-plus-one with wrap-around.
pub struct AccessPlanner {
    params: Arc<EngineParams>,
    state: Mutex<PlannerState>,
}

impl AccessPlanner {
    pub fn new(params: Arc<EngineParams>) -> Result<Self> {
        let state = Self::build_state(&params, Randomizer::new())?;
        Ok(AccessPlanner {
            params,
            state: Mutex::new(state),
        })
    }

    fn build_state(params: &EngineParams, rng: Randomizer) -> Result<PlannerState> {
        let block_size = params.block_size();
        let buffer_size = block_size * 1024;
        let file_blocks = (params.filesize_mib() * 1024) / block_size;
        let bitmap = Bitmap::new(file_blocks, 0)?;
        Ok(PlannerState {
            block_size,
            buffer_size,
            file_blocks,
            // next sequential access starts at block 0
            cur_block: file_blocks.saturating_sub(1),
            bitmap,
            rng,
        })
    }

    /// Rebuild the planner tuple if the live block size diverged from it.
    /// Called by the controller thread once per tick.
    pub fn refresh_if_changed(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let live = self.params.block_size();
        if state.block_size == live {
            return Ok(());
        }
        debug!(
            "block size changed from {} to {}, rebuilding access state",
            state.block_size, live
        );
        let rng = std::mem::replace(&mut state.rng, Randomizer::with_seed(0));
        *state = Self::build_state(&self.params, rng)?;
        Ok(())
    }

    /// Plan the next access.
    pub fn next(&self) -> Result<AccessRequest> {
        let write_ratio = self.params.write_ratio();
        let random_ratio = self.params.random_ratio();
        let mut state = self.state.lock().unwrap();

        let write = state.rng.bernoulli(write_ratio);
        if state.rng.bernoulli(random_ratio) {
            let file_blocks = state.file_blocks;
            let hint = state.rng.uniform(file_blocks);
            state.cur_block = state.bitmap.next_unused(hint)?;
        } else {
            state.cur_block += 1;
            if state.cur_block >= state.file_blocks {
                state.cur_block = 0;
            }
        }

        Ok(AccessRequest {
            block_size: state.block_size,
            size: state.buffer_size as usize,
            offset: (state.cur_block * state.buffer_size) as i64,
            write,
            dsync: self.params.o_dsync,
        })
    }

    /// Positions currently marked used by the random path.
    pub fn used_positions(&self) -> u64 {
        self.state.lock().unwrap().bitmap.used()
    }
}

/// The closed set of engine implementations
pub enum IoEngine {
    Posix(PosixEngine),
    Libaio(AioEngine),
    Prwv2(PrwEngine),
}

impl IoEngine {
    pub fn new(
        kind: EngineKind,
        fd: RawFd,
        params: Arc<EngineParams>,
        planner: Arc<AccessPlanner>,
        stats: Arc<SharedStats>,
    ) -> Result<Self> {
        Ok(match kind {
            EngineKind::Posix => IoEngine::Posix(PosixEngine::new(fd, planner, stats)),
            EngineKind::Libaio => {
                IoEngine::Libaio(AioEngine::new(fd, params, planner, stats)?)
            }
            EngineKind::Prwv2 => IoEngine::Prwv2(PrwEngine::new(fd, params, planner, stats)),
        })
    }

    /// Submit and reap one batch of requests. Bounded: returns within
    /// roughly 200 ms even when nothing completes.
    pub fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        match self {
            IoEngine::Posix(e) => e.make_requests(stop),
            IoEngine::Libaio(e) => e.make_requests(stop),
            IoEngine::Prwv2(e) => e.make_requests(stop),
        }
    }

    /// Enter or leave pause. Paused engines park without holding the
    /// submission quota.
    pub fn set_wait(&mut self, value: bool) {
        if let IoEngine::Prwv2(e) = self {
            e.set_wait(value);
        }
        // posix and libaio pause implicitly: the controller stops calling
        // make_requests while waiting
    }

    pub fn is_multithreaded(&self) -> bool {
        matches!(self, IoEngine::Prwv2(_))
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    /// Zero-filled workload file of `mib` MiB opened read-write.
    pub fn open_test_file(mib: u64) -> (TempDir, File) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workload.dat");
        std::fs::write(&path, vec![0u8; (mib * 1024 * 1024) as usize]).unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (dir, file)
    }

    pub fn test_planner(
        filesize_mib: u64,
        block_size: u64,
        write_ratio: f64,
        random_ratio: f64,
    ) -> (Arc<EngineParams>, Arc<AccessPlanner>) {
        let params = crate::params::test_params(EngineKind::Posix);
        params.set_filesize_mib(filesize_mib);
        params.set_block_size(block_size);
        params.set_write_ratio(write_ratio);
        params.set_random_ratio(random_ratio);
        params.take_changed();
        let params = Arc::new(params);
        let planner = Arc::new(AccessPlanner::new(params.clone()).unwrap());
        (params, planner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;

    fn planner_with(filesize_mib: u64, block_size: u64, random_ratio: f64) -> AccessPlanner {
        let params = test_params(EngineKind::Posix);
        params.set_filesize_mib(filesize_mib);
        params.set_block_size(block_size);
        params.set_random_ratio(random_ratio);
        params.take_changed();
        AccessPlanner::new(Arc::new(params)).unwrap()
    }

    #[test]
    fn test_sequential_requests_are_contiguous() {
        let planner = planner_with(10, 4, 0.0);
        let first = planner.next().unwrap();
        let second = planner.next().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.offset + first.size as i64);
        assert_eq!(first.size, 4096);
    }

    #[test]
    fn test_sequential_wraps_at_file_end() {
        let planner = planner_with(10, 1024, 0.0);
        // 10 blocks of 1 MiB
        let mut last = 0;
        for _ in 0..10 {
            last = planner.next().unwrap().offset;
        }
        assert_eq!(last, 9 * 1024 * 1024);
        assert_eq!(planner.next().unwrap().offset, 0);
    }

    #[test]
    fn test_random_requests_stay_in_file() {
        let planner = planner_with(10, 4, 1.0);
        let file_size = 10 * 1024 * 1024;
        for _ in 0..500 {
            let req = planner.next().unwrap();
            assert!(req.offset >= 0);
            assert!(req.offset + req.size as i64 <= file_size);
            assert_eq!(req.offset % req.size as i64, 0);
        }
    }

    #[test]
    fn test_random_requests_do_not_collide() {
        let planner = planner_with(10, 1024, 1.0);
        // 10 blocks, threshold 9: within one generation no offset repeats
        let mut seen = std::collections::HashSet::new();
        for _ in 0..9 {
            let req = planner.next().unwrap();
            assert!(seen.insert(req.offset), "offset {} repeated", req.offset);
        }
        assert_eq!(planner.used_positions(), 9);
    }

    #[test]
    fn test_refresh_rebuilds_on_block_size_change() {
        let planner = planner_with(10, 4, 0.0);
        planner.next().unwrap();
        planner.params.set_block_size(8);
        planner.refresh_if_changed().unwrap();
        let req = planner.next().unwrap();
        assert_eq!(req.size, 8192);
        assert_eq!(req.offset, 0);
    }
}
