//! Blocking POSIX engine
//!
//! The baseline engine: one buffer, one request in flight, plain
//! `read`/`write` after an `lseek` that is only issued when the next offset
//! is not contiguous with the previous transfer. Requires `iodepth == 1`.
//! Any syscall failure surfaces immediately.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use log::debug;

use super::AccessPlanner;
use crate::random::Randomizer;
use crate::stats::{SharedStats, Stats};
use crate::util::buffer::{AlignedBuffer, DIRECT_IO_ALIGNMENT};
use crate::Result;

pub struct PosixEngine {
    fd: RawFd,
    planner: Arc<AccessPlanner>,
    stats: Arc<SharedStats>,
    rng: Randomizer,
    buffer: Option<AlignedBuffer>,
    cur_size: usize,
    cur_offset: i64,
    cur_write: bool,
}

impl PosixEngine {
    pub fn new(fd: RawFd, planner: Arc<AccessPlanner>, stats: Arc<SharedStats>) -> Self {
        PosixEngine {
            fd,
            planner,
            stats,
            rng: Randomizer::new(),
            buffer: None,
            cur_size: 0,
            cur_offset: 0,
            cur_write: false,
        }
    }

    pub fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let req = self.planner.next()?;

        if self.cur_size != req.size {
            debug!("request size changed from {} to {}", self.cur_size, req.size);
            self.cur_size = req.size;
            let mut buffer = AlignedBuffer::new(req.size, DIRECT_IO_ALIGNMENT);
            self.rng.fill(buffer.as_mut_slice());
            self.buffer = Some(buffer);
        } else if req.write && self.cur_write {
            // repeated write: perturb ~5% so content is not identical
            let buffer = self.buffer.as_mut().expect("buffer allocated");
            self.rng.refresh(buffer.as_mut_slice(), 20);
        }

        let delta = Stats::for_access(req.write, req.block_size);

        if self.cur_offset + self.cur_size as i64 != req.offset {
            let rc = unsafe { libc::lseek(self.fd, req.offset, libc::SEEK_SET) };
            if rc == -1 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("seek error at offset {}", req.offset));
            }
        }
        self.cur_offset = req.offset;
        self.cur_write = req.write;

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let buffer = self.buffer.as_mut().expect("buffer allocated");
        let rc = if req.write {
            unsafe {
                libc::write(
                    self.fd,
                    buffer.as_ptr() as *const libc::c_void,
                    self.cur_size,
                )
            }
        } else {
            unsafe {
                libc::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    self.cur_size,
                )
            }
        };
        if rc == -1 {
            let kind = if req.write { "write" } else { "read" };
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("{} error at offset {}", kind, req.offset));
        }

        self.stats.add(&delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests_support::{open_test_file, test_planner};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_posix_sequential_reads_account_blocks() {
        let (dir, file) = open_test_file(10);
        let (params, planner) = test_planner(10, 4, 0.0, 0.0);
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine = PosixEngine::new(file.as_raw_fd(), planner, stats.clone());
        for _ in 0..16 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.blocks, 16);
        assert_eq!(snap.blocks_read, 16);
        assert_eq!(snap.blocks_write, 0);
        assert_eq!(snap.kb_read, 64);
        drop(params);
        drop(dir);
    }

    #[test]
    fn test_posix_writes_account_blocks() {
        let (dir, file) = open_test_file(10);
        let (_params, planner) = test_planner(10, 4, 1.0, 0.0);
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine = PosixEngine::new(file.as_raw_fd(), planner, stats.clone());
        for _ in 0..8 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_write, 8);
        assert_eq!(snap.kb_write, 32);
        drop(dir);
    }

    #[test]
    fn test_posix_stop_flag_is_honored() {
        let (dir, file) = open_test_file(10);
        let (_params, planner) = test_planner(10, 4, 0.0, 0.0);
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(true);

        let mut engine = PosixEngine::new(file.as_raw_fd(), planner, stats.clone());
        engine.make_requests(&stop).unwrap();
        assert_eq!(stats.snapshot().blocks, 0);
        drop(dir);
    }

    #[test]
    fn test_posix_bad_fd_fails() {
        let (_params, planner) = test_planner(10, 4, 0.0, 0.0);
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine = PosixEngine::new(-1, planner, stats);
        assert!(engine.make_requests(&stop).is_err());
    }
}
