//! Thread-pool engine issuing preadv/pwritev2
//!
//! Spawns `MAX_IODEPTH` workers up front. A worker whose index is below the
//! live iodepth pulls one planned request, performs it and accounts it; the
//! rest sleep. Raising or lowering iodepth therefore takes effect without
//! spawning or joining anything. Writes pass `RWF_DSYNC` per request when
//! dsync is configured.
//!
//! The controller-side `make_requests` is a 200 ms pacing sleep plus the
//! rethrow point for the first error any worker captured.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error};

use super::AccessPlanner;
use crate::params::{EngineParams, MAX_IODEPTH};
use crate::random::Randomizer;
use crate::stats::{SharedStats, Stats};
use crate::util::buffer::{AlignedBuffer, DIRECT_IO_ALIGNMENT};
use crate::Result;

struct PrwShared {
    fd: RawFd,
    stop: AtomicBool,
    wait: AtomicBool,
    params: Arc<EngineParams>,
    planner: Arc<AccessPlanner>,
    stats: Arc<SharedStats>,
    failure: Mutex<Option<anyhow::Error>>,
}

impl PrwShared {
    fn record_failure(&self, err: anyhow::Error) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

pub struct PrwEngine {
    shared: Arc<PrwShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl PrwEngine {
    pub fn new(
        fd: RawFd,
        params: Arc<EngineParams>,
        planner: Arc<AccessPlanner>,
        stats: Arc<SharedStats>,
    ) -> Self {
        let shared = Arc::new(PrwShared {
            fd,
            stop: AtomicBool::new(false),
            wait: AtomicBool::new(params.wait()),
            params,
            planner,
            stats,
            failure: Mutex::new(None),
        });

        let threads = (0..MAX_IODEPTH as usize)
            .map(|pos| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("prwv2-{}", pos))
                    .spawn(move || worker_thread(shared, pos))
                    .expect("failed to spawn prwv2 worker")
            })
            .collect();

        PrwEngine { shared, threads }
    }

    pub fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        if let Some(err) = self.shared.failure.lock().unwrap().take() {
            self.shared.stop.store(true, Ordering::Relaxed);
            return Err(err);
        }

        if stop.load(Ordering::Relaxed) {
            self.shared.stop.store(true, Ordering::Relaxed);
            return Ok(());
        }
        self.shared.wait.store(false, Ordering::Relaxed);

        thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    pub fn set_wait(&mut self, value: bool) {
        self.shared.wait.store(value, Ordering::Relaxed);
    }
}

impl Drop for PrwEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_thread(shared: Arc<PrwShared>, pos: usize) {
    let mut rng = Randomizer::new();
    let mut buffer: Option<AlignedBuffer> = None;
    let mut cur_size = 0usize;
    let mut wrote = false;

    while !shared.stop.load(Ordering::Relaxed) {
        if shared.wait.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
            continue;
        }

        if pos >= shared.params.iodepth() as usize {
            thread::sleep(Duration::from_millis(500));
            continue;
        }

        let req = match shared.planner.next() {
            Ok(req) => req,
            Err(err) => {
                shared.record_failure(err);
                break;
            }
        };

        if cur_size != req.size {
            debug!(
                "worker[{}] request size changed from {} to {}",
                pos, cur_size, req.size
            );
            cur_size = req.size;
            let mut fresh = AlignedBuffer::new(req.size, DIRECT_IO_ALIGNMENT);
            rng.fill(fresh.as_mut_slice());
            buffer = Some(fresh);
        } else if req.write && wrote {
            let buf = buffer.as_mut().expect("buffer allocated");
            rng.refresh(buf.as_mut_slice(), 20);
        }
        wrote = req.write;

        let buf = buffer.as_mut().expect("buffer allocated");
        let iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: cur_size,
        };
        let ret = if req.write {
            let flags = if req.dsync { libc::RWF_DSYNC } else { 0 };
            unsafe { libc::pwritev2(shared.fd, &iov, 1, req.offset, flags) }
        } else {
            unsafe { libc::preadv(shared.fd, &iov, 1, req.offset) }
        };

        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        if ret > 0 {
            shared
                .stats
                .add(&Stats::for_access(req.write, req.block_size));
        } else if ret == 0 {
            error!("worker[{}] read/write returned zero", pos);
        } else {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => {
                    shared.record_failure(anyhow::Error::new(err).context(format!(
                        "worker[{}] {} error at offset {}",
                        pos,
                        if req.write { "write" } else { "read" },
                        req.offset
                    )));
                    break;
                }
            }
        }
    }
}
