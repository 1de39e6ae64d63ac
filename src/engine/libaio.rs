//! Kernel AIO engine
//!
//! Owns one AIO context sized to `MAX_IODEPTH` and a pool of as many request
//! slots. Each tick submits a request for every inactive slot below the live
//! iodepth, then reaps completions for up to 200 ms. A reaped slot is
//! resubmitted immediately only while its index is still below the live
//! iodepth, which is how a shrinking iodepth drains the excess slots.
//!
//! Uses direct syscalls via libc rather than a binding crate; the control
//! block layout matches the kernel ABI on little-endian targets.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use log::{debug, error, info, warn};

use super::{AccessPlanner, AccessRequest};
use crate::params::{EngineParams, MAX_IODEPTH};
use crate::random::Randomizer;
use crate::stats::{SharedStats, Stats};
use crate::util::buffer::{AlignedBuffer, DIRECT_IO_ALIGNMENT};
use crate::Result;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel `struct iocb` (little-endian field order)
#[repr(C)]
#[derive(Clone, Copy)]
struct Iocb {
    data: u64,
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

/// Kernel `struct io_event`
#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(nr_events: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(libc::SYS_io_destroy, ctx) as libc::c_int
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut Iocb) -> libc::c_int {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout) as libc::c_int
}

/// One submission slot: its control block, payload buffer and the stats
/// delta to account when the in-flight request completes.
struct AioSlot {
    active: bool,
    write: bool,
    iocb: Iocb,
    stats: Stats,
    size: usize,
    offset: i64,
    buffer: Option<AlignedBuffer>,
}

impl AioSlot {
    fn new() -> Self {
        AioSlot {
            active: false,
            write: false,
            iocb: unsafe { MaybeUninit::zeroed().assume_init() },
            stats: Stats::default(),
            size: 0,
            offset: 0,
            buffer: None,
        }
    }
}

pub struct AioEngine {
    fd: RawFd,
    ctx: AioContext,
    params: Arc<EngineParams>,
    planner: Arc<AccessPlanner>,
    stats: Arc<SharedStats>,
    rng: Randomizer,
    slots: Vec<AioSlot>,
    events: Vec<IoEvent>,
}

impl AioEngine {
    pub fn new(
        fd: RawFd,
        params: Arc<EngineParams>,
        planner: Arc<AccessPlanner>,
        stats: Arc<SharedStats>,
    ) -> Result<Self> {
        let mut ctx: AioContext = 0;
        let rc = unsafe { io_setup(MAX_IODEPTH as libc::c_int, &mut ctx) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_setup failed with nr_events={}", MAX_IODEPTH));
        }

        let slots = (0..MAX_IODEPTH).map(|_| AioSlot::new()).collect();
        let events = vec![unsafe { MaybeUninit::zeroed().assume_init() }; MAX_IODEPTH as usize];

        Ok(AioEngine {
            fd,
            ctx,
            params,
            planner,
            stats,
            rng: Randomizer::new(),
            slots,
            events,
        })
    }

    /// Build and submit one request on slot `pos`. Returns whether the
    /// submission went in; `0`, `EAGAIN` and `EINTR` are warnings and the
    /// slot simply retries next tick.
    fn submit_slot(&mut self, pos: usize) -> Result<bool> {
        debug_assert!(!self.slots[pos].active);

        let req: AccessRequest = self.planner.next()?;
        let slot = &mut self.slots[pos];

        if slot.size != req.size {
            debug!(
                "slot[{}] request size changed from {} to {}",
                pos, slot.size, req.size
            );
            slot.size = req.size;
            let mut buffer = AlignedBuffer::new(req.size, DIRECT_IO_ALIGNMENT);
            self.rng.fill(buffer.as_mut_slice());
            slot.buffer = Some(buffer);
        } else if req.write && slot.write {
            let buffer = slot.buffer.as_mut().expect("buffer allocated");
            self.rng.refresh(buffer.as_mut_slice(), 20);
        }

        slot.stats = Stats::for_access(req.write, req.block_size);
        slot.write = req.write;
        slot.offset = req.offset;

        let buffer = slot.buffer.as_mut().expect("buffer allocated");
        slot.iocb = Iocb {
            data: pos as u64,
            key: 0,
            aio_rw_flags: if req.write && req.dsync {
                libc::RWF_DSYNC as u32
            } else {
                0
            },
            lio_opcode: if req.write {
                IOCB_CMD_PWRITE
            } else {
                IOCB_CMD_PREAD
            },
            aio_reqprio: 0,
            aio_fildes: self.fd as u32,
            buf: buffer.as_mut_ptr() as u64,
            nbytes: req.size as u64,
            offset: req.offset,
            aio_reserved2: 0,
            flags: 0,
            aio_resfd: 0,
        };

        let mut iocb_ptr = &mut slot.iocb as *mut Iocb;
        let rc = unsafe { io_submit(self.ctx, 1, &mut iocb_ptr) };
        if rc == 1 {
            slot.active = true;
            return Ok(true);
        }
        if rc == 0 {
            warn!("aio submit returned 0");
            return Ok(false);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {
                warn!("aio submit returned {}", err);
                Ok(false)
            }
            _ => Err(err).context("failed to submit the aio request"),
        }
    }

    pub fn make_requests(&mut self, stop: &AtomicBool) -> Result<()> {
        let iodepth = self.params.iodepth().min(MAX_IODEPTH) as usize;

        for pos in 0..iodepth {
            if !self.slots[pos].active {
                self.submit_slot(pos)?;
            }
        }

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 200 * 1000 * 1000,
        };
        let nevents = unsafe {
            io_getevents(
                self.ctx,
                1,
                MAX_IODEPTH as libc::c_long,
                self.events.as_mut_ptr(),
                &mut timeout,
            )
        };

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        if nevents < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {
                    warn!("io_getevents returned {}", err);
                    Ok(())
                }
                _ => Err(err).context("io_getevents failed"),
            };
        }

        let mut sum = Stats::default();
        for i in 0..nevents as usize {
            let event = self.events[i];
            let pos = event.data as usize;
            debug_assert!(pos < MAX_IODEPTH as usize);
            self.slots[pos].active = false;

            if event.res < 0 {
                let errno = (-event.res) as i32;
                if errno == libc::EAGAIN || errno == libc::EINTR {
                    warn!(
                        "aio completion on slot[{}] returned {}",
                        pos,
                        std::io::Error::from_raw_os_error(errno)
                    );
                } else {
                    bail!(
                        "aio request on slot[{}] failed at offset {}: {}",
                        pos,
                        self.slots[pos].offset,
                        std::io::Error::from_raw_os_error(errno)
                    );
                }
            } else {
                sum += self.slots[pos].stats;
            }

            if pos < iodepth {
                self.submit_slot(pos)?;
            }
        }
        if sum.blocks > 0 {
            self.stats.add(&sum);
        }
        Ok(())
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        let active = self.slots.iter().filter(|s| s.active).count();
        if active > 0 {
            info!("waiting for {} pending aio requests", active);
            let mut timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: 300 * 1000 * 1000,
            };
            let rc = unsafe {
                io_getevents(
                    self.ctx,
                    active as libc::c_long,
                    MAX_IODEPTH as libc::c_long,
                    self.events.as_mut_ptr(),
                    &mut timeout,
                )
            };
            if rc < 0 {
                error!(
                    "io_getevents returned {} while draining",
                    std::io::Error::last_os_error()
                );
            } else {
                for i in 0..rc as usize {
                    let pos = self.events[i].data as usize;
                    if pos < self.slots.len() {
                        self.slots[pos].active = false;
                    }
                }
            }
            for (pos, slot) in self.slots.iter().enumerate() {
                if slot.active {
                    warn!("aio slot[{}] is still active, abandoning it", pos);
                }
            }
        }

        let rc = unsafe { io_destroy(self.ctx) };
        if rc < 0 {
            error!("io_destroy returned {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests_support::{open_test_file, test_planner};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_aio_setup_and_teardown() {
        let (dir, file) = open_test_file(10);
        let (params, planner) = test_planner(10, 4, 0.0, 0.0);
        let stats = Arc::new(SharedStats::new());
        let engine = AioEngine::new(file.as_raw_fd(), params, planner, stats);
        assert!(engine.is_ok());
        drop(engine);
        drop(dir);
    }

    #[test]
    fn test_aio_reads_account_blocks() {
        let (dir, file) = open_test_file(10);
        let (params, planner) = test_planner(10, 4, 0.0, 0.0);
        params.set_iodepth(4);
        params.take_changed();
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine =
            AioEngine::new(file.as_raw_fd(), params, planner, stats.clone()).unwrap();
        for _ in 0..4 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert!(snap.blocks > 0);
        assert_eq!(snap.blocks, snap.blocks_read);
        assert_eq!(snap.kb_read, snap.blocks_read * 4);
        drop(engine);
        drop(dir);
    }

    #[test]
    fn test_aio_mixed_workload_accounts_both_directions() {
        let (dir, file) = open_test_file(10);
        let (params, planner) = test_planner(10, 4, 0.5, 1.0);
        params.set_iodepth(8);
        params.take_changed();
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine =
            AioEngine::new(file.as_raw_fd(), params, planner, stats.clone()).unwrap();
        for _ in 0..16 {
            engine.make_requests(&stop).unwrap();
        }

        let snap = stats.snapshot();
        assert!(snap.blocks_read > 0);
        assert!(snap.blocks_write > 0);
        assert_eq!(snap.blocks, snap.blocks_read + snap.blocks_write);
        drop(engine);
        drop(dir);
    }

    #[test]
    fn test_aio_iodepth_shrink_drains_high_slots() {
        let (dir, file) = open_test_file(10);
        let (params, planner) = test_planner(10, 4, 0.0, 0.0);
        params.set_iodepth(8);
        params.take_changed();
        let stats = Arc::new(SharedStats::new());
        let stop = AtomicBool::new(false);

        let mut engine =
            AioEngine::new(file.as_raw_fd(), params.clone(), planner, stats.clone()).unwrap();
        engine.make_requests(&stop).unwrap();

        params.set_iodepth(1);
        params.take_changed();
        for _ in 0..8 {
            engine.make_requests(&stop).unwrap();
        }
        // all slots above the new iodepth must have been reaped, not resubmitted
        let active_high = engine.slots[1..].iter().filter(|s| s.active).count();
        assert_eq!(active_high, 0);
        drop(engine);
        drop(dir);
    }
}
