//! Engine controller
//!
//! Single owner of the workload file. Creates or adopts the file, enforces
//! the open-flag policy, then drives the selected engine from one controller
//! thread: wait mode, runtime parameter refresh, the engine tick and the
//! periodic `fdatasync` after `flush_blocks` written blocks.
//!
//! State machine: Starting -> Running <-> Waiting -> Stopping -> Stopped.
//! `stop()` is idempotent; dropping the controller joins the thread, closes
//! the file and removes it when this process created it.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use log::{debug, info};

use super::{AccessPlanner, IoEngine};
use crate::params::{EngineKind, EngineParams};
use crate::random::Randomizer;
use crate::stats::SharedStats;
use crate::util::buffer::{AlignedBuffer, DIRECT_IO_ALIGNMENT};
use crate::Result;

const CREATE_BUFFER_SIZE: usize = 1024 * 1024;

pub struct EngineController {
    params: Arc<EngineParams>,
    stats: Arc<SharedStats>,
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    thread: Option<thread::JoinHandle<()>>,
    file: Option<fs::File>,
    created: bool,
}

impl EngineController {
    pub fn new(params: Arc<EngineParams>) -> Result<Self> {
        let created = params.create_file;
        if created {
            create_file(&params)?;
        }
        check_file(&params)?;
        let file = open_file(&params)?;
        let fd = file.as_raw_fd();

        let planner = Arc::new(AccessPlanner::new(params.clone())?);
        let stats = Arc::new(SharedStats::new());
        let stop = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let thread = {
            let params = params.clone();
            let planner = planner.clone();
            let stats = stats.clone();
            let stop = stop.clone();
            let failure = failure.clone();
            thread::Builder::new()
                .name("engine-controller".to_string())
                .spawn(move || {
                    info!("initiating engine controller thread");
                    if let Err(err) = controller_loop(fd, &params, &planner, &stats, &stop) {
                        *failure.lock().unwrap() = Some(err);
                    }
                    stop.store(true, Ordering::Relaxed);
                    info!("engine controller thread finished");
                })
                .context("failed to spawn engine controller thread")?
        };

        Ok(EngineController {
            params,
            stats,
            stop,
            failure,
            thread: Some(thread),
            file: Some(file),
            created,
        })
    }

    pub fn stats(&self) -> Arc<SharedStats> {
        self.stats.clone()
    }

    /// False once the controller stopped; re-raises an engine failure.
    pub fn is_active(&self) -> Result<bool> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(!self.stop.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("close file");
        self.file.take();
        if self.created && self.params.delete_file {
            info!("delete file {}", self.params.filename);
            let _ = fs::remove_file(&self.params.filename);
        }
    }
}

fn controller_loop(
    fd: RawFd,
    params: &Arc<EngineParams>,
    planner: &Arc<AccessPlanner>,
    stats: &Arc<SharedStats>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    info!("using {} engine", params.io_engine);
    let mut engine = IoEngine::new(
        params.io_engine,
        fd,
        params.clone(),
        planner.clone(),
        stats.clone(),
    )?;

    let mut last_flush_writes = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if params.wait() {
            info!("engine controller thread in wait mode");
            engine.set_wait(true);
            while !stop.load(Ordering::Relaxed) && params.wait() {
                thread::sleep(Duration::from_millis(200));
            }
            engine.set_wait(false);
            if stop.load(Ordering::Relaxed) {
                break;
            }
            info!("exit wait mode");
        }

        planner.refresh_if_changed()?;
        engine.make_requests(stop)?;

        let flush_blocks = params.flush_blocks();
        if !stop.load(Ordering::Relaxed) && flush_blocks > 0 {
            let writes = stats.blocks_write();
            if writes - last_flush_writes >= flush_blocks {
                unsafe { libc::fdatasync(fd) };
                last_flush_writes = writes;
            }
        }
    }
    Ok(())
}

/// Write a random-filled file of `filesize` MiB with direct I/O.
fn create_file(params: &EngineParams) -> Result<()> {
    info!("creating file {}", params.filename);

    let mut buffer = AlignedBuffer::new(CREATE_BUFFER_SIZE, DIRECT_IO_ALIGNMENT);
    Randomizer::new().fill(buffer.as_mut_slice());

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o640)
            .custom_flags(libc::O_DIRECT)
            .open(&params.filename)
            .with_context(|| format!("can't create file {}", params.filename))?;
        use std::io::Write;
        for _ in 0..params.filesize_mib() {
            file.write_all(buffer.as_slice())
                .context("write error while creating file")?;
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&params.filename);
    }
    result
}

/// Stat the file, validate the block size against the filesystem, and adopt
/// the existing length when not creating.
fn check_file(params: &EngineParams) -> Result<()> {
    let md = fs::metadata(&params.filename)
        .with_context(|| format!("can't read file stats of {}", params.filename))?;

    if (params.block_size() * 1024) % md.blksize() != 0 {
        bail!("block size must be multiple of the filesystem's block size");
    }

    if !params.create_file {
        let size_mib = md.len() / 1024 / 1024;
        info!("File already created. Set --filesize={}.", size_mib);
        if size_mib < 10 {
            bail!("invalid --filesize (existing file is smaller than 10 MiB)");
        }
        params.set_filesize_mib(size_mib);
    }
    Ok(())
}

fn open_file(params: &EngineParams) -> Result<fs::File> {
    let mut extra_flags = 0;
    let mut flags_str = "O_RDWR".to_string();
    if params.o_direct {
        extra_flags |= libc::O_DIRECT;
        flags_str.push_str("|O_DIRECT");
    } else if params.io_engine == EngineKind::Libaio {
        bail!("libaio engine only supports --o_direct=true (O_DIRECT)");
    }
    if params.io_engine == EngineKind::Posix && params.o_dsync {
        extra_flags |= libc::O_DSYNC;
        flags_str.push_str("|O_DSYNC");
    }

    info!("opening file '{}' with flags {}", params.filename, flags_str);
    if params.o_dsync
        && (params.io_engine == EngineKind::Libaio || params.io_engine == EngineKind::Prwv2)
    {
        info!("write requests will use flag RWF_DSYNC");
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(extra_flags)
        .open(&params.filename)
        .with_context(|| format!("can't open file {}", params.filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_params(dir: &TempDir, engine: EngineKind, block_size: u64) -> Arc<EngineParams> {
        let path = dir.path().join("workload.dat");
        std::fs::write(&path, vec![0u8; 10 * 1024 * 1024]).unwrap();
        let params = EngineParams::new(
            path.to_string_lossy().into_owned(),
            engine,
            false,
            false,
            false,
            false,
            1,
            0,
            0,
            block_size,
            1,
            0.0,
            0.0,
            0,
            false,
        );
        Arc::new(params)
    }

    #[test]
    fn test_controller_adopts_existing_filesize() {
        let dir = TempDir::new().unwrap();
        let params = file_params(&dir, EngineKind::Posix, 4);
        let controller = EngineController::new(params.clone()).unwrap();
        assert_eq!(params.filesize_mib(), 10);
        assert!(controller.is_active().unwrap());
        controller.stop();
    }

    #[test]
    fn test_controller_runs_posix_engine() {
        let dir = TempDir::new().unwrap();
        let params = file_params(&dir, EngineKind::Posix, 4);
        let controller = EngineController::new(params).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(controller.stats().snapshot().blocks > 0);
        controller.stop();
    }

    #[test]
    fn test_controller_rejects_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.dat");
        std::fs::write(&path, vec![0u8; 1024 * 1024]).unwrap();
        let params = Arc::new(EngineParams::new(
            path.to_string_lossy().into_owned(),
            EngineKind::Posix,
            false,
            false,
            false,
            false,
            1,
            0,
            0,
            4,
            1,
            0.0,
            0.0,
            0,
            false,
        ));
        assert!(EngineController::new(params).is_err());
    }

    #[test]
    fn test_controller_rejects_libaio_without_o_direct() {
        let dir = TempDir::new().unwrap();
        let params = file_params(&dir, EngineKind::Libaio, 4);
        assert!(EngineController::new(params).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let params = file_params(&dir, EngineKind::Posix, 4);
        let controller = EngineController::new(params).unwrap();
        controller.stop();
        controller.stop();
        thread::sleep(Duration::from_millis(50));
        assert!(!controller.is_active().unwrap());
    }
}
