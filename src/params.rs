//! Runtime-mutable engine parameters
//!
//! The command surface mutates a running workload: everything an engine
//! reads per request lives here behind relaxed atomics, and any mutation
//! raises the `changed` flag so the reporter skips one warm slot. The
//! members that must change together (block size, file blocks, bitmap,
//! random range) are not here: they form the planner tuple guarded by its
//! own mutex.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use clap::ValueEnum;

/// Upper bound for `iodepth`; also sizes the AIO slot pool and the prwv2
/// worker pool.
pub const MAX_IODEPTH: u32 = 128;

/// Selectable I/O engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Blocking read/write syscalls, iodepth fixed at 1
    Posix,
    /// Thread pool issuing preadv/pwritev2
    Prwv2,
    /// Kernel AIO (io_submit/io_getevents)
    Libaio,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Posix => write!(f, "posix"),
            EngineKind::Prwv2 => write!(f, "prwv2"),
            EngineKind::Libaio => write!(f, "libaio"),
        }
    }
}

/// Shared parameter block of one workload process
///
/// Immutable fields are set once from the CLI; the rest is mutated through
/// the setters by the command surface and observed by the engine controller
/// at its next tick (<= 200 ms later).
pub struct EngineParams {
    pub filename: String,
    pub io_engine: EngineKind,
    pub create_file: bool,
    pub delete_file: bool,
    pub o_direct: bool,
    pub o_dsync: bool,
    pub stats_interval: u32,
    pub duration: u32,

    filesize_mib: AtomicU64,
    block_size: AtomicU64,
    iodepth: AtomicU32,
    write_ratio: AtomicU64,
    random_ratio: AtomicU64,
    flush_blocks: AtomicU64,
    wait: AtomicBool,
    changed: AtomicBool,
}

impl EngineParams {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        filename: String,
        io_engine: EngineKind,
        create_file: bool,
        delete_file: bool,
        o_direct: bool,
        o_dsync: bool,
        stats_interval: u32,
        duration: u32,
        filesize_mib: u64,
        block_size: u64,
        iodepth: u32,
        write_ratio: f64,
        random_ratio: f64,
        flush_blocks: u64,
        wait: bool,
    ) -> Self {
        EngineParams {
            filename,
            io_engine,
            create_file,
            delete_file,
            o_direct,
            o_dsync,
            stats_interval,
            duration,
            filesize_mib: AtomicU64::new(filesize_mib),
            block_size: AtomicU64::new(block_size),
            iodepth: AtomicU32::new(iodepth),
            write_ratio: AtomicU64::new(write_ratio.to_bits()),
            random_ratio: AtomicU64::new(random_ratio.to_bits()),
            flush_blocks: AtomicU64::new(flush_blocks),
            wait: AtomicBool::new(wait),
            changed: AtomicBool::new(false),
        }
    }

    pub fn filesize_mib(&self) -> u64 {
        self.filesize_mib.load(Ordering::Relaxed)
    }

    /// Adopted from the existing file's length when not creating.
    pub fn set_filesize_mib(&self, value: u64) {
        self.filesize_mib.store(value, Ordering::Relaxed);
    }

    /// Block size in KiB.
    pub fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn set_block_size(&self, value: u64) {
        self.block_size.store(value, Ordering::Relaxed);
        self.mark_changed();
    }

    pub fn iodepth(&self) -> u32 {
        self.iodepth.load(Ordering::Relaxed)
    }

    pub fn set_iodepth(&self, value: u32) {
        self.iodepth.store(value, Ordering::Relaxed);
        self.mark_changed();
    }

    pub fn write_ratio(&self) -> f64 {
        f64::from_bits(self.write_ratio.load(Ordering::Relaxed))
    }

    pub fn set_write_ratio(&self, value: f64) {
        self.write_ratio.store(value.to_bits(), Ordering::Relaxed);
        self.mark_changed();
    }

    pub fn random_ratio(&self) -> f64 {
        f64::from_bits(self.random_ratio.load(Ordering::Relaxed))
    }

    pub fn set_random_ratio(&self, value: f64) {
        self.random_ratio.store(value.to_bits(), Ordering::Relaxed);
        self.mark_changed();
    }

    pub fn flush_blocks(&self) -> u64 {
        self.flush_blocks.load(Ordering::Relaxed)
    }

    pub fn set_flush_blocks(&self, value: u64) {
        self.flush_blocks.store(value, Ordering::Relaxed);
        self.mark_changed();
    }

    pub fn wait(&self) -> bool {
        self.wait.load(Ordering::Relaxed)
    }

    pub fn set_wait(&self, value: bool) {
        self.wait.store(value, Ordering::Relaxed);
    }

    /// Force a warm slot on the reporter.
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Relaxed);
    }

    /// Consume the changed flag; true means the reporter skips this slot.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }

    /// Config snapshot tail of the STATS line, in its fixed order.
    pub fn stat_string(&self) -> String {
        format!(
            "\"wait\":\"{}\", \"filesize\":\"{}\", \"block_size\":\"{}\", \
             \"iodepth\":\"{}\", \"flush_blocks\":\"{}\", \"write_ratio\":\"{}\", \
             \"random_ratio\":\"{}\"",
            self.wait(),
            self.filesize_mib(),
            self.block_size(),
            self.iodepth(),
            self.flush_blocks(),
            self.write_ratio(),
            self.random_ratio(),
        )
    }
}

#[cfg(test)]
pub(crate) fn test_params(io_engine: EngineKind) -> EngineParams {
    EngineParams::new(
        "/tmp/ioduel-test.dat".to_string(),
        io_engine,
        false,
        false,
        false,
        false,
        1,
        0,
        10,
        4,
        1,
        0.0,
        0.0,
        0,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_raises_changed() {
        let params = test_params(EngineKind::Posix);
        assert!(!params.take_changed());

        params.set_block_size(8);
        assert!(params.take_changed());
        assert!(!params.take_changed());

        // setting the current value still counts as a change
        params.set_block_size(8);
        assert!(params.take_changed());
    }

    #[test]
    fn test_wait_does_not_raise_changed() {
        let params = test_params(EngineKind::Posix);
        params.set_wait(true);
        assert!(params.wait());
        assert!(!params.take_changed());
    }

    #[test]
    fn test_ratio_roundtrip() {
        let params = test_params(EngineKind::Libaio);
        params.set_write_ratio(0.37);
        assert!((params.write_ratio() - 0.37).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stat_string_order() {
        let params = test_params(EngineKind::Posix);
        let s = params.stat_string();
        assert!(s.starts_with("\"wait\":\"false\""));
        assert!(s.contains("\"block_size\":\"4\""));
        assert!(s.ends_with("\"random_ratio\":\"0\""));
    }
}
