//! Periodic stats reporter
//!
//! Every `stats_interval` seconds the reporter samples the shared counters
//! and emits one STATS line with the per-interval deltas and the current
//! config snapshot. Each sleep is corrected by the time the previous tick
//! consumed and by a pending phase shift, so the report cadence can be
//! nudged toward another instance's phase. After any parameter mutation one
//! interval is skipped (the warm slot), keeping every emitted delta
//! internally consistent.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use log::{debug, info};

use crate::params::EngineParams;
use crate::stats::SharedStats;
use crate::util::time::Clock;
use crate::Result;

const MAX_SHIFT_TRIES: u32 = 2;

pub enum ShiftOutcome {
    /// Stored while no other shift was pending
    Applied,
    /// A pending shift was replaced after `MAX_SHIFT_TRIES` failed attempts
    Overrode,
    /// A shift is still pending; the caller should retry later
    Busy,
}

/// One-shot phase shift mailbox between the command surface and the reporter
///
/// Writers compare-and-set against an empty (zero) mailbox; after two busy
/// attempts the pending value is overwritten. The reporter drains the
/// mailbox once per tick.
pub struct ReportShift {
    ms: AtomicI64,
    tries: AtomicU32,
}

impl ReportShift {
    pub fn new() -> Self {
        ReportShift {
            ms: AtomicI64::new(0),
            tries: AtomicU32::new(0),
        }
    }

    pub fn request(&self, value_ms: i64) -> ShiftOutcome {
        if self
            .ms
            .compare_exchange(0, value_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tries.store(0, Ordering::Relaxed);
            ShiftOutcome::Applied
        } else if self.tries.load(Ordering::Relaxed) >= MAX_SHIFT_TRIES {
            self.tries.store(0, Ordering::Relaxed);
            self.ms.store(value_ms, Ordering::Release);
            ShiftOutcome::Overrode
        } else {
            self.tries.fetch_add(1, Ordering::Relaxed);
            ShiftOutcome::Busy
        }
    }

    /// Consume the pending shift, leaving the mailbox empty.
    pub fn take(&self) -> i64 {
        self.ms.swap(0, Ordering::AcqRel)
    }
}

impl Default for ReportShift {
    fn default() -> Self {
        Self::new()
    }
}

/// Reporter thread handle
pub struct Reporter {
    thread: Option<thread::JoinHandle<()>>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    active: Arc<AtomicBool>,
}

impl Reporter {
    pub fn spawn(
        params: Arc<EngineParams>,
        stats: Arc<SharedStats>,
        shift: Arc<ReportShift>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let failure = Arc::new(Mutex::new(None));
        let active = Arc::new(AtomicBool::new(true));

        let thread = {
            let failure = failure.clone();
            let active = active.clone();
            thread::Builder::new()
                .name("reporter".to_string())
                .spawn(move || {
                    info!("report thread initiated");
                    if let Err(err) = report_loop(&params, &stats, &shift, &stop) {
                        *failure.lock().unwrap() = Some(err);
                    }
                    info!("report thread finished");
                    active.store(false, Ordering::Relaxed);
                })
                .context("failed to spawn report thread")?
        };

        Ok(Reporter {
            thread: Some(thread),
            failure,
            active,
        })
    }

    /// Re-raise a reporter failure on the caller (the main loop).
    pub fn check(&self) -> Result<()> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Join the thread, waiting up to ~2 s; a stuck sleep is detached.
    pub fn finish(mut self) {
        for _ in 0..20 {
            if !self.active.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        if let Some(handle) = self.thread.take() {
            if self.active.load(Ordering::Relaxed) {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

fn report_loop(
    params: &Arc<EngineParams>,
    stats: &Arc<SharedStats>,
    shift: &Arc<ReportShift>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let interval_us = params.stats_interval as i64 * 1_000_000;
    let exec_clock = Clock::new();
    let correction_clock = Clock::new();
    let mut last_ms = 0u64;
    let mut elapsed_stats = stats.snapshot();

    // the first interval is always a warm slot
    params.mark_changed();

    while !stop.load(Ordering::Relaxed) {
        let shift_us = shift.take() * 1000;
        let sleep_us = interval_us - correction_clock.us() as i64 + shift_us;
        if sleep_us >= 2 * interval_us {
            bail!("BUG: invalid sleep time in report thread: {}us", sleep_us);
        }
        debug!("report sleep_us = {}", sleep_us);
        if sleep_us > 0 {
            thread::sleep(Duration::from_micros(sleep_us as u64));
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        correction_clock.reset();

        let cur_ms = exec_clock.ms();
        let cur_stats = stats.snapshot();

        if !params.take_changed() {
            let elapsed_ms = (cur_ms - last_ms).max(1);
            let delta = cur_stats - elapsed_stats;
            info!(
                "STATS: {{\"time\":\"{}\", \"total_MiB/s\":\"{:.2}\", \"read_MiB/s\":\"{:.2}\", \
                 \"write_MiB/s\":\"{:.2}\", \"blocks/s\":\"{:.1}\", \"blocks_read/s\":\"{:.1}\", \
                 \"blocks_write/s\":\"{:.1}\", {}}}",
                exec_clock.s(),
                ((delta.kb_read + delta.kb_write) * 1000) as f64 / (elapsed_ms * 1024) as f64,
                (delta.kb_read * 1000) as f64 / (elapsed_ms * 1024) as f64,
                (delta.kb_write * 1000) as f64 / (elapsed_ms * 1024) as f64,
                (delta.blocks * 1000) as f64 / elapsed_ms as f64,
                (delta.blocks_read * 1000) as f64 / elapsed_ms as f64,
                (delta.blocks_write * 1000) as f64 / elapsed_ms as f64,
                params.stat_string(),
            );
        }
        // on a skipped slot the flag was consumed above; nothing is emitted

        elapsed_stats = cur_stats;
        last_ms = cur_ms;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{test_params, EngineKind};
    use crate::stats::Stats;

    #[test]
    fn test_shift_mailbox_cas() {
        let shift = ReportShift::new();
        assert!(matches!(shift.request(50), ShiftOutcome::Applied));
        assert!(matches!(shift.request(60), ShiftOutcome::Busy));
        assert!(matches!(shift.request(60), ShiftOutcome::Busy));
        assert!(matches!(shift.request(60), ShiftOutcome::Overrode));
        assert_eq!(shift.take(), 60);
        assert_eq!(shift.take(), 0);
    }

    #[test]
    fn test_shift_negative_value_applies() {
        let shift = ReportShift::new();
        assert!(matches!(shift.request(-80), ShiftOutcome::Applied));
        assert_eq!(shift.take(), -80);
    }

    #[test]
    fn test_reporter_runs_and_stops() {
        let params = Arc::new(test_params(EngineKind::Posix));
        let stats = Arc::new(SharedStats::new());
        let shift = Arc::new(ReportShift::new());
        let stop = Arc::new(AtomicBool::new(false));

        let reporter =
            Reporter::spawn(params.clone(), stats.clone(), shift, stop.clone()).unwrap();
        stats.add(&Stats::for_access(false, 4));
        thread::sleep(Duration::from_millis(100));
        reporter.check().unwrap();
        stop.store(true, Ordering::Relaxed);
        reporter.finish();
    }
}
