//! Execution clocks and cross-instance report alignment
//!
//! `Clock` measures elapsed time from a resettable origin and is shared by
//! every task of a run, so all "seconds since experiment start" values agree.
//! `TimeSync` turns the primary task's report times into the signed phase
//! shift a secondary instance should add to its next report sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use log::info;

/// Resettable monotonic clock
///
/// The supervisor resets the shared clock to `t=0` right before starting the
/// workload children, after the (possibly long) resource creation steps.
pub struct Clock {
    start: Mutex<Instant>,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            start: Mutex::new(Instant::now()),
        }
    }

    pub fn reset(&self) {
        *self.start.lock().unwrap() = Instant::now();
    }

    /// Whole seconds since the origin.
    pub fn s(&self) -> u64 {
        self.start.lock().unwrap().elapsed().as_secs()
    }

    /// Milliseconds since the origin.
    pub fn ms(&self) -> u64 {
        self.start.lock().unwrap().elapsed().as_millis() as u64
    }

    /// Microseconds since the origin.
    pub fn us(&self) -> u64 {
        self.start.lock().unwrap().elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Phase shifts below this magnitude are noise and reported as zero.
const FUZZY_MS: i64 = 100;

/// Report-phase reference shared by all tasks of a run
///
/// The primary timer task calls `new_report()` when it closes a stats
/// interval. Secondary tasks ask for `get_time_shift()` and forward the
/// returned millisecond value to their child's `shift_report_time` command,
/// nudging the child's next report sleep so that reports from all instances
/// cluster at the primary's phase.
pub struct TimeSync {
    interval_ms: i64,
    interval_ms_half: i64,
    base_time: Instant,
    have_report: AtomicBool,
    last_report_ms: AtomicU64,
}

impl TimeSync {
    pub fn new(stats_interval_s: u64) -> Self {
        let interval_ms = (stats_interval_s * 1000) as i64;
        TimeSync {
            interval_ms,
            interval_ms_half: interval_ms / 2,
            base_time: Instant::now(),
            have_report: AtomicBool::new(false),
            last_report_ms: AtomicU64::new(0),
        }
    }

    /// Record the reference report time (primary timer only).
    pub fn new_report(&self) {
        let now = self.base_time.elapsed().as_millis() as u64;
        self.last_report_ms.store(now, Ordering::Relaxed);
        self.have_report.store(true, Ordering::Release);
    }

    /// Signed millisecond shift that moves the caller's next report toward
    /// the reference phase, or 0 when no adjustment is warranted.
    ///
    /// A reference older than two intervals is stale and yields 0. The raw
    /// delta is reduced mod interval and mapped to
    /// `[-interval/2, +interval/2]`; anything inside the fuzzy band is 0.
    pub fn get_time_shift(&self, task_name: &str) -> i64 {
        if !self.have_report.load(Ordering::Acquire) {
            return 0;
        }

        let last = self.last_report_ms.load(Ordering::Relaxed) as i64;
        let now = self.base_time.elapsed().as_millis() as i64;
        let mut delta = now - last;
        if delta >= 2 * self.interval_ms {
            return 0;
        }
        delta %= self.interval_ms;
        if delta <= self.interval_ms_half {
            delta = -delta;
        } else {
            delta = self.interval_ms - delta;
        }
        if delta.abs() > FUZZY_MS {
            info!("Task {}, shift report time: {}", task_name, delta);
            delta
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_clock_reset() {
        let clock = Clock::new();
        sleep(Duration::from_millis(30));
        assert!(clock.ms() >= 30);
        clock.reset();
        assert!(clock.ms() < 30);
    }

    #[test]
    fn test_time_shift_without_report() {
        let tsync = TimeSync::new(1);
        assert_eq!(tsync.get_time_shift("a"), 0);
    }

    #[test]
    fn test_time_shift_in_fuzzy_band() {
        let tsync = TimeSync::new(1);
        tsync.new_report();
        sleep(Duration::from_millis(20));
        // 20ms behind the reference is within the 100ms fuzzy band
        assert_eq!(tsync.get_time_shift("a"), 0);
    }

    #[test]
    fn test_time_shift_maps_to_half_interval() {
        let tsync = TimeSync::new(1);
        tsync.new_report();
        sleep(Duration::from_millis(300));
        let shift = tsync.get_time_shift("a");
        // 300ms past the reference: pull the next report 300ms earlier
        assert!(shift <= -200 && shift >= -400, "shift = {}", shift);
    }

    #[test]
    fn test_time_shift_stale_reference() {
        let tsync = TimeSync::new(1);
        tsync.new_report();
        sleep(Duration::from_millis(2100));
        assert_eq!(tsync.get_time_shift("a"), 0);
    }
}
