//! Performance counter daemon client
//!
//! Talks the daemon's line protocol over local TCP: `reset` once on
//! connect, one `stats` request per interval (the reply carries a
//! `STATS: {...}` payload of up to 1 MiB), an `alive` probe when a reply
//! comes back empty, and `stop` on shutdown. Replies are re-emitted as
//! task records after the warm period, with the report sleep shifted by
//! TimeSync like any secondary instance.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use crate::util::time::{Clock, TimeSync};
use crate::Result;

const REPLY_BUFFER_SIZE: usize = 1024 * 1024;
const TASK_NAME: &str = "perfmon";

lazy_static! {
    static ref RE_STATS: Regex = Regex::new(r"STATS: \{(.+)").unwrap();
}

pub struct PerfmonClient {
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PerfmonClient {
    pub fn new(
        port: u16,
        clock: Arc<Clock>,
        warm_period_s: u64,
        stats_interval: u32,
        tsync: Option<Arc<TimeSync>>,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).context(
            "Connection failed. The performance counter daemon is not running",
        )?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        stream.write_all(b"reset").context("failed to send reset")?;
        debug!("message \"reset\" sent");

        let stop = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let thread = {
            let stop = stop.clone();
            let failure = failure.clone();
            thread::Builder::new()
                .name("perfmon-client".to_string())
                .spawn(move || {
                    if let Err(err) = client_loop(
                        &mut stream,
                        &clock,
                        warm_period_s,
                        stats_interval,
                        tsync.as_deref(),
                        &stop,
                    ) {
                        *failure.lock().unwrap() = Some(err);
                    }
                    let _ = stream.write_all(b"stop");
                    debug!("close connection");
                })
                .context("failed to spawn perfmon client thread")?
        };

        Ok(PerfmonClient {
            stop,
            failure,
            thread: Some(thread),
        })
    }

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

impl Drop for PerfmonClient {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn client_loop(
    stream: &mut TcpStream,
    clock: &Arc<Clock>,
    warm_period_s: u64,
    stats_interval: u32,
    tsync: Option<&TimeSync>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let interval_us = stats_interval as i64 * 1_000_000;
    let correction_clock = Clock::new();
    let mut report_shift_ms = 0i64;
    let mut buffer = vec![0u8; REPLY_BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let sleep_us = interval_us - correction_clock.us() as i64 + report_shift_ms * 1000;
        debug!("perfmon sleep for {} us", sleep_us);
        if sleep_us > 0 {
            thread::sleep(Duration::from_micros(sleep_us as u64));
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        correction_clock.reset();
        report_shift_ms = 0;

        stream.write_all(b"stats").context("failed to send stats")?;
        debug!("message \"stats\" sent");

        let n = stream
            .read(&mut buffer)
            .context("failed to read stats from the performance counter daemon")?;
        if n == 0 {
            warn!("failed to read stats from the performance counter daemon (zero bytes received)");
            stream.write_all(b"alive").context("failed to send alive")?;
            let n = stream
                .read(&mut buffer)
                .context("failed to read alive status")?;
            if n == 0 {
                bail!("failed to read alive status from the performance counter daemon");
            }
            continue;
        }

        let reply = String::from_utf8_lossy(&buffer[..n]);
        let clock_s = clock.s();
        if clock_s > warm_period_s {
            if let Some(cm) = RE_STATS.captures(&reply) {
                info!(
                    "Task {}, STATS: {{\"time\": {}, {}",
                    TASK_NAME,
                    clock_s - warm_period_s,
                    &cm[1]
                );
                if let Some(tsync) = tsync {
                    report_shift_ms = tsync.get_time_shift(TASK_NAME);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Minimal daemon stub speaking the reset/stats/stop protocol.
    fn spawn_daemon_stub() -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let msg = String::from_utf8_lossy(&buffer[..n]).into_owned();
                received.push(msg.clone());
                if msg == "stats" {
                    stream
                        .write_all(b"STATS: {\"cpu\": \"12.5\", \"iops\": \"900\"}")
                        .unwrap();
                } else if msg == "alive" {
                    stream.write_all(b"alive").unwrap();
                } else if msg == "stop" {
                    break;
                }
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_perfmon_protocol_roundtrip() {
        let (port, daemon) = spawn_daemon_stub();
        let clock = Arc::new(Clock::new());
        let client = PerfmonClient::new(port, clock, 0, 1, None).unwrap();
        thread::sleep(Duration::from_millis(1500));
        assert!(client.is_active().unwrap());
        client.stop();
        drop(client);

        let received = daemon.join().unwrap();
        assert_eq!(received.first().map(String::as_str), Some("reset"));
        assert!(received.iter().any(|m| m.contains("stats")));
        assert!(received.iter().any(|m| m.contains("stop")));
    }

    #[test]
    fn test_perfmon_connect_failure() {
        let clock = Arc::new(Clock::new());
        // a port with nothing listening
        let result = PerfmonClient::new(1, clock, 0, 1, None);
        assert!(result.is_err());
    }
}
