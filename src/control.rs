//! Runtime command surface of the workload generator
//!
//! Two sources feed one handler: a stdin reader thread and a Unix-domain
//! socket server that accepts one command per connection. The handler
//! validates and applies parameter mutations, flips wait mode, requests
//! report phase shifts, or stops the run. Successful mutations answer
//! `set k=v`; anything invalid answers `ERROR: ...` and never brings the
//! surface down.

use std::io::{BufRead, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::{debug, error, info, warn};

use crate::params::{EngineKind, EngineParams, MAX_IODEPTH};
use crate::report::{ReportShift, ShiftOutcome};
use crate::Result;

const SOCKET_BUFFER_SIZE: usize = 4096;

/// Validates and applies one command line
pub struct CommandHandler {
    params: Arc<EngineParams>,
    shift: Arc<ReportShift>,
    stop: Arc<AtomicBool>,
}

impl CommandHandler {
    pub fn new(
        params: Arc<EngineParams>,
        shift: Arc<ReportShift>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        CommandHandler {
            params,
            shift,
            stop,
        }
    }

    /// Apply one command; the returned string is the reply for the sender.
    pub fn handle(&self, command: &str) -> Result<String> {
        let command = command.trim();
        if command.is_empty() {
            bail!("invalid command");
        }

        if command == "stop" {
            info!("stop command received");
            self.stop.store(true, Ordering::Relaxed);
            return Ok("stop command received".to_string());
        }

        if command == "help" {
            return Ok(format!(
                "COMMANDS:\n\
                 \tstop               - terminate\n\
                 \twait               - (true|false)\n\
                 \tblock_size         - [4..]\n\
                 \tiodepth            - [1..{}]\n\
                 \twrite_ratio        - [0..1]\n\
                 \trandom_ratio       - [0..1]\n\
                 \tflush_blocks       - [0..]\n\
                 \tshift_report_time  - milliseconds",
                MAX_IODEPTH
            ));
        }

        if let Some(rest) = command.strip_prefix("shift_report_time ") {
            return self.handle_shift(rest);
        }

        let (name, value) = command
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid command: {}", command))?;
        let name = name.trim();
        let value = value.trim();

        match name {
            "wait" => {
                let parsed = parse_bool(value)?;
                self.params.set_wait(parsed);
                Ok(format!("set wait={}", parsed))
            }
            "block_size" => {
                let parsed: u64 = value.parse().context("invalid value for block_size")?;
                if parsed < 4 {
                    bail!("invalid block_size={} (must be >= 4)", parsed);
                }
                self.params.set_block_size(parsed);
                Ok(format!("set block_size={}", parsed))
            }
            "iodepth" => {
                if self.params.io_engine == EngineKind::Posix {
                    bail!("parameter iodepth is immutable for the posix engine");
                }
                let parsed: u32 = value.parse().context("invalid value for iodepth")?;
                if parsed == 0 || parsed > MAX_IODEPTH {
                    bail!("invalid iodepth={} (must be 1..{})", parsed, MAX_IODEPTH);
                }
                self.params.set_iodepth(parsed);
                Ok(format!("set iodepth={}", parsed))
            }
            "write_ratio" => {
                let parsed: f64 = value.parse().context("invalid value for write_ratio")?;
                if !(0.0..=1.0).contains(&parsed) {
                    bail!("invalid write_ratio={} (must be in [0,1])", parsed);
                }
                self.params.set_write_ratio(parsed);
                Ok(format!("set write_ratio={}", parsed))
            }
            "random_ratio" => {
                let parsed: f64 = value.parse().context("invalid value for random_ratio")?;
                if !(0.0..=1.0).contains(&parsed) {
                    bail!("invalid random_ratio={} (must be in [0,1])", parsed);
                }
                self.params.set_random_ratio(parsed);
                Ok(format!("set random_ratio={}", parsed))
            }
            "flush_blocks" => {
                let parsed: u64 = value.parse().context("invalid value for flush_blocks")?;
                self.params.set_flush_blocks(parsed);
                Ok(format!("set flush_blocks={}", parsed))
            }
            other => bail!("Invalid command: {}", other),
        }
    }

    fn handle_shift(&self, value: &str) -> Result<String> {
        let ms: i64 = value
            .trim()
            .parse()
            .context("invalid value for shift_report_time")?;
        let limit = 700 * self.params.stats_interval as i64;
        if ms.abs() >= limit {
            bail!(
                "Invalid shift time. Must be between -{} and {} ms.",
                limit,
                limit
            );
        }
        match self.shift.request(ms) {
            ShiftOutcome::Applied => Ok(format!("set shift_report_time = {}ms", ms)),
            ShiftOutcome::Overrode => Ok(format!("set shift_report_time = {}ms (overrided)", ms)),
            ShiftOutcome::Busy => bail!(
                "Failed to set shift_report_time = {}ms. The old value was not applied yet. \
                 Try again later.",
                ms
            ),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" | "" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("invalid boolean value: {}", other),
    }
}

/// stdin reader plus optional socket server feeding the handler
pub struct CommandReader {
    stop: Arc<AtomicBool>,
    socket_thread: Option<thread::JoinHandle<()>>,
    socket_path: Option<String>,
}

impl CommandReader {
    pub fn new(handler: Arc<CommandHandler>, socket_path: Option<String>) -> Result<Self> {
        let stop = handler.stop.clone();

        {
            // stdin thread: detached on purpose, a blocking read_line cannot
            // be interrupted; the run ends when stdin closes or stop is set
            let handler = handler.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("stdin-reader".to_string())
                .spawn(move || {
                    debug!("command reader thread initiated");
                    let stdin = std::io::stdin();
                    for line in stdin.lock().lines() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        match line {
                            Ok(line) => {
                                if line.trim().is_empty() {
                                    continue;
                                }
                                match handler.handle(&line) {
                                    Ok(reply) => info!("{}", reply),
                                    Err(err) => error!("{:#}", err),
                                }
                            }
                            Err(err) => {
                                warn!("stdin read error: {}", err);
                                break;
                            }
                        }
                    }
                    stop.store(true, Ordering::Relaxed);
                    debug!("command reader thread finished");
                })
                .context("failed to spawn stdin reader thread")?;
        }

        let socket_thread = match &socket_path {
            Some(path) => Some(spawn_socket_server(path, handler, stop.clone())?),
            None => None,
        };

        Ok(CommandReader {
            stop,
            socket_thread,
            socket_path,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CommandReader {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.socket_thread.take() {
            let _ = handle.join();
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn spawn_socket_server(
    path: &str,
    handler: Arc<CommandHandler>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    info!("initiating command socket: {}", path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind command socket {}", path))?;
    listener
        .set_nonblocking(true)
        .context("failed to set command socket non-blocking")?;

    let handle = thread::Builder::new()
        .name("command-socket".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(err) = serve_connection(stream, &handler) {
                            error!("socket exception: {:#}", err);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(err) => {
                        error!("command socket accept error: {}", err);
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
        .context("failed to spawn command socket thread")?;
    Ok(handle)
}

/// One connection carries one command; the reply is written back as a line.
fn serve_connection(mut stream: UnixStream, handler: &Arc<CommandHandler>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;

    let mut buffer = [0u8; SOCKET_BUFFER_SIZE];
    let n = stream.read(&mut buffer).context("socket read error")?;
    let message = String::from_utf8_lossy(&buffer[..n]);
    let command = message.lines().next().unwrap_or("").trim().to_string();
    info!("command received from socket: {}", command);

    let reply = match handler.handle(&command) {
        Ok(reply) => reply,
        Err(err) => format!("ERROR: {:#}", err),
    };
    stream
        .write_all(format!("{}\n", reply).as_bytes())
        .context("socket write error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;

    fn handler(engine: EngineKind) -> (Arc<EngineParams>, Arc<ReportShift>, CommandHandler) {
        let params = Arc::new(test_params(engine));
        let shift = Arc::new(ReportShift::new());
        let stop = Arc::new(AtomicBool::new(false));
        let h = CommandHandler::new(params.clone(), shift.clone(), stop);
        (params, shift, h)
    }

    #[test]
    fn test_set_block_size() {
        let (params, _, h) = handler(EngineKind::Libaio);
        assert_eq!(h.handle("block_size=16").unwrap(), "set block_size=16");
        assert_eq!(params.block_size(), 16);
        assert!(params.take_changed());
    }

    #[test]
    fn test_block_size_below_minimum_rejected() {
        let (params, _, h) = handler(EngineKind::Libaio);
        assert!(h.handle("block_size=2").is_err());
        assert_eq!(params.block_size(), 4);
    }

    #[test]
    fn test_iodepth_rejected_for_posix() {
        let (_, _, h) = handler(EngineKind::Posix);
        assert!(h.handle("iodepth=4").is_err());
    }

    #[test]
    fn test_iodepth_bounds() {
        let (params, _, h) = handler(EngineKind::Libaio);
        assert!(h.handle("iodepth=0").is_err());
        assert!(h.handle("iodepth=129").is_err());
        assert!(h.handle("iodepth=128").is_ok());
        assert_eq!(params.iodepth(), 128);
    }

    #[test]
    fn test_ratio_bounds() {
        let (_, _, h) = handler(EngineKind::Libaio);
        assert!(h.handle("write_ratio=1.1").is_err());
        assert!(h.handle("random_ratio=-0.1").is_err());
        assert!(h.handle("write_ratio=0.5").is_ok());
    }

    #[test]
    fn test_wait_does_not_flip_changed() {
        let (params, _, h) = handler(EngineKind::Posix);
        assert!(h.handle("wait=true").is_ok());
        assert!(params.wait());
        assert!(!params.take_changed());
    }

    #[test]
    fn test_stop_sets_flag() {
        let params = Arc::new(test_params(EngineKind::Posix));
        let shift = Arc::new(ReportShift::new());
        let stop = Arc::new(AtomicBool::new(false));
        let h = CommandHandler::new(params, shift, stop.clone());
        h.handle("stop").unwrap();
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (_, _, h) = handler(EngineKind::Posix);
        assert!(h.handle("frobnicate=1").is_err());
        assert!(h.handle("").is_err());
    }

    #[test]
    fn test_shift_bound() {
        // stats_interval = 1s: |shift| must stay below 700 ms
        let (_, _, h) = handler(EngineKind::Posix);
        assert!(h.handle("shift_report_time 700").is_err());
        assert!(h.handle("shift_report_time -700").is_err());
        assert!(h.handle("shift_report_time 699").is_ok());
    }

    #[test]
    fn test_shift_cas_then_override() {
        let (_, shift, h) = handler(EngineKind::Posix);
        assert!(h.handle("shift_report_time 100").is_ok());
        // pending value not consumed: two failed tries, then override
        assert!(h.handle("shift_report_time 200").is_err());
        assert!(h.handle("shift_report_time 200").is_err());
        let reply = h.handle("shift_report_time 200").unwrap();
        assert!(reply.contains("overrided"));
        assert_eq!(shift.take(), 200);
    }

    #[test]
    fn test_socket_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cmd.sock");
        let params = Arc::new(test_params(EngineKind::Libaio));
        let shift = Arc::new(ReportShift::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(CommandHandler::new(params.clone(), shift, stop.clone()));
        let thread =
            spawn_socket_server(&path.to_string_lossy(), handler, stop.clone()).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"iodepth=8\n").unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert_eq!(reply.trim(), "set iodepth=8");
        assert_eq!(params.iodepth(), 8);

        stop.store(true, Ordering::Relaxed);
        thread.join().unwrap();
    }
}
